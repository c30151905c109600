//! Impulse CLI Application

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use impulse_app::render::{load_config, render_file, RenderJob};
use impulse_core::domain::config::FilterConfig;
use impulse_core::domain::engine::EngineCoordinator;
use impulse_core::domain::impulse::RawF32File;
use impulse_core::domain::plan_cache::PlanCache;
use impulse_infra::audio::{CpalHost, LiveInsert, StreamRequest};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "impulse")]
#[command(about = "Multichannel FIR convolution engine", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Convolve a raw interleaved f32 file
    Render(RenderArgs),
    /// Run the filters between a capture and a playback device
    Live(LiveArgs),
    /// List audio devices
    Devices,
    /// Load a configuration and its impulses without processing audio
    Check {
        /// Filter configuration (TOML)
        #[arg(short, long)]
        config: PathBuf,
        /// Write the validated configuration, with resolved paths, to this file
        #[arg(long)]
        write: Option<PathBuf>,
    },
}

#[derive(Args)]
struct RenderArgs {
    /// Filter configuration (TOML)
    #[arg(short, long)]
    config: PathBuf,
    /// Raw little-endian f32 input, interleaved
    input: PathBuf,
    /// Where to write the filtered output
    output: PathBuf,
    #[arg(long, default_value_t = 48000)]
    rate: u32,
    #[arg(long, default_value_t = 2)]
    channels: u16,
    #[arg(long, default_value_t = 512)]
    block_size: usize,
    /// Silent frames appended so filter tails are not cut off
    #[arg(long, default_value_t = 0)]
    tail: usize,
}

#[derive(Args)]
struct LiveArgs {
    /// Filter configuration (TOML)
    #[arg(short, long)]
    config: PathBuf,
    #[arg(long)]
    input_device: Option<String>,
    #[arg(long)]
    output_device: Option<String>,
    #[arg(long)]
    rate: Option<u32>,
    #[arg(long)]
    channels: Option<u16>,
    #[arg(long)]
    block_size: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Command::Render(args) => render(args).await,
        Command::Live(args) => live(args).await,
        Command::Devices => devices(),
        Command::Check { config, write } => check(config, write).await,
    }
}

async fn render(args: RenderArgs) -> Result<()> {
    let config = load_config(&args.config)
        .await
        .with_context(|| format!("loading {}", args.config.display()))?;
    let job = RenderJob::new(args.rate, args.channels, args.block_size).with_tail(args.tail);

    let summary = render_file(&config, &args.input, &args.output, job)
        .await
        .with_context(|| format!("rendering {}", args.input.display()))?;

    println!(
        "Rendered {} frames to {}{}",
        summary.frames,
        args.output.display(),
        if summary.clipped { " (clipped)" } else { "" }
    );
    Ok(())
}

async fn live(args: LiveArgs) -> Result<()> {
    let mut config = load_config(&args.config)
        .await
        .with_context(|| format!("loading {}", args.config.display()))?;
    // Plan ahead of the first callback when the config names no cache
    if config.wisdom_path.is_none() {
        config.wisdom_path = PlanCache::default_path();
    }
    let engine = build_engine(&config)?;

    let request = StreamRequest {
        input_device: args.input_device,
        output_device: args.output_device,
        sample_rate: args.rate,
        channels: args.channels,
        block_size: args.block_size,
    };

    let host = CpalHost::new();
    let insert = LiveInsert::start(&host, engine, &request).context("starting live insert")?;

    tracing::info!(
        rate = insert.format().sample_rate.hz(),
        channels = insert.format().channels,
        "Press Ctrl-C to stop"
    );
    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;

    drop(insert);
    Ok(())
}

fn devices() -> Result<()> {
    let host = CpalHost::new();
    for device in host.devices().context("enumerating devices")? {
        let direction = match (device.has_input, device.has_output) {
            (true, true) => "duplex",
            (true, false) => "input",
            _ => "output",
        };
        let rate = device
            .default_rate
            .map(|r| format!("{} Hz", r.hz()))
            .unwrap_or_else(|| "unknown rate".to_string());
        println!("{:<8} {:<14} {}", direction, rate, device.name);
    }
    Ok(())
}

async fn check(path: PathBuf, write: Option<PathBuf>) -> Result<()> {
    let config = load_config(&path)
        .await
        .with_context(|| format!("loading {}", path.display()))?;
    let engine = build_engine(&config)?;

    for index in 0..config.impulse.len() {
        match engine.channel(index).and_then(|c| c.filter()) {
            Some(filter) => println!(
                "channel {index}: {} taps at {} Hz",
                filter.impulse().len(),
                filter.impulse().sample_rate()
            ),
            None => println!("channel {index}: pass-through"),
        }
    }

    if let Some(target) = write {
        config
            .save_to_file(&target)
            .await
            .with_context(|| format!("writing {}", target.display()))?;
        println!("Wrote {}", target.display());
    }
    Ok(())
}

fn build_engine(config: &FilterConfig) -> Result<EngineCoordinator> {
    EngineCoordinator::from_config(config, &RawF32File).context("loading impulses")
}
