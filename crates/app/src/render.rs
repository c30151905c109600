//! Offline rendering of raw interleaved f32 files

use impulse_core::domain::audio::{EngineError, SampleRate, StreamFormat};
use impulse_core::domain::config::{ConfigError, FilterConfig};
use impulse_core::domain::engine::EngineCoordinator;
use impulse_core::domain::impulse::{ImpulseSource, RawF32File};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{info, instrument};

#[derive(Debug, Error)]
pub enum RenderError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Could not write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Input holds {samples} samples, not a whole number of {channels}-channel frames")]
    PartialFrame { samples: usize, channels: u16 },
}

pub type Result<T> = std::result::Result<T, RenderError>;

/// Stream parameters for an offline render
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderJob {
    pub format: StreamFormat,
    /// Silent frames appended so the filter tails ring out
    pub tail_frames: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderSummary {
    pub frames: usize,
    pub clipped: bool,
}

/// Load a filter configuration, resolving relative impulse paths against the
/// directory holding the file
pub async fn load_config(path: &Path) -> Result<FilterConfig> {
    let mut config = FilterConfig::load_from_file(path).await?;
    let base = path.parent().unwrap_or_else(|| Path::new(""));

    for entry in &mut config.impulse {
        if let Some(impulse) = entry.path.as_mut() {
            if impulse.is_relative() && !impulse.as_os_str().is_empty() {
                *impulse = base.join(&*impulse);
            }
        }
    }
    if let Some(wisdom) = config.wisdom_path.as_mut() {
        if wisdom.is_relative() && !wisdom.as_os_str().is_empty() {
            *wisdom = base.join(&*wisdom);
        }
    }

    Ok(config)
}

/// Convolve interleaved `input` and return the interleaved result
///
/// The engine is negotiated for `job.format` first.
pub fn render(
    engine: &mut EngineCoordinator,
    job: &RenderJob,
    input: &[f32],
) -> Result<Vec<f32>> {
    let channels = usize::from(job.format.channels);
    if channels == 0 || input.len() % channels != 0 {
        return Err(RenderError::PartialFrame {
            samples: input.len(),
            channels: job.format.channels,
        });
    }

    engine.negotiate(&job.format)?;

    let mut padded = Vec::with_capacity(input.len() + job.tail_frames * channels);
    padded.extend_from_slice(input);
    padded.resize(input.len() + job.tail_frames * channels, 0.0);

    let mut output = vec![0.0f32; padded.len()];
    engine.process_interleaved(&padded, &mut output, channels)?;
    Ok(output)
}

/// Render `input_path` into `output_path` through the filters in `config`
#[instrument(skip(config))]
pub async fn render_file(
    config: &FilterConfig,
    input_path: &Path,
    output_path: &Path,
    job: RenderJob,
) -> Result<RenderSummary> {
    let mut engine = EngineCoordinator::from_config(config, &RawF32File)?;
    let input = RawF32File.load(input_path)?;

    let output = render(&mut engine, &job, &input)?;

    let bytes: Vec<u8> = output.iter().flat_map(|s| s.to_le_bytes()).collect();
    fs::write(output_path, bytes)
        .await
        .map_err(|source| RenderError::Write {
            path: output_path.to_path_buf(),
            source,
        })?;

    let summary = RenderSummary {
        frames: output.len() / usize::from(job.format.channels),
        clipped: engine.clip_monitor().has_clipped(),
    };
    info!(
        frames = summary.frames,
        clipped = summary.clipped,
        output = %output_path.display(),
        "Render complete"
    );
    Ok(summary)
}

impl RenderJob {
    pub fn new(sample_rate: u32, channels: u16, block_size: usize) -> Self {
        Self {
            format: StreamFormat::new(SampleRate::from_hz(sample_rate), channels, block_size),
            tail_frames: 0,
        }
    }

    pub fn with_tail(mut self, tail_frames: usize) -> Self {
        self.tail_frames = tail_frames;
        self
    }
}
