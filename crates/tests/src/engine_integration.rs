//! Integration tests for the convolution engine
//!
//! These tests drive the whole pipeline from a TOML file and raw impulse
//! files on disk to rendered output, the way the CLI does.

use impulse_app::render::{load_config, render, render_file, RenderError, RenderJob};
use impulse_core::domain::audio::{EngineError, SampleRate, StreamFormat};
use impulse_core::domain::config::{ChannelConfig, ConfigError};
use impulse_core::domain::engine::EngineCoordinator;
use impulse_core::domain::impulse::{ImpulseResponse, ImpulseSource, RawF32File};
use impulse_core::domain::plan_cache::PlanCache;
use impulse_infra::audio::to_cpal_config;
use std::path::Path;
use tempfile::TempDir;

fn write_raw(path: &Path, samples: &[f32]) {
    let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
    std::fs::write(path, bytes).unwrap();
}

fn read_raw(path: &Path) -> Vec<f32> {
    RawF32File.load(path).unwrap()
}

fn write_config(dir: &TempDir, contents: &str) -> std::path::PathBuf {
    let path = dir.path().join("filters.toml");
    std::fs::write(&path, contents).unwrap();
    path
}

fn generate_sine_wave(frequency: f32, sample_rate: u32, frames: usize) -> Vec<f32> {
    (0..frames)
        .map(|i| 2.0 * std::f32::consts::PI * frequency * i as f32 / sample_rate as f32)
        .map(|phase| phase.sin() * 0.5)
        .collect()
}

fn interleave(channels: &[&[f32]]) -> Vec<f32> {
    let frames = channels[0].len();
    (0..frames)
        .flat_map(|i| channels.iter().map(move |c| c[i]))
        .collect()
}

fn channel_of(interleaved: &[f32], channels: usize, index: usize) -> Vec<f32> {
    interleaved
        .iter()
        .skip(index)
        .step_by(channels)
        .copied()
        .collect()
}

// ============================================================================
// OFFLINE RENDER
// ============================================================================

#[tokio::test]
async fn test_render_file_delays_and_passes_through() {
    let dir = tempfile::tempdir().unwrap();
    write_raw(&dir.path().join("delay.raw"), &[0.0, 0.0, 0.0, 1.0]);
    let config_path = write_config(
        &dir,
        r#"
[[impulse]]
path = "delay.raw"
rate = 48000

[[impulse]]
path = ""
"#,
    );

    let left = generate_sine_wave(440.0, 48000, 1000);
    let right = generate_sine_wave(1000.0, 48000, 1000);
    let input_path = dir.path().join("in.raw");
    let output_path = dir.path().join("out.raw");
    write_raw(&input_path, &interleave(&[&left, &right]));

    let config = load_config(&config_path).await.unwrap();
    let job = RenderJob::new(48000, 2, 64).with_tail(3);
    let summary = render_file(&config, &input_path, &output_path, job)
        .await
        .unwrap();

    assert_eq!(summary.frames, 1003);
    assert!(!summary.clipped);

    let output = read_raw(&output_path);
    let out_left = channel_of(&output, 2, 0);
    let out_right = channel_of(&output, 2, 1);

    for i in 0..3 {
        assert!(out_left[i].abs() < 1e-5);
    }
    for i in 0..1000 {
        assert!(
            (out_left[i + 3] - left[i]).abs() < 1e-4,
            "frame {i}: got {}, expected {}",
            out_left[i + 3],
            left[i]
        );
        // Pass-through channels are bit-exact
        assert_eq!(out_right[i], right[i]);
    }
}

#[tokio::test]
async fn test_config_gain_is_applied() {
    let dir = tempfile::tempdir().unwrap();
    write_raw(&dir.path().join("unit.raw"), &[1.0]);
    let config_path = write_config(
        &dir,
        r#"
[[impulse]]
path = "unit.raw"
rate = 48000
gain = -6.0
"#,
    );

    let config = load_config(&config_path).await.unwrap();
    let mut engine = EngineCoordinator::from_config(&config, &RawF32File).unwrap();
    let input = generate_sine_wave(250.0, 48000, 300);
    let output = render(&mut engine, &RenderJob::new(48000, 1, 128), &input).unwrap();

    // -6 dB is an amplitude factor of about 0.501
    for (o, i) in output.iter().zip(&input) {
        assert!((o - i * 0.501_187).abs() < 1e-4);
    }
}

#[tokio::test]
async fn test_impulse_is_brought_to_stream_rate() {
    let dir = tempfile::tempdir().unwrap();
    // Boxcar averaging filter with unity DC gain, recorded at 24 kHz
    write_raw(&dir.path().join("boxcar.raw"), &[1.0 / 32.0; 32]);
    let config_path = write_config(
        &dir,
        r#"
[[impulse]]
path = "boxcar.raw"
rate = 24000
"#,
    );

    let config = load_config(&config_path).await.unwrap();
    let mut engine = EngineCoordinator::from_config(&config, &RawF32File).unwrap();
    let input = vec![0.5f32; 2048];
    let output = render(&mut engine, &RenderJob::new(48000, 1, 256), &input).unwrap();

    // 64 taps at 48 kHz plus one block: 64 + 256 - 1 rounds up to 512
    let state = engine.channel(0).unwrap().state().unwrap();
    assert_eq!(state.fft_size(), 512);

    // Loudness does not depend on the rate the filter runs at
    for &sample in &output[256..2048] {
        assert!((sample - 0.5).abs() < 0.03, "steady state drifted to {sample}");
    }
}

#[tokio::test]
async fn test_missing_impulse_names_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_config(
        &dir,
        r#"
[[impulse]]
path = "nowhere.raw"
rate = 48000
"#,
    );

    let config = load_config(&config_path).await.unwrap();
    let err = EngineCoordinator::from_config(&config, &RawF32File)
        .err()
        .unwrap();
    assert!(matches!(err, EngineError::Io { .. }));
    assert!(err.to_string().contains("nowhere.raw"));
}

#[tokio::test]
async fn test_too_many_channels_rejected_at_load() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_config(&dir, &"[[impulse]]\npath = \"\"\n".repeat(17));

    let err = load_config(&config_path).await.unwrap_err();
    assert!(matches!(
        err,
        RenderError::Config(ConfigError::TooManyChannels { count: 17, max: 16 })
    ));
}

#[tokio::test]
async fn test_short_fft_length_fails_at_negotiation() {
    let dir = tempfile::tempdir().unwrap();
    write_raw(&dir.path().join("unit.raw"), &[1.0]);
    let config_path = write_config(
        &dir,
        r#"
[[impulse]]
path = "unit.raw"
rate = 48000
fft_length = 32
"#,
    );

    let config = load_config(&config_path).await.unwrap();
    let mut engine = EngineCoordinator::from_config(&config, &RawF32File).unwrap();
    let err = render(&mut engine, &RenderJob::new(48000, 1, 64), &[0.0; 64]).unwrap_err();

    assert!(matches!(
        err,
        RenderError::Engine(EngineError::Config(ConfigError::FftLengthBelowBlock {
            fft_length: 32,
            block_size: 64
        }))
    ));
    assert!(engine.negotiated().is_none());
}

// ============================================================================
// PLAN CACHE
// ============================================================================

#[tokio::test]
async fn test_plan_cache_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    write_raw(&dir.path().join("short.raw"), &[0.25; 4]);
    let config_path = write_config(
        &dir,
        r#"
wisdom_path = "cache/plans.json"

[[impulse]]
path = "short.raw"
rate = 48000
"#,
    );

    let config = load_config(&config_path).await.unwrap();
    let mut engine = EngineCoordinator::from_config(&config, &RawF32File).unwrap();
    render(&mut engine, &RenderJob::new(48000, 1, 64), &[0.1; 64]).unwrap();

    let written = std::fs::read_to_string(dir.path().join("cache/plans.json")).unwrap();
    let json: serde_json::Value = serde_json::from_str(&written).unwrap();
    assert_eq!(json["fft_sizes"], serde_json::json!([128]));

    // A second engine plans the cached size before any negotiation
    let restarted = EngineCoordinator::from_config(&config, &RawF32File).unwrap();
    assert_eq!(restarted.plan_cache().sizes(), vec![128]);
}

#[tokio::test]
async fn test_corrupt_plan_cache_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("plans.json"), "not json at all").unwrap();
    write_raw(&dir.path().join("unit.raw"), &[1.0]);
    let config_path = write_config(
        &dir,
        r#"
wisdom_path = "plans.json"

[[impulse]]
path = "unit.raw"
rate = 48000
"#,
    );

    let config = load_config(&config_path).await.unwrap();
    let mut engine = EngineCoordinator::from_config(&config, &RawF32File).unwrap();
    assert!(engine.plan_cache().sizes().is_empty());

    let output = render(&mut engine, &RenderJob::new(48000, 1, 16), &[0.5; 16]).unwrap();
    assert!((output[0] - 0.5).abs() < 1e-5);
}

// ============================================================================
// HOST NEGOTIATION
// ============================================================================

#[test]
fn test_renegotiation_with_host_format() {
    let configs = vec![
        ChannelConfig::filtered(ImpulseResponse::new(vec![0.5, 0.5], 48000), 0.0),
        ChannelConfig::passthrough(),
        ChannelConfig::filtered(ImpulseResponse::new(vec![1.0; 8], 48000), -18.0),
    ];
    let mut engine = EngineCoordinator::new(configs, PlanCache::in_memory()).unwrap();

    let first = StreamFormat::new(SampleRate::Hz48000, 3, 128);
    let cpal_config = to_cpal_config(&first);
    assert_eq!(usize::from(cpal_config.channels), 3);
    engine.negotiate(&first).unwrap();

    let input = vec![0.2f32; 3 * 300];
    let mut output = vec![0.0f32; input.len()];
    engine.process_interleaved(&input, &mut output, 3).unwrap();

    // The device moves to 44.1 kHz with larger buffers; impulses are resampled
    let second = StreamFormat::new(SampleRate::Hz44100, 3, 256);
    engine.negotiate(&second).unwrap();
    assert_eq!(engine.sample_rate(), Some(SampleRate::Hz44100));
    assert_eq!(engine.block_size(), Some(256));

    let state = engine.channel(0).unwrap().state().unwrap();
    assert_eq!(state.ring_position(), 0);
    assert!(state.fft_size() >= 256 + 2 - 1);

    engine.process_interleaved(&input, &mut output, 3).unwrap();
    assert!(output.iter().all(|s| s.is_finite()));
    assert_eq!(channel_of(&output, 3, 1), vec![0.2f32; 300]);
}
