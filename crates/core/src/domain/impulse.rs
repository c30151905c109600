//! Impulse responses and their preparation for frequency-domain convolution
//!
//! Preparing an impulse means bringing it to the processing rate, choosing a
//! transform size large enough for overlap-add, and computing its spectrum.
//! The raw impulse is never modified: every preparation starts again from the
//! samples that were loaded.

use crate::domain::audio::{EngineError, Result};
use crate::domain::config::ConfigError;
use crate::domain::plan_cache::PlanCache;
use crate::domain::transform::TransformEngine;
use num_complex::Complex32;
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Amplitude ratio of one decibel (`10^(1/20)`)
pub const GAIN_STEP_PER_DB: f64 = 1.122_018_454_301_963_4;

/// Convert a gain in decibels to a linear amplitude factor
pub fn db_to_linear(gain_db: f32) -> f32 {
    GAIN_STEP_PER_DB.powf(f64::from(gain_db)) as f32
}

/// A finite impulse response at a known sample rate
///
/// Cloning is cheap: samples are shared and never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct ImpulseResponse {
    samples: Arc<[f32]>,
    sample_rate: u32,
}

impl ImpulseResponse {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
        }
    }

    /// A single unit sample, the identity filter
    pub fn unit(sample_rate: u32) -> Self {
        Self::new(vec![1.0], sample_rate)
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// An empty impulse marks a pass-through channel
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Where impulse samples come from
pub trait ImpulseSource {
    /// Load the raw samples behind `locator`
    fn load(&self, locator: &Path) -> Result<Vec<f32>>;
}

/// Headerless little-endian 32-bit float files
///
/// The sample count is the file size divided by four; a trailing partial
/// sample is ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawF32File;

impl ImpulseSource for RawF32File {
    #[instrument(skip(self))]
    fn load(&self, locator: &Path) -> Result<Vec<f32>> {
        let bytes = std::fs::read(locator).map_err(|source| EngineError::Io {
            path: locator.to_path_buf(),
            source,
        })?;

        let samples: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();

        debug!(
            path = %locator.display(),
            samples = samples.len(),
            "Loaded impulse"
        );
        Ok(samples)
    }
}

/// Pick the transform size for an impulse of `impulse_len` samples convolved
/// with blocks of up to `block_size` samples
///
/// Without a hint this is the smallest power of two that holds the full
/// linear convolution of one block. A hint is honored even when it is too
/// small or not a power of two (both only degrade quality or speed), but it
/// must at least hold one block.
pub fn choose_fft_size(
    impulse_len: usize,
    block_size: usize,
    size_hint: Option<usize>,
) -> std::result::Result<usize, ConfigError> {
    let required = impulse_len + block_size - 1;

    let Some(hint) = size_hint else {
        return Ok(required.next_power_of_two());
    };

    if hint < block_size {
        return Err(ConfigError::FftLengthBelowBlock {
            fft_length: hint,
            block_size,
        });
    }

    if hint < required {
        warn!(
            fft_length = hint,
            required, "fft_length too small, expect subpar results"
        );
    } else if !hint.is_power_of_two() {
        warn!(
            fft_length = hint,
            "fft_length not a power of two, expect subpar performance"
        );
    }

    Ok(hint)
}

/// Taps of the sinc interpolator
const SINC_LEN: usize = 256;

/// Upper bound on zero-fed calls while draining the interpolator
const MAX_FLUSHES: usize = 8;

fn sinc_parameters() -> SincInterpolationParameters {
    SincInterpolationParameters {
        sinc_len: SINC_LEN,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Cubic,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    }
}

/// Run `input` through a fresh interpolator, then feed silence until at
/// least `wanted` frames have come out
///
/// The whole input is one chunk; output that the interpolator holds back
/// during startup is recovered by the silent chunks that follow.
fn interpolate(input: &[f32], ratio: f64, wanted: usize) -> Result<Vec<f32>> {
    let mut resampler = SincFixedIn::<f32>::new(ratio, 1.0, sinc_parameters(), input.len(), 1)
        .map_err(|e| EngineError::Resample(e.to_string()))?;

    let mut output = resampler
        .process(&[input], None)
        .map_err(|e| EngineError::Resample(e.to_string()))?
        .into_iter()
        .next()
        .unwrap_or_default();

    let mut flushes = 0;
    while output.len() < wanted && flushes < MAX_FLUSHES {
        let tail = resampler
            .process_partial::<&[f32]>(None, None)
            .map_err(|e| EngineError::Resample(e.to_string()))?;
        if let Some(channel) = tail.first() {
            output.extend_from_slice(channel);
        }
        flushes += 1;
    }

    Ok(output)
}

/// Resample `samples` from `from_rate` to `to_rate` with a sinc interpolator
///
/// The result holds `ceil(len * ratio)` samples, aligned with the input
/// (tap `k` lands within a sample of `k * ratio`) and scaled by `1 / ratio`
/// so that the filter's loudness does not depend on the rate it runs at.
///
/// The interpolator delay is measured by running a unit sample through an
/// identical interpolator and locating its peak.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    if samples.is_empty() || from_rate == to_rate {
        return Ok(samples.to_vec());
    }

    let ratio = f64::from(to_rate) / f64::from(from_rate);
    let expected = (samples.len() as f64 * ratio).ceil() as usize;

    // Trailing silence lets the last taps clear the interpolator
    let mut padded = samples.to_vec();
    padded.resize(samples.len() + 2 * SINC_LEN, 0.0);
    let padded_frames = (padded.len() as f64 * ratio).ceil() as usize;

    let mut unit = vec![0.0f32; padded.len()];
    unit[0] = 1.0;
    let response = interpolate(&unit, ratio, padded_frames)?;
    let delay = response
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.abs().total_cmp(&b.1.abs()))
        .map_or(0, |(index, _)| index);

    let filtered = interpolate(&padded, ratio, delay + expected)?;

    let compensation = (1.0 / ratio) as f32;
    let mut resampled: Vec<f32> = filtered
        .into_iter()
        .skip(delay)
        .take(expected)
        .map(|s| s * compensation)
        .collect();
    resampled.resize(expected, 0.0);

    debug!(
        from_rate,
        to_rate,
        input = samples.len(),
        output = resampled.len(),
        delay,
        "Resampled impulse"
    );
    Ok(resampled)
}

/// An impulse ready for block convolution at a given rate and block size
pub struct PreparedImpulse {
    /// Transform size N
    pub fft_size: usize,
    /// N/2+1 bins of the zero-padded impulse
    pub spectrum: Vec<Complex32>,
    /// User gain as a linear factor (not yet divided by N)
    pub linear_gain: f32,
    /// Length of the impulse after resampling
    pub impulse_len: usize,
    /// Transform engine planned for `fft_size`, reused by the channel
    pub transform: TransformEngine,
}

/// Builds [`PreparedImpulse`]s, planning transforms through a shared cache
pub struct ImpulsePreparer<'a> {
    plans: &'a mut PlanCache,
}

impl<'a> ImpulsePreparer<'a> {
    pub fn new(plans: &'a mut PlanCache) -> Self {
        Self { plans }
    }

    /// Resample, size, pad and transform `impulse` for processing at
    /// `target_rate` in blocks of up to `block_size` samples
    pub fn prepare(
        &mut self,
        impulse: &ImpulseResponse,
        target_rate: u32,
        gain_db: f32,
        block_size: usize,
        size_hint: Option<usize>,
    ) -> Result<PreparedImpulse> {
        let resampled = resample(impulse.samples(), impulse.sample_rate(), target_rate)?;
        let fft_size = choose_fft_size(resampled.len(), block_size, size_hint)?;

        let mut transform = TransformEngine::new(fft_size, self.plans);

        // A hint shorter than the impulse truncates it
        let kept = resampled.len().min(fft_size);
        let time = transform.time_mut();
        time[..kept].copy_from_slice(&resampled[..kept]);
        time[kept..].fill(0.0);
        transform.forward()?;
        let spectrum = transform.freq().to_vec();

        debug!(
            impulse_len = resampled.len(),
            block_size, fft_size, gain_db, "Prepared impulse"
        );

        Ok(PreparedImpulse {
            fft_size,
            spectrum,
            linear_gain: db_to_linear(gain_db),
            impulse_len: resampled.len(),
            transform,
        })
    }
}
