//! Fixed-size real FFT with engine-owned buffers
//!
//! The engine holds one time-domain buffer of N samples and one spectrum of
//! N/2+1 bins. `forward` reads the time buffer and writes the spectrum,
//! `inverse` does the opposite. Neither is normalized: a forward/inverse
//! round trip scales the signal by N.

use crate::domain::audio::{EngineError, Result};
use crate::domain::plan_cache::{PlanCache, PlanPair};
use num_complex::Complex32;

pub struct TransformEngine {
    plans: PlanPair,
    time: Vec<f32>,
    freq: Vec<Complex32>,
    forward_scratch: Vec<Complex32>,
    inverse_scratch: Vec<Complex32>,
}

impl TransformEngine {
    /// Build an engine for transforms of `fft_size` samples
    pub fn new(fft_size: usize, plans: &mut PlanCache) -> Self {
        let plans = plans.plan(fft_size);
        let time = plans.forward.make_input_vec();
        let freq = plans.forward.make_output_vec();
        let forward_scratch = plans.forward.make_scratch_vec();
        let inverse_scratch = plans.inverse.make_scratch_vec();

        Self {
            plans,
            time,
            freq,
            forward_scratch,
            inverse_scratch,
        }
    }

    /// Transform size N, as planned
    pub fn fft_size(&self) -> usize {
        self.plans.forward.len()
    }

    pub fn time(&self) -> &[f32] {
        &self.time
    }

    pub fn time_mut(&mut self) -> &mut [f32] {
        &mut self.time
    }

    pub fn freq(&self) -> &[Complex32] {
        &self.freq
    }

    pub fn freq_mut(&mut self) -> &mut [Complex32] {
        &mut self.freq
    }

    /// Time buffer → spectrum. The time buffer is left unspecified.
    pub fn forward(&mut self) -> Result<()> {
        self.plans
            .forward
            .process_with_scratch(&mut self.time, &mut self.freq, &mut self.forward_scratch)
            .map_err(|e| EngineError::Transform(e.to_string()))
    }

    /// Spectrum → time buffer, scaled by N. The spectrum is left unspecified.
    pub fn inverse(&mut self) -> Result<()> {
        // A real signal has no imaginary DC (or Nyquist, for even N) part;
        // rounding can leave a residue the inverse plan would reject.
        if let Some(dc) = self.freq.first_mut() {
            dc.im = 0.0;
        }
        if self.fft_size() % 2 == 0 {
            if let Some(nyquist) = self.freq.last_mut() {
                nyquist.im = 0.0;
            }
        }

        self.plans
            .inverse
            .process_with_scratch(&mut self.freq, &mut self.time, &mut self.inverse_scratch)
            .map_err(|e| EngineError::Transform(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_sizes() {
        let mut plans = PlanCache::in_memory();
        let engine = TransformEngine::new(16, &mut plans);
        assert_eq!(engine.fft_size(), 16);
        assert_eq!(engine.time().len(), 16);
        assert_eq!(engine.freq().len(), 9);
    }

    #[test]
    fn test_roundtrip_scales_by_n() {
        let mut plans = PlanCache::in_memory();
        let mut engine = TransformEngine::new(8, &mut plans);

        let signal = [0.5, -1.0, 0.25, 0.0, 0.75, 0.1, -0.3, 0.9];
        engine.time_mut().copy_from_slice(&signal);
        engine.forward().unwrap();
        engine.inverse().unwrap();

        for (out, orig) in engine.time().iter().zip(signal.iter()) {
            assert!((out / 8.0 - orig).abs() < 1e-5);
        }
    }

    #[test]
    fn test_forward_of_unit_impulse_is_flat() {
        let mut plans = PlanCache::in_memory();
        let mut engine = TransformEngine::new(32, &mut plans);

        engine.time_mut().fill(0.0);
        engine.time_mut()[0] = 1.0;
        engine.forward().unwrap();

        for bin in engine.freq() {
            assert!((bin.re - 1.0).abs() < 1e-6);
            assert!(bin.im.abs() < 1e-6);
        }
    }

    #[test]
    fn test_non_power_of_two_size() {
        let mut plans = PlanCache::in_memory();
        let mut engine = TransformEngine::new(12, &mut plans);
        assert_eq!(engine.freq().len(), 7);

        let signal: Vec<f32> = (0..12).map(|i| i as f32 * 0.1).collect();
        engine.time_mut().copy_from_slice(&signal);
        engine.forward().unwrap();
        engine.inverse().unwrap();

        for (out, orig) in engine.time().iter().zip(signal.iter()) {
            assert!((out / 12.0 - orig).abs() < 1e-5);
        }
    }
}
