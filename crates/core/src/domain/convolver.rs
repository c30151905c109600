//! Per-channel overlap-add block convolution
//!
//! A filtering channel transforms each block (zero-padded to N), multiplies
//! it by the impulse spectrum, transforms back, and adds the full N-sample
//! result into a circular accumulator. The first `size` accumulated samples
//! are then emitted and cleared. With `N >= impulse_len + block_size - 1`
//! the circular result never wraps onto samples that are still pending, so
//! the emitted stream is the exact linear convolution.

use crate::domain::audio::{EngineError, Result};
use crate::domain::clip::ClipMonitor;
use crate::domain::config::ChannelConfig;
use crate::domain::impulse::{ImpulsePreparer, ImpulseResponse};
use crate::domain::plan_cache::PlanCache;
use crate::domain::transform::TransformEngine;
use num_complex::Complex32;
use tracing::{debug, trace};

/// Everything a filtering channel needs for one (rate, block size) pair
///
/// Built in one piece and swapped in whole; never patched in place.
pub struct ChannelState {
    transform: TransformEngine,
    impulse_spectrum: Vec<Complex32>,
    ring: Vec<f32>,
    /// Next sample to emit, always `< ring.len()`
    ring_position: usize,
    /// User gain divided by N, undoing the inverse transform scaling
    gain: f32,
    block_size: usize,
}

impl ChannelState {
    pub fn fft_size(&self) -> usize {
        self.transform.fft_size()
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn ring_position(&self) -> usize {
        self.ring_position
    }

    /// Pending overlap-add output, indexed from the start of the ring
    pub fn ring(&self) -> &[f32] {
        &self.ring
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }
}

/// A channel with an impulse response
pub struct FilterChannel {
    index: usize,
    impulse: ImpulseResponse,
    gain_db: f32,
    fft_size_hint: Option<usize>,
    state: Option<ChannelState>,
}

impl FilterChannel {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn impulse(&self) -> &ImpulseResponse {
        &self.impulse
    }

    /// Current state, `None` until the first reconfiguration
    pub fn state(&self) -> Option<&ChannelState> {
        self.state.as_ref()
    }

    fn build_state(
        &self,
        rate: u32,
        block_size: usize,
        plans: &mut PlanCache,
    ) -> Result<ChannelState> {
        let prepared = ImpulsePreparer::new(plans).prepare(
            &self.impulse,
            rate,
            self.gain_db,
            block_size,
            self.fft_size_hint,
        )?;

        debug!(
            channel = self.index,
            fft_size = prepared.fft_size,
            impulse_len = prepared.impulse_len,
            block_size,
            "Built channel state"
        );

        Ok(ChannelState {
            ring: vec![0.0; prepared.fft_size],
            ring_position: 0,
            gain: prepared.linear_gain / prepared.fft_size as f32,
            block_size,
            impulse_spectrum: prepared.spectrum,
            transform: prepared.transform,
        })
    }

    fn process_block(
        &mut self,
        input: &[f32],
        output: &mut [f32],
        clip: &mut ClipMonitor,
    ) -> Result<()> {
        let state = self.state.as_mut().ok_or(EngineError::NotConfigured)?;
        let size = input.len();
        if size > state.block_size {
            return Err(EngineError::UnsupportedConfiguration(format!(
                "block of {size} samples exceeds negotiated size {}",
                state.block_size
            )));
        }

        // Stale samples from the previous block must not reach the transform
        let time = state.transform.time_mut();
        time[..size].copy_from_slice(input);
        time[size..].fill(0.0);

        state.transform.forward()?;
        for (bin, impulse_bin) in state
            .transform
            .freq_mut()
            .iter_mut()
            .zip(state.impulse_spectrum.iter())
        {
            *bin *= *impulse_bin;
        }
        state.transform.inverse()?;

        // Overlap-add over the two contiguous regions of the ring
        let n = state.ring.len();
        let pos = state.ring_position;
        let gain = state.gain;
        let (to_end, wrapped) = state.transform.time().split_at(n - pos);
        for (acc, s) in state.ring[pos..].iter_mut().zip(to_end) {
            *acc += s * gain;
        }
        for (acc, s) in state.ring[..pos].iter_mut().zip(wrapped) {
            *acc += s * gain;
        }

        let first = size.min(n - pos);
        let rest = size - first;
        clip.inspect(
            self.index,
            state.ring[pos..pos + first].iter().chain(&state.ring[..rest]),
        );

        // Emit, then clear what was emitted so the next block adds onto zero
        output[..first].copy_from_slice(&state.ring[pos..pos + first]);
        state.ring[pos..pos + first].fill(0.0);
        output[first..].copy_from_slice(&state.ring[..rest]);
        state.ring[..rest].fill(0.0);

        state.ring_position = (pos + size) % n;
        trace!(
            channel = self.index,
            size,
            ring_position = state.ring_position,
            "Processed block"
        );
        Ok(())
    }
}

/// Convolution state machine for one channel
///
/// The variant is fixed at construction: a channel without an impulse
/// passes samples through forever.
pub enum ChannelConvolver {
    PassThrough,
    Filtering(Box<FilterChannel>),
}

impl ChannelConvolver {
    /// Create the convolver for channel `index`
    pub fn new(index: usize, config: ChannelConfig) -> Self {
        match config.impulse {
            Some(impulse) if !impulse.is_empty() => Self::Filtering(Box::new(FilterChannel {
                index,
                impulse,
                gain_db: config.gain_db,
                fft_size_hint: config.fft_size_hint,
                state: None,
            })),
            _ => Self::PassThrough,
        }
    }

    pub fn is_passthrough(&self) -> bool {
        matches!(self, Self::PassThrough)
    }

    pub fn filter(&self) -> Option<&FilterChannel> {
        match self {
            Self::PassThrough => None,
            Self::Filtering(channel) => Some(channel),
        }
    }

    /// State of a configured filtering channel
    pub fn state(&self) -> Option<&ChannelState> {
        self.filter().and_then(FilterChannel::state)
    }

    /// Build fresh state for a new rate and block size without installing it
    ///
    /// Returns `None` for pass-through channels, which have no state.
    pub fn build_state(
        &self,
        rate: u32,
        block_size: usize,
        plans: &mut PlanCache,
    ) -> Result<Option<ChannelState>> {
        match self {
            Self::PassThrough => Ok(None),
            Self::Filtering(channel) => channel.build_state(rate, block_size, plans).map(Some),
        }
    }

    /// Replace the current state; the previous one is dropped here
    pub fn install(&mut self, state: Option<ChannelState>) {
        if let Self::Filtering(channel) = self {
            channel.state = state;
        }
    }

    /// Rebuild this channel for a new rate and block size
    ///
    /// The old state stays in place until the new one is complete, so a
    /// failure leaves the channel as it was. Calling this repeatedly with
    /// the same parameters always yields a fresh, zeroed state.
    pub fn reconfigure(
        &mut self,
        rate: u32,
        block_size: usize,
        plans: &mut PlanCache,
    ) -> Result<()> {
        let state = self.build_state(rate, block_size, plans)?;
        self.install(state);
        Ok(())
    }

    /// Convolve one block of at most the negotiated block size
    ///
    /// `input` and `output` must have the same length.
    pub fn process_block(
        &mut self,
        input: &[f32],
        output: &mut [f32],
        clip: &mut ClipMonitor,
    ) -> Result<()> {
        if input.len() != output.len() {
            return Err(EngineError::ChannelMismatch(format!(
                "input has {} samples, output has {}",
                input.len(),
                output.len()
            )));
        }

        match self {
            Self::PassThrough => {
                output.copy_from_slice(input);
                Ok(())
            }
            Self::Filtering(channel) => channel.process_block(input, output, clip),
        }
    }
}
