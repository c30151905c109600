//! Host-facing audio types and the engine error taxonomy
//!
//! This module defines what the host negotiates with the engine (rate,
//! channel count, maximum block size) and the errors the engine can report.
//! Platform implementations (cpal) live in the `infra` crate.

use crate::domain::config::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while building or driving the convolution engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// Configuration was rejected before any audio was processed
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// An impulse response could not be loaded
    #[error("Could not read impulse {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The sinc interpolator refused the impulse
    #[error("Resampling error: {0}")]
    Resample(String),

    /// A transform plan rejected its buffers
    #[error("Transform error: {0}")]
    Transform(String),

    /// The host asked for a block size or rate the engine cannot honor
    #[error("Unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    /// `process` was called before a block size was negotiated
    #[error("Engine has not been configured with a block size and rate")]
    NotConfigured,

    /// Input and output blocks do not have the same shape
    #[error("Channel layout mismatch: {0}")]
    ChannelMismatch(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Audio sample rate in Hz
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleRate {
    Hz44100,
    Hz48000,
    Hz96000,
    Hz192000,
    Custom(u32),
}

impl SampleRate {
    pub fn hz(&self) -> u32 {
        match self {
            SampleRate::Hz44100 => 44100,
            SampleRate::Hz48000 => 48000,
            SampleRate::Hz96000 => 96000,
            SampleRate::Hz192000 => 192000,
            SampleRate::Custom(hz) => *hz,
        }
    }

    pub fn from_hz(hz: u32) -> Self {
        match hz {
            44100 => SampleRate::Hz44100,
            48000 => SampleRate::Hz48000,
            96000 => SampleRate::Hz96000,
            192000 => SampleRate::Hz192000,
            hz => SampleRate::Custom(hz),
        }
    }
}

/// Parameters agreed with the host before streaming starts
///
/// `max_block_size` is the largest number of frames per channel the host
/// intends to deliver in one call. Larger deliveries are still accepted and
/// split internally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFormat {
    pub sample_rate: SampleRate,
    pub channels: u16,
    pub max_block_size: usize,
}

impl StreamFormat {
    pub fn new(sample_rate: SampleRate, channels: u16, max_block_size: usize) -> Self {
        Self {
            sample_rate,
            channels,
            max_block_size,
        }
    }

    /// Reject combinations no engine could run with
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate.hz() == 0 {
            return Err(EngineError::UnsupportedConfiguration(
                "sample rate must be positive".to_string(),
            ));
        }
        if self.max_block_size == 0 {
            return Err(EngineError::UnsupportedConfiguration(
                "block size must be positive".to_string(),
            ));
        }
        if self.channels == 0 {
            return Err(EngineError::UnsupportedConfiguration(
                "stream must carry at least one channel".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for StreamFormat {
    fn default() -> Self {
        Self {
            sample_rate: SampleRate::Hz48000,
            channels: 2,
            max_block_size: 512,
        }
    }
}
