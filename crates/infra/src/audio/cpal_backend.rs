//! CPAL device lookup and stream format negotiation
//!
//! The engine only runs on 32-bit float samples, so every stream this module
//! opens is an f32 stream.

use cpal::traits::{DeviceTrait, HostTrait};
use cpal::{BufferSize, StreamConfig as CpalStreamConfig, SupportedBufferSize};
use impulse_core::domain::audio::{EngineError, SampleRate, StreamFormat};
use impulse_core::domain::config::MAX_CHANNELS;
use std::fmt;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Block size used when neither the user nor the device expresses a preference
pub const DEFAULT_BLOCK_SIZE: usize = 512;

/// Errors raised while talking to the audio host
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("OS error: {0}")]
    OsError(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Stream error: {0}")]
    StreamError(String),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

pub type Result<T> = std::result::Result<T, BackendError>;

/// Which side of a device a stream uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Input => write!(f, "input"),
            Direction::Output => write!(f, "output"),
        }
    }
}

/// What the user asked for; unset fields fall back to the device default
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamRequest {
    pub input_device: Option<String>,
    pub output_device: Option<String>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
    pub block_size: Option<usize>,
}

/// One row of the device listing
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSummary {
    pub name: String,
    pub has_input: bool,
    pub has_output: bool,
    pub default_rate: Option<SampleRate>,
}

/// Pick a block size the device will accept
///
/// A requested size is clamped into the device's supported range.
pub fn negotiate_block_size(supported: &SupportedBufferSize, requested: Option<usize>) -> usize {
    let wanted = requested.unwrap_or(DEFAULT_BLOCK_SIZE).max(1);
    match supported {
        SupportedBufferSize::Range { min, max } => {
            let min = (*min as usize).max(1);
            let max = (*max as usize).max(min);
            let chosen = wanted.clamp(min, max);
            if chosen != wanted {
                debug!(wanted, chosen, "Block size clamped to device range");
            }
            chosen
        }
        SupportedBufferSize::Unknown => wanted,
    }
}

/// Translate a negotiated format into the CPAL stream description
pub fn to_cpal_config(format: &StreamFormat) -> CpalStreamConfig {
    CpalStreamConfig {
        channels: format.channels,
        sample_rate: format.sample_rate.hz(),
        buffer_size: BufferSize::Fixed(format.max_block_size as u32),
    }
}

/// Wrapper over the default CPAL host
pub struct CpalHost {
    host: cpal::Host,
}

impl Default for CpalHost {
    fn default() -> Self {
        Self::new()
    }
}

impl CpalHost {
    pub fn new() -> Self {
        let host = cpal::default_host();
        debug!("Using audio host: {:?}", host.id());
        Self { host }
    }

    /// List every device the host exposes
    pub fn devices(&self) -> Result<Vec<DeviceSummary>> {
        let devices = self
            .host
            .devices()
            .map_err(|e| BackendError::OsError(e.to_string()))?;

        let mut summaries = Vec::new();
        for device in devices {
            #[allow(deprecated)]
            let name = device
                .name()
                .unwrap_or_else(|_| "Unknown Device".to_string());
            let has_input = device.supported_input_configs().is_ok();
            let has_output = device.supported_output_configs().is_ok();
            if !has_input && !has_output {
                continue;
            }

            let default_rate = device
                .default_output_config()
                .or_else(|_| device.default_input_config())
                .ok()
                .map(|config| SampleRate::from_hz(config.sample_rate()));

            summaries.push(DeviceSummary {
                name,
                has_input,
                has_output,
                default_rate,
            });
        }

        info!("Found {} audio devices", summaries.len());
        Ok(summaries)
    }

    /// Find a device by name, or the default device for `direction`
    pub fn find_device(&self, name: Option<&str>, direction: Direction) -> Result<cpal::Device> {
        match name {
            Some(name) => {
                #[allow(deprecated)]
                let device = self
                    .host
                    .devices()
                    .map_err(|e| BackendError::OsError(e.to_string()))?
                    .find(|d| d.name().ok().as_deref() == Some(name));
                device.ok_or_else(|| BackendError::DeviceNotFound(name.to_string()))
            }
            None => {
                let device = match direction {
                    Direction::Input => self.host.default_input_device(),
                    Direction::Output => self.host.default_output_device(),
                };
                device.ok_or_else(|| {
                    BackendError::DeviceNotFound(format!("No default {direction} device"))
                })
            }
        }
    }

    /// Work out rate, channel count and block size for `device`
    pub fn negotiate_format(
        &self,
        device: &cpal::Device,
        direction: Direction,
        request: &StreamRequest,
    ) -> Result<StreamFormat> {
        let default_config = match direction {
            Direction::Input => device.default_input_config(),
            Direction::Output => device.default_output_config(),
        }
        .map_err(|e| BackendError::InvalidConfiguration(e.to_string()))?;

        if default_config.sample_format() != cpal::SampleFormat::F32 {
            warn!(
                format = ?default_config.sample_format(),
                "Device prefers a non-float format, requesting f32 anyway"
            );
        }

        let channels = request.channels.unwrap_or(default_config.channels());
        if usize::from(channels) > MAX_CHANNELS {
            return Err(BackendError::InvalidConfiguration(format!(
                "{channels} channels requested, maximum is {MAX_CHANNELS}"
            )));
        }

        let rate = request.sample_rate.unwrap_or(default_config.sample_rate());
        let block_size = negotiate_block_size(default_config.buffer_size(), request.block_size);

        let format = StreamFormat::new(SampleRate::from_hz(rate), channels, block_size);
        format.validate()?;

        info!(
            direction = %direction,
            rate,
            channels,
            block_size,
            "Negotiated stream format"
        );
        Ok(format)
    }
}
