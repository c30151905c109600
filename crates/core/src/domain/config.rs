//! Filter configuration
//!
//! This module provides:
//! - The TOML document describing one impulse per channel
//! - Validation of that document (unknown keys, channel limit, rates)
//! - Resolution of the document into per-channel settings with loaded impulses

use crate::domain::audio::EngineError;
use crate::domain::impulse::{ImpulseResponse, ImpulseSource};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, instrument, warn};

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Maximum number of channels one engine can filter
pub const MAX_CHANNELS: usize = 16;

/// Errors that can occur while reading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("too many impulses specified ({count}), maximum is {max} channels")]
    TooManyChannels { count: usize, max: usize },

    #[error("impulse {} has no specified rate", .path.display())]
    MissingRate { path: PathBuf },

    #[error("channel {channel}: fft_length must be positive")]
    InvalidFftLength { channel: usize },

    #[error("fft_length {fft_length} cannot hold a block of {block_size} samples")]
    FftLengthBelowBlock { fft_length: usize, block_size: usize },
}

/// One entry of the `impulse` array
///
/// An absent or empty `path` makes the channel pass its samples through.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImpulseConfig {
    /// Raw little-endian f32 impulse file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    /// Sample rate the impulse was recorded at
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate: Option<u32>,

    /// Gain in dB
    #[serde(default)]
    pub gain: f32,

    /// Transform size override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fft_length: Option<usize>,
}

impl ImpulseConfig {
    /// Path of the impulse, if this channel is filtered
    pub fn impulse_path(&self) -> Option<&Path> {
        self.path
            .as_deref()
            .filter(|p| !p.as_os_str().is_empty())
    }

    pub fn is_passthrough(&self) -> bool {
        self.impulse_path().is_none()
    }
}

/// Complete filter configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterConfig {
    /// Where to persist transform plans (none = keep them in memory)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wisdom_path: Option<PathBuf>,

    /// Per-channel impulses, in channel order
    #[serde(default)]
    pub impulse: Vec<ImpulseConfig>,
}

impl FilterConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from TOML file
    #[instrument(skip(path))]
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = fs::read_to_string(path).await?;
        let config = Self::from_toml_str(&contents)?;

        debug!(
            channels = config.impulse.len(),
            "Configuration loaded successfully"
        );
        Ok(config)
    }

    /// Save configuration to TOML file
    #[instrument(skip(self, path))]
    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        info!(path = %path.display(), "Saving configuration");

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let toml_str =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        fs::write(path, toml_str).await?;
        Ok(())
    }

    /// Check everything that can be checked without touching impulse files
    pub fn validate(&self) -> Result<()> {
        if self.impulse.len() > MAX_CHANNELS {
            return Err(ConfigError::TooManyChannels {
                count: self.impulse.len(),
                max: MAX_CHANNELS,
            });
        }

        for (channel, entry) in self.impulse.iter().enumerate() {
            if entry.fft_length == Some(0) {
                return Err(ConfigError::InvalidFftLength { channel });
            }

            if let Some(path) = entry.impulse_path() {
                if entry.rate.unwrap_or(0) == 0 {
                    return Err(ConfigError::MissingRate {
                        path: path.to_path_buf(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Load every impulse and produce per-channel settings
    ///
    /// Fails on the first impulse that cannot be loaded; impulses already
    /// loaded are dropped with the partial result.
    pub fn resolve(
        &self,
        source: &dyn ImpulseSource,
    ) -> std::result::Result<Vec<ChannelConfig>, EngineError> {
        self.validate()?;

        self.impulse
            .iter()
            .enumerate()
            .map(|(channel, entry)| {
                let Some(path) = entry.impulse_path() else {
                    return Ok(ChannelConfig::passthrough());
                };
                let Some(rate) = entry.rate.filter(|&r| r > 0) else {
                    return Err(ConfigError::MissingRate {
                        path: path.to_path_buf(),
                    }
                    .into());
                };

                let samples = source.load(path)?;
                if samples.is_empty() {
                    warn!(channel, path = %path.display(), "Impulse is empty, passing channel through");
                }

                Ok(ChannelConfig {
                    impulse: Some(ImpulseResponse::new(samples, rate)),
                    gain_db: entry.gain,
                    fft_size_hint: entry.fft_length,
                })
            })
            .collect()
    }
}

/// Settings for one channel, with its impulse loaded
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelConfig {
    pub impulse: Option<ImpulseResponse>,
    pub gain_db: f32,
    pub fft_size_hint: Option<usize>,
}

impl ChannelConfig {
    pub fn passthrough() -> Self {
        Self::default()
    }

    pub fn filtered(impulse: ImpulseResponse, gain_db: f32) -> Self {
        Self {
            impulse: Some(impulse),
            gain_db,
            fft_size_hint: None,
        }
    }

    pub fn with_fft_size_hint(mut self, fft_size: usize) -> Self {
        self.fft_size_hint = Some(fft_size);
        self
    }

    /// True when the channel has a non-empty impulse
    pub fn is_filtered(&self) -> bool {
        self.impulse.as_ref().is_some_and(|i| !i.is_empty())
    }
}
