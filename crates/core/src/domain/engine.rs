//! Multichannel convolution engine
//!
//! The engine owns one [`ChannelConvolver`] per channel slot, up to
//! [`MAX_CHANNELS`]. The host first negotiates a block size and rate, then
//! delivers blocks of any length; blocks longer than the negotiated size are
//! split into consecutive sub-blocks.
//!
//! Reconfiguration is all-or-nothing: new state is built for every channel
//! before any of it is installed. If any channel fails, every channel is
//! left unconfigured and `process` reports [`EngineError::NotConfigured`]
//! until a later negotiation succeeds.

use crate::domain::audio::{EngineError, Result, SampleRate, StreamFormat};
use crate::domain::clip::ClipMonitor;
use crate::domain::config::{ChannelConfig, ConfigError, FilterConfig, MAX_CHANNELS};
use crate::domain::convolver::ChannelConvolver;
use crate::domain::impulse::ImpulseSource;
use crate::domain::plan_cache::PlanCache;
use tracing::{info, instrument, warn};

/// Block size and rate agreed with the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    pub block_size: usize,
    pub sample_rate: SampleRate,
}

pub struct EngineCoordinator {
    channels: Vec<ChannelConvolver>,
    negotiated: Option<Negotiated>,
    clip: ClipMonitor,
    plans: PlanCache,
    // Planar scratch for interleaved hosts, one block per channel slot
    planar_in: Vec<Vec<f32>>,
    planar_out: Vec<Vec<f32>>,
}

impl EngineCoordinator {
    /// Create an engine from resolved per-channel settings
    ///
    /// Slots past the end of `configs` pass their samples through.
    pub fn new(configs: Vec<ChannelConfig>, plans: PlanCache) -> Result<Self> {
        if configs.len() > MAX_CHANNELS {
            return Err(ConfigError::TooManyChannels {
                count: configs.len(),
                max: MAX_CHANNELS,
            }
            .into());
        }

        let mut channels: Vec<ChannelConvolver> = configs
            .into_iter()
            .enumerate()
            .map(|(index, config)| ChannelConvolver::new(index, config))
            .collect();
        channels.resize_with(MAX_CHANNELS, || ChannelConvolver::PassThrough);

        let filtered = channels.iter().filter(|c| !c.is_passthrough()).count();
        info!(filtered, "Convolution engine created");

        Ok(Self {
            channels,
            negotiated: None,
            clip: ClipMonitor::new(),
            plans,
            planar_in: Vec::new(),
            planar_out: Vec::new(),
        })
    }

    /// Load every impulse named by `config` and create the engine
    ///
    /// Plans listed in the configured plan cache are built up front.
    #[instrument(skip(config, source))]
    pub fn from_config(config: &FilterConfig, source: &dyn ImpulseSource) -> Result<Self> {
        let channels = config.resolve(source)?;
        let plans = match &config.wisdom_path {
            Some(path) if !path.as_os_str().is_empty() => PlanCache::load(path.clone()),
            _ => PlanCache::in_memory(),
        };
        Self::new(channels, plans)
    }

    /// Negotiate a full stream format with the host
    ///
    /// Streams wider than [`MAX_CHANNELS`] cannot be honored.
    pub fn negotiate(&mut self, format: &StreamFormat) -> Result<()> {
        format.validate()?;
        if usize::from(format.channels) > MAX_CHANNELS {
            return Err(EngineError::UnsupportedConfiguration(format!(
                "{} channels requested, maximum is {MAX_CHANNELS}",
                format.channels
            )));
        }
        self.on_block_size_negotiated(format.max_block_size, format.sample_rate)
    }

    /// Rebuild every channel for a new maximum block size and rate
    ///
    /// Called once the device parameters are known, and again whenever the
    /// host renegotiates them.
    #[instrument(skip(self))]
    pub fn on_block_size_negotiated(
        &mut self,
        max_block_size: usize,
        sample_rate: SampleRate,
    ) -> Result<()> {
        if max_block_size == 0 || sample_rate.hz() == 0 {
            return Err(EngineError::UnsupportedConfiguration(format!(
                "block size {max_block_size} at {} Hz",
                sample_rate.hz()
            )));
        }

        let mut rebuilt = Vec::with_capacity(self.channels.len());
        for channel in &self.channels {
            match channel.build_state(sample_rate.hz(), max_block_size, &mut self.plans) {
                Ok(state) => rebuilt.push(state),
                Err(e) => {
                    self.invalidate();
                    return Err(e);
                }
            }
        }

        for (channel, state) in self.channels.iter_mut().zip(rebuilt) {
            channel.install(state);
        }

        self.planar_in = vec![vec![0.0; max_block_size]; self.channels.len()];
        self.planar_out = vec![vec![0.0; max_block_size]; self.channels.len()];
        self.negotiated = Some(Negotiated {
            block_size: max_block_size,
            sample_rate,
        });

        self.plans.save();

        info!(
            block_size = max_block_size,
            rate = sample_rate.hz(),
            "Engine reconfigured"
        );
        Ok(())
    }

    /// Drop every channel's state after a failed reconfiguration
    fn invalidate(&mut self) {
        warn!("Reconfiguration failed, engine left unconfigured");
        for channel in &mut self.channels {
            channel.install(None);
        }
        self.negotiated = None;
    }

    pub fn negotiated(&self) -> Option<Negotiated> {
        self.negotiated
    }

    pub fn block_size(&self) -> Option<usize> {
        self.negotiated.map(|n| n.block_size)
    }

    pub fn sample_rate(&self) -> Option<SampleRate> {
        self.negotiated.map(|n| n.sample_rate)
    }

    pub fn channel(&self, index: usize) -> Option<&ChannelConvolver> {
        self.channels.get(index)
    }

    pub fn clip_monitor(&self) -> &ClipMonitor {
        &self.clip
    }

    pub fn plan_cache(&self) -> &PlanCache {
        &self.plans
    }

    /// Process one planar block: `inputs[channel][frame]`
    ///
    /// Every channel must carry the same number of frames, which may exceed
    /// the negotiated block size.
    pub fn process(&mut self, inputs: &[&[f32]], outputs: &mut [&mut [f32]]) -> Result<()> {
        let block_size = self.block_size().ok_or(EngineError::NotConfigured)?;

        if inputs.len() != outputs.len() || inputs.len() > self.channels.len() {
            return Err(EngineError::ChannelMismatch(format!(
                "{} input channels, {} output channels, {} supported",
                inputs.len(),
                outputs.len(),
                self.channels.len()
            )));
        }

        let frames = inputs.first().map_or(0, |c| c.len());
        if inputs.iter().any(|c| c.len() != frames) || outputs.iter().any(|c| c.len() != frames)
        {
            return Err(EngineError::ChannelMismatch(
                "channels carry different frame counts".to_string(),
            ));
        }

        let mut offset = 0;
        while offset < frames {
            let end = (offset + block_size).min(frames);
            for ((channel, input), output) in
                self.channels.iter_mut().zip(inputs).zip(outputs.iter_mut())
            {
                channel.process_block(&input[offset..end], &mut output[offset..end], &mut self.clip)?;
            }
            offset = end;
        }

        Ok(())
    }

    /// Process one interleaved block of `channels` samples per frame
    pub fn process_interleaved(
        &mut self,
        input: &[f32],
        output: &mut [f32],
        channels: usize,
    ) -> Result<()> {
        let block_size = self.block_size().ok_or(EngineError::NotConfigured)?;

        if channels == 0 || channels > self.channels.len() {
            return Err(EngineError::ChannelMismatch(format!(
                "{channels} channels, {} supported",
                self.channels.len()
            )));
        }
        if input.len() != output.len() || input.len() % channels != 0 {
            return Err(EngineError::ChannelMismatch(format!(
                "{} input samples, {} output samples for {channels} channels",
                input.len(),
                output.len()
            )));
        }

        let Self {
            channels: convolvers,
            clip,
            planar_in,
            planar_out,
            ..
        } = self;

        let chunk = block_size * channels;
        for (frames_in, frames_out) in input.chunks(chunk).zip(output.chunks_mut(chunk)) {
            let len = frames_in.len() / channels;

            for (ch, ((convolver, scratch_in), scratch_out)) in convolvers
                .iter_mut()
                .zip(planar_in.iter_mut())
                .zip(planar_out.iter_mut())
                .take(channels)
                .enumerate()
            {
                for (dst, frame) in scratch_in[..len].iter_mut().zip(frames_in.chunks_exact(channels)) {
                    *dst = frame[ch];
                }

                convolver.process_block(&scratch_in[..len], &mut scratch_out[..len], clip)?;

                for (src, frame) in scratch_out[..len].iter().zip(frames_out.chunks_exact_mut(channels)) {
                    frame[ch] = *src;
                }
            }
        }

        Ok(())
    }
}
