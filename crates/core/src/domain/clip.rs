//! One-shot clipping diagnostic

use tracing::warn;

/// First out-of-range sample seen by a [`ClipMonitor`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClipEvent {
    pub channel: usize,
    pub sample: f32,
}

/// Warns once, for the lifetime of the engine, when output leaves [-1, 1]
///
/// Purely advisory: samples are never clamped, and after the first warning
/// the monitor stops scanning.
#[derive(Debug, Default)]
pub struct ClipMonitor {
    first: Option<ClipEvent>,
}

impl ClipMonitor {
    pub const FULL_SCALE: f32 = 1.0;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_clipped(&self) -> bool {
        self.first.is_some()
    }

    pub fn first_clip(&self) -> Option<ClipEvent> {
        self.first
    }

    /// Scan samples about to be emitted on `channel`
    ///
    /// Returns `true` only for the call that raised the warning.
    pub fn inspect<'a, I>(&mut self, channel: usize, samples: I) -> bool
    where
        I: IntoIterator<Item = &'a f32>,
    {
        if self.first.is_some() {
            return false;
        }

        let Some(&sample) = samples.into_iter().find(|s| s.abs() > Self::FULL_SCALE) else {
            return false;
        };

        warn!(
            channel,
            sample, "clipping frame {sample}, consider reducing gain"
        );
        self.first = Some(ClipEvent { channel, sample });
        true
    }
}
