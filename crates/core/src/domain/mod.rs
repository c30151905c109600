//! Domain entities and business rules

pub mod audio;
pub mod clip;
pub mod config;
pub mod convolver;
pub mod engine;
pub mod impulse;
pub mod plan_cache;
pub mod transform;

pub use audio::{EngineError, SampleRate, StreamFormat};
pub use clip::{ClipEvent, ClipMonitor};
pub use config::{ChannelConfig, ConfigError, FilterConfig, ImpulseConfig, MAX_CHANNELS};
pub use convolver::{ChannelConvolver, ChannelState};
pub use engine::{EngineCoordinator, Negotiated};
pub use impulse::{db_to_linear, ImpulseResponse, ImpulseSource, RawF32File};
pub use plan_cache::PlanCache;
