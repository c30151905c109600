//! Multichannel FIR convolution engine
//!
//! Each channel is convolved with its own impulse response using FFT
//! overlap-add. See [`domain::EngineCoordinator`] for the entry point.

pub mod domain;

pub use domain::*;
