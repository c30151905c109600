//! Audio device plumbing for the convolution engine

pub mod audio;
