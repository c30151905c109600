//! Command-line front end for the convolution engine

pub mod render;
