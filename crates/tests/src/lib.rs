//! End-to-end tests across the workspace crates

#[cfg(test)]
mod engine_integration;
