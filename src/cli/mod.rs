//! Command line interface for the `hydra` binary.
//!
//! Argument parsing lives here so it can be unit tested without spawning
//! the binary.

pub mod args;

pub use args::{Args, Commands, ExecutionMode, RunConfig};
