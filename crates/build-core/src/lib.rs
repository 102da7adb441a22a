//! build-core - domain types and pure policy for the build pipeline.
//!
//! Nothing in this crate performs I/O beyond reading a config file.

pub mod classifier;
pub mod config;
pub mod events;
pub mod retry;
pub mod types;

pub use config::Config;
pub use retry::{FailReason, NextAction, RetryPolicy};
pub use types::*;
