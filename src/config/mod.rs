//! Configuration loading and parsing.
//!
//! This module provides YAML-based configuration for the scheduling engine.

mod error;
mod types;

pub use error::ConfigError;
pub use types::{EngineConfig, RetryConfig};
