//! Trubble Common - Shared utilities: configuration, logging, redaction
//!
//! This crate provides common functionality used across all Trubble crates.

pub mod config;
pub mod logging;
pub mod redact;

pub use config::{
    AgentConfig, Config, ConfigBuilder, JobConfig, LoggingConfig, ReturnerConfig, SplunkConfig,
};
pub use logging::{init_logging, init_logging_with_layer};
