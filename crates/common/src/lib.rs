//! ShardChat common library
//!
//! This crate contains shared code used across ShardChat components.

pub mod config;
pub mod error;
pub mod metrics;
pub mod telemetry;

// Re-export commonly used types
pub use config::ShardChatConfig;
pub use error::{Result, ShardChatError};
pub use metrics::{MetricsRegistry, METRICS};
