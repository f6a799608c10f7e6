//! ShardChat Coordinator
//!
//! Drives a pool of shard workers in lock-step and exposes each request as a
//! single ordered response stream.

pub mod orchestrator;
pub mod stream;

pub use orchestrator::Orchestrator;
pub use stream::ResponseStream;
