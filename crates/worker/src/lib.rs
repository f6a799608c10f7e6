//! ShardChat Worker
//!
//! Everything one compute shard does for a chat request: render the turn
//! history into a prompt, decode with a seeded nucleus sampler over an
//! incremental model cache, and trim the output stream at the assistant's
//! turn separator.

pub mod backend;
pub mod conversation;
pub mod decoder;
pub mod sampling;
pub mod shard;
pub mod trimmer;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use backend::{BackendLoader, ImagePipeline, Model, ShardBackend, ShardTopology, Tokenizer};
pub use conversation::{ConversationPromptBuilder, ConversationTemplate, RenderedPrompt, SeparatorStyle};
pub use decoder::{DecodeState, DecodeStream, SamplingDecoder};
pub use sampling::{Sampler, SamplingParams};
pub use shard::{Role, ShardDigest, ShardFailure, ShardWorker, WorkerMessage, WorkerRequest};
pub use trimmer::StreamTrimmer;
