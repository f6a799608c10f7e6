//! External capabilities a shard runs against
//!
//! The neural network, the tokenizer and the image pipeline are opaque to
//! this crate. Implementations report failures as `anyhow::Error`; the
//! worker converts them into `ModelFailure` at its boundary.

use candle_core::Tensor;
use shardchat_proto::TransformKind;
use std::fmt;

/// Position of one shard in the worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShardTopology {
    pub rank: usize,
    pub world_size: usize,
}

impl ShardTopology {
    pub fn new(rank: usize, world_size: usize) -> Self {
        Self { rank, world_size }
    }

    /// Rank 0 is the shard whose output reaches the caller
    pub fn is_primary(&self) -> bool {
        self.rank == 0
    }
}

impl fmt::Display for ShardTopology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.rank, self.world_size)
    }
}

/// Autoregressive model with an incremental cache.
///
/// A call at `cache_position = k` assumes positions `[0, k)` are already
/// incorporated. Both calls return the logits for the next position.
pub trait Model: Send {
    /// Maximum number of positions, image tokens included
    fn context_window(&self) -> usize;

    /// Positions consumed by an image when one is supplied
    fn image_tokens(&self) -> usize {
        0
    }

    /// Side length the image pipeline should produce
    fn image_size(&self) -> usize {
        224
    }

    /// Run the whole prompt window from an empty cache
    fn forward_prefill(&mut self, tokens: &[u32], image: Option<&Tensor>) -> anyhow::Result<Tensor>;

    /// Run only the newly appended tokens
    fn forward_step(&mut self, new_tokens: &[u32], cache_position: usize) -> anyhow::Result<Tensor>;
}

/// Text to token id mapping.
pub trait Tokenizer: Send {
    fn encode(&self, text: &str, bos: bool, eos: bool) -> anyhow::Result<Vec<u32>>;

    fn decode(&self, ids: &[u32]) -> anyhow::Result<String>;

    fn eos_id(&self) -> u32;
}

/// Raw image bytes to model input.
pub trait ImagePipeline: Send {
    fn preprocess(&self, raw: &[u8], transform: TransformKind, target_size: usize) -> anyhow::Result<Tensor>;
}

/// Everything one shard needs to serve requests.
pub struct ShardBackend {
    pub model: Box<dyn Model>,
    pub tokenizer: Box<dyn Tokenizer>,
    pub images: Option<Box<dyn ImagePipeline>>,
}

impl ShardBackend {
    pub fn new(model: Box<dyn Model>, tokenizer: Box<dyn Tokenizer>) -> Self {
        Self {
            model,
            tokenizer,
            images: None,
        }
    }

    pub fn with_images(mut self, images: Box<dyn ImagePipeline>) -> Self {
        self.images = Some(images);
        self
    }
}

/// Builds the backend of a shard on its own worker thread.
pub trait BackendLoader: Send + Sync {
    fn load(&self, topology: ShardTopology) -> anyhow::Result<ShardBackend>;
}

impl<F> BackendLoader for F
where
    F: Fn(ShardTopology) -> anyhow::Result<ShardBackend> + Send + Sync,
{
    fn load(&self, topology: ShardTopology) -> anyhow::Result<ShardBackend> {
        self(topology)
    }
}
