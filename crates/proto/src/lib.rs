//! ShardChat wire types
//!
//! Value types exchanged between the caller, the coordinator and the shard
//! workers. Everything here is plain data and serializes with serde.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One role-attributed message in a conversation.
///
/// A `None` message marks the turn the model should generate; only the last
/// turn of a conversation may carry it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: String,
    pub message: Option<String>,
}

impl Turn {
    /// Create a completed turn
    pub fn new(role: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            message: Some(message.into()),
        }
    }

    /// Create the open turn the model will complete
    pub fn pending(role: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            message: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.message.is_none()
    }
}

/// Image preprocessing applied before the image reaches the model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformKind {
    /// Pad to a square, then resize
    #[default]
    PaddedResize,

    /// Resize the short side, then center-crop
    ResizedCenterCrop,
}

impl fmt::Display for TransformKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransformKind::PaddedResize => write!(f, "padded_resize"),
            TransformKind::ResizedCenterCrop => write!(f, "resized_center_crop"),
        }
    }
}

impl FromStr for TransformKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "padded_resize" => Ok(TransformKind::PaddedResize),
            "resized_center_crop" => Ok(TransformKind::ResizedCenterCrop),
            other => Err(format!("unknown image transform: {}", other)),
        }
    }
}

/// A generation request as accepted by every shard worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateRequest {
    /// Raw encoded image bytes, if the request is image-grounded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<Vec<u8>>,

    /// Conversation history, ending with the turn to generate
    pub turns: Vec<Turn>,

    /// Maximum number of tokens to generate
    pub max_gen_len: usize,

    /// Sampling temperature; 0 selects greedy decoding
    pub temperature: f32,

    /// Nucleus sampling threshold in (0, 1]
    pub top_p: f32,

    #[serde(rename = "transform_kind", default)]
    pub transform: TransformKind,

    /// Seed applied to every shard's sampler before decoding
    #[serde(default)]
    pub seed: u64,

    /// Extra strings that end the response when they appear in the output
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_symbols: Vec<String>,
}

impl GenerateRequest {
    /// Text-only request with the given sampling parameters
    pub fn new(turns: Vec<Turn>, max_gen_len: usize, temperature: f32, top_p: f32) -> Self {
        Self {
            image: None,
            turns,
            max_gen_len,
            temperature,
            top_p,
            transform: TransformKind::default(),
            seed: 0,
            stop_symbols: Vec::new(),
        }
    }

    pub fn with_image(mut self, image: Vec<u8>, transform: TransformKind) -> Self {
        self.image = Some(image);
        self.transform = transform;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_stop_symbols<I, S>(mut self, symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stop_symbols = symbols.into_iter().map(Into::into).collect();
        self
    }
}

/// One streamed emission: the response text so far.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialResult {
    pub text: String,
    pub end_of_content: bool,
}

impl PartialResult {
    /// A non-terminal emission
    pub fn partial(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            end_of_content: false,
        }
    }

    /// The final emission of a response
    pub fn terminal(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            end_of_content: true,
        }
    }
}
