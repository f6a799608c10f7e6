//! Deterministic fakes of the external capabilities
//!
//! `ScriptedModel` emits a fixed token script as peaked logits and checks
//! that callers respect its cache positions. `CharTokenizer` maps every
//! character to its own token id.

use crate::backend::{ImagePipeline, Model, Tokenizer};
use anyhow::{anyhow, bail};
use candle_core::{DType, Device, Tensor};
use parking_lot::Mutex;
use shardchat_proto::TransformKind;
use std::sync::Arc;
use std::time::Duration;

pub const BOS_ID: u32 = 1;
pub const EOS_ID: u32 = 2;
const CHAR_OFFSET: u32 = 3;

/// One token per character, offset past the special ids
#[derive(Debug, Clone, Copy, Default)]
pub struct CharTokenizer;

impl CharTokenizer {
    pub fn new() -> Self {
        Self
    }

    /// Token ids of `text`, without special tokens
    pub fn script(&self, text: &str) -> Vec<u32> {
        text.chars().map(|c| c as u32 + CHAR_OFFSET).collect()
    }
}

impl Tokenizer for CharTokenizer {
    fn encode(&self, text: &str, bos: bool, eos: bool) -> anyhow::Result<Vec<u32>> {
        let mut ids = Vec::with_capacity(text.len() + 2);
        if bos {
            ids.push(BOS_ID);
        }
        ids.extend(self.script(text));
        if eos {
            ids.push(EOS_ID);
        }
        Ok(ids)
    }

    fn decode(&self, ids: &[u32]) -> anyhow::Result<String> {
        ids.iter()
            .filter(|id| **id >= CHAR_OFFSET)
            .map(|id| char::from_u32(id - CHAR_OFFSET).ok_or_else(|| anyhow!("token {} is not a character", id)))
            .collect()
    }

    fn eos_id(&self) -> u32 {
        EOS_ID
    }
}

/// A model call as observed by `ScriptedModel`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelCall {
    Prefill { tokens: usize, image: bool },
    Step { tokens: usize, cache_position: usize },
}

/// Replays a token script, then emits end-of-sequence.
///
/// The script restarts at every prefill, so one model serves many requests.
#[derive(Debug, Clone)]
pub struct ScriptedModel {
    context_window: usize,
    image_tokens: usize,
    script: Vec<u32>,
    eos_id: u32,
    vocab_size: usize,
    margin: f32,
    cursor: usize,
    incorporated: usize,
    delay: Option<Duration>,
    fail_at: Option<usize>,
    failures_left: Option<usize>,
    calls: Arc<Mutex<Vec<ModelCall>>>,
}

impl ScriptedModel {
    pub fn new(context_window: usize, script: Vec<u32>, eos_id: u32) -> Self {
        let vocab_size = script.iter().copied().chain([eos_id]).max().unwrap_or(eos_id) as usize + 1;
        Self {
            context_window,
            image_tokens: 0,
            script,
            eos_id,
            vocab_size,
            margin: 20.0,
            cursor: 0,
            incorporated: 0,
            delay: None,
            fail_at: None,
            failures_left: None,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_image_tokens(mut self, image_tokens: usize) -> Self {
        self.image_tokens = image_tokens;
        self
    }

    /// Logit lead of the scripted token over every other token.
    ///
    /// A small margin leaves real probability mass on the whole vocabulary,
    /// so sampled output depends on the seed.
    pub fn with_margin(mut self, margin: f32) -> Self {
        self.margin = margin;
        self
    }

    /// Sleep before answering the prefill of every request
    pub fn with_prefill_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail the `call`-th model call (0 = prefill) of every request
    pub fn failing_at(mut self, call: usize) -> Self {
        self.fail_at = Some(call);
        self
    }

    /// Like `failing_at`, but only for the first `times` requests
    pub fn failing_at_times(mut self, call: usize, times: usize) -> Self {
        self.fail_at = Some(call);
        self.failures_left = Some(times);
        self
    }

    /// Shared log of every call this model (and its clones) received
    pub fn call_log(&self) -> Arc<Mutex<Vec<ModelCall>>> {
        self.calls.clone()
    }

    pub fn calls(&self) -> Vec<ModelCall> {
        self.calls.lock().clone()
    }

    fn check_failure(&mut self, call: usize) -> anyhow::Result<()> {
        if self.fail_at != Some(call) {
            return Ok(());
        }
        match self.failures_left.as_mut() {
            Some(0) => Ok(()),
            Some(left) => {
                *left -= 1;
                bail!("scripted failure at call {}", call)
            }
            None => bail!("scripted failure at call {}", call),
        }
    }

    fn next_logits(&mut self) -> anyhow::Result<Tensor> {
        let target = self.script.get(self.cursor).copied().unwrap_or(self.eos_id);
        self.cursor += 1;

        let mut logits = vec![0.0f32; self.vocab_size];
        logits[target as usize] = self.margin;
        Ok(Tensor::from_vec(logits, self.vocab_size, &Device::Cpu)?)
    }
}

impl Model for ScriptedModel {
    fn context_window(&self) -> usize {
        self.context_window
    }

    fn image_tokens(&self) -> usize {
        self.image_tokens
    }

    fn forward_prefill(&mut self, tokens: &[u32], image: Option<&Tensor>) -> anyhow::Result<Tensor> {
        self.calls.lock().push(ModelCall::Prefill {
            tokens: tokens.len(),
            image: image.is_some(),
        });
        self.cursor = 0;
        self.incorporated = tokens.len();

        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        self.check_failure(0)?;
        self.next_logits()
    }

    fn forward_step(&mut self, new_tokens: &[u32], cache_position: usize) -> anyhow::Result<Tensor> {
        self.calls.lock().push(ModelCall::Step {
            tokens: new_tokens.len(),
            cache_position,
        });
        if cache_position != self.incorporated {
            bail!(
                "cache position {} does not match {} incorporated tokens",
                cache_position,
                self.incorporated
            );
        }
        self.incorporated += new_tokens.len();

        self.check_failure(self.cursor)?;
        self.next_logits()
    }
}

/// Returns a zero tensor of the requested size; rejects empty input.
#[derive(Debug, Clone, Default)]
pub struct FixedImagePipeline {
    seen: Arc<Mutex<Vec<TransformKind>>>,
}

impl FixedImagePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transforms requested so far
    pub fn seen(&self) -> Vec<TransformKind> {
        self.seen.lock().clone()
    }
}

impl ImagePipeline for FixedImagePipeline {
    fn preprocess(&self, raw: &[u8], transform: TransformKind, target_size: usize) -> anyhow::Result<Tensor> {
        if raw.is_empty() {
            bail!("empty image");
        }
        self.seen.lock().push(transform);
        Ok(Tensor::zeros((3, target_size, target_size), DType::F32, &Device::Cpu)?)
    }
}
