//! Streaming autoregressive decoder
//!
//! `SamplingDecoder::open` validates and truncates the prompt, then hands out
//! a `DecodeStream`: a lazy, finite iterator of `PartialResult`s. The first
//! pull runs the prefill over the whole prompt window (the only call that
//! sees the image); every later pull feeds just the newly sampled token at
//! the current cache position. The full generated window is re-decoded on
//! every step since token-to-text mapping is not stable per token.

use crate::backend::{Model, Tokenizer};
use crate::sampling::{Sampler, SamplingParams};
use candle_core::Tensor;
use shardchat_common::metrics::LatencyTimer;
use shardchat_common::{Result, ShardChatError, METRICS};
use shardchat_proto::PartialResult;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Token bookkeeping for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeState {
    /// Prompt followed by every accepted generated token
    pub tokens: Vec<u32>,

    /// Leading tokens the model has already incorporated
    pub cache_position: usize,

    /// Index of the first generated token
    pub generation_start: usize,

    /// End of the generated window
    pub generated_until: usize,

    /// Upper bound on `tokens.len()`
    pub total_len: usize,
}

impl DecodeState {
    fn new(prompt_tokens: Vec<u32>, total_len: usize) -> Self {
        let prompt_len = prompt_tokens.len();
        Self {
            tokens: prompt_tokens,
            cache_position: 0,
            generation_start: prompt_len,
            generated_until: prompt_len,
            total_len,
        }
    }

    /// Index the next sampled token will occupy
    pub fn position(&self) -> usize {
        self.tokens.len()
    }

    pub fn generated(&self) -> &[u32] {
        &self.tokens[self.generation_start..self.generated_until]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Prefill,
    Step,
    Done,
}

enum StepOutcome {
    Emit(PartialResult),
    /// Stop; carries the truncated text when a stop symbol fired
    Finish(Option<String>),
}

/// Entry point of the decode loop
pub struct SamplingDecoder;

impl SamplingDecoder {
    /// Prepare a decode over `prompt_tokens`.
    ///
    /// The prompt is truncated from the left so that `max_gen_len` tokens (and
    /// the image, if any) still fit into the model's context window.
    pub fn open<'a>(
        model: &'a mut dyn Model,
        tokenizer: &'a dyn Tokenizer,
        prompt_tokens: Vec<u32>,
        image: Option<Tensor>,
        params: &SamplingParams,
        sampler: Sampler,
        cancel: CancellationToken,
    ) -> Result<DecodeStream<'a>> {
        params.validate()?;
        if prompt_tokens.is_empty() {
            return Err(ShardChatError::invalid_input("prompt encodes to no tokens"));
        }

        let reserved = if image.is_some() { model.image_tokens() } else { 0 };
        let window = model.context_window().checked_sub(reserved).filter(|w| *w > 0).ok_or_else(|| {
            ShardChatError::invalid_input(format!(
                "context window {} cannot hold {} image tokens",
                model.context_window(),
                reserved
            ))
        })?;

        let max_prompt_len = window.saturating_sub(params.max_gen_len).max(1);
        let prompt_tokens = if prompt_tokens.len() > max_prompt_len {
            debug!(
                "Truncating prompt from {} to {} tokens",
                prompt_tokens.len(),
                max_prompt_len
            );
            prompt_tokens[prompt_tokens.len() - max_prompt_len..].to_vec()
        } else {
            prompt_tokens
        };

        let total_len = window.min(params.max_gen_len + prompt_tokens.len());
        let state = DecodeState::new(prompt_tokens, total_len);

        debug!(
            "Opened decode: prompt={} total_len={} image={}",
            state.generation_start,
            total_len,
            image.is_some()
        );

        Ok(DecodeStream {
            model,
            tokenizer,
            sampler,
            image,
            stop_symbols: params.stop_symbols.clone(),
            cancel,
            state,
            phase: Phase::Prefill,
        })
    }
}

/// Lazy sequence of partial decodes. Not restartable.
pub struct DecodeStream<'a> {
    model: &'a mut dyn Model,
    tokenizer: &'a dyn Tokenizer,
    sampler: Sampler,
    image: Option<Tensor>,
    stop_symbols: Vec<String>,
    cancel: CancellationToken,
    state: DecodeState,
    phase: Phase,
}

impl<'a> DecodeStream<'a> {
    pub fn state(&self) -> &DecodeState {
        &self.state
    }

    /// Token ids generated so far
    pub fn generated_tokens(&self) -> &[u32] {
        self.state.generated()
    }

    fn decode_generated(&self) -> Result<String> {
        Ok(self.tokenizer.decode(self.state.generated())?)
    }

    fn forward(&mut self) -> Result<Tensor> {
        let cur = self.state.position();
        let cache_position = self.state.cache_position;
        let window = &self.state.tokens[cache_position..cur];

        let logits = if self.phase == Phase::Prefill {
            let image = self.image.take();
            METRICS
                .worker
                .prefill_duration
                .time(|| self.model.forward_prefill(window, image.as_ref()))?
        } else {
            METRICS
                .worker
                .step_duration
                .time(|| self.model.forward_step(window, cache_position))?
        };

        self.state.cache_position = cur;
        self.phase = Phase::Step;
        Ok(logits)
    }

    fn step(&mut self) -> Result<StepOutcome> {
        if self.state.position() >= self.state.total_len {
            return Ok(StepOutcome::Finish(None));
        }
        if self.cancel.is_cancelled() {
            debug!("Decode cancelled at position {}", self.state.position());
            return Ok(StepOutcome::Finish(None));
        }

        let logits = self.forward()?;
        let next = self.sampler.sample(&logits)?;
        METRICS.worker.decode_steps_total.inc();
        trace!("position {} sampled {}", self.state.position(), next);

        if next == self.tokenizer.eos_id() {
            return Ok(StepOutcome::Finish(None));
        }

        self.state.tokens.push(next);
        self.state.generated_until = self.state.tokens.len();

        let text = self.decode_generated()?;
        for stop in &self.stop_symbols {
            if let Some(pos) = text.find(stop.as_str()) {
                return Ok(StepOutcome::Finish(Some(text[..pos].to_string())));
            }
        }

        Ok(StepOutcome::Emit(PartialResult::partial(text)))
    }
}

impl<'a> Iterator for DecodeStream<'a> {
    type Item = Result<PartialResult>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.phase == Phase::Done {
            return None;
        }

        let outcome = match self.step() {
            Ok(outcome) => outcome,
            Err(e) => {
                self.phase = Phase::Done;
                return Some(Err(e));
            }
        };

        match outcome {
            StepOutcome::Emit(partial) => Some(Ok(partial)),
            StepOutcome::Finish(truncated) => {
                self.phase = Phase::Done;
                METRICS
                    .inference
                    .tokens_generated_total
                    .inc_by(self.state.generated().len() as u64);
                let text = match truncated {
                    Some(text) => Ok(text),
                    None => self.decode_generated(),
                };
                Some(text.map(PartialResult::terminal))
            }
        }
    }
}
