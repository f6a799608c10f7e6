//! Separator-aware stream trimming
//!
//! The model keeps generating past the end of its turn and writes the turn
//! separator into the text. Trimming cuts the text at the separator and,
//! while the response is still streaming, holds back the trailing characters
//! that could be the beginning of a separator that is only partly generated.

use shardchat_proto::PartialResult;

/// Stateless filter bound to one response end signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamTrimmer {
    end_signal: String,
}

impl StreamTrimmer {
    pub fn new(end_signal: impl Into<String>) -> Self {
        Self {
            end_signal: end_signal.into(),
        }
    }

    pub fn end_signal(&self) -> &str {
        &self.end_signal
    }

    /// Filter one event; `None` means nothing should be emitted yet.
    pub fn apply(&self, event: PartialResult) -> Option<PartialResult> {
        trim(event, &self.end_signal)
    }
}

/// Cut `event` at `end_signal` and withhold a possible partial separator.
///
/// Lengths are counted in characters. An empty signal passes events through.
pub fn trim(event: PartialResult, end_signal: &str) -> Option<PartialResult> {
    if end_signal.is_empty() {
        return Some(event);
    }

    if let Some(pos) = event.text.find(end_signal) {
        let mut text = event.text[..pos].trim_end().to_string();
        text.push('\n');
        return Some(PartialResult::terminal(text));
    }

    if event.end_of_content {
        return Some(event);
    }

    let signal_len = end_signal.chars().count();
    let text_len = event.text.chars().count();
    if text_len < signal_len {
        return None;
    }

    let keep = text_len - (signal_len - 1);
    let cut = event
        .text
        .char_indices()
        .nth(keep)
        .map(|(i, _)| i)
        .unwrap_or(event.text.len());
    Some(PartialResult::partial(&event.text[..cut]))
}
