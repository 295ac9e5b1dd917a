//! Upstream reply interpretation.
//!
//! The upstream streams full-text snapshots (`{"text": "..."}`), each
//! repeating everything said so far, and closes a turn with one final event
//! (`{"final": true, "responseMessage": {...}}`). [`ReplyInterpreter`] turns
//! those into incremental [`Signal`]s.

use serde_json::Value;

use super::stream::RawEvent;

/// Why an upstream turn ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    /// The upstream truncated its reply.
    Length,
    Other(String),
}

impl FinishReason {
    pub fn parse(reason: &str) -> Self {
        match reason {
            "stop" => Self::Stop,
            "length" => Self::Length,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Stop => "stop",
            Self::Length => "length",
            Self::Other(reason) => reason,
        }
    }
}

/// Normalized output of the interpreter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// Text not yet seen in this turn.
    TextDelta(String),
    /// End of the turn. Exactly one per turn.
    Terminal(FinishReason),
}

/// The known shapes of an upstream `data` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamPayload {
    /// Full text of the reply so far.
    Snapshot { text: String },
    /// End of turn, optionally carrying the complete reply text.
    Final {
        text: Option<String>,
        finish_reason: FinishReason,
    },
    /// Anything else, including payloads that are not JSON objects.
    Unrecognized,
}

impl UpstreamPayload {
    /// Classify a `data` value. Never fails; unknown shapes are `Unrecognized`.
    ///
    /// Fields are read one by one, so a mistyped field is treated as absent
    /// rather than discarding the whole payload.
    pub fn parse(data: &str) -> Self {
        let Ok(Value::Object(envelope)) = serde_json::from_str::<Value>(data) else {
            return Self::Unrecognized;
        };

        if envelope.get("final").and_then(Value::as_bool) == Some(true) {
            let message = envelope.get("responseMessage");
            let text = message
                .and_then(|m| m.get("text"))
                .and_then(Value::as_str)
                .map(str::to_string);
            let finish_reason = message
                .and_then(|m| m.get("finish_reason"))
                .and_then(Value::as_str)
                .map(FinishReason::parse)
                .unwrap_or(FinishReason::Stop);
            return Self::Final {
                text,
                finish_reason,
            };
        }

        match envelope.get("text").and_then(Value::as_str) {
            Some(text) => Self::Snapshot {
                text: text.to_string(),
            },
            None => Self::Unrecognized,
        }
    }
}

/// Per-round interpreter state.
///
/// Holds the accumulated text of the current upstream round; create a fresh
/// one for every round.
#[derive(Debug, Default)]
pub struct ReplyInterpreter {
    accumulated: String,
}

impl ReplyInterpreter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Text seen so far in this round.
    pub fn accumulated(&self) -> &str {
        &self.accumulated
    }

    /// Interpret one decoded event. Returns at most two signals.
    pub fn interpret(&mut self, event: &RawEvent) -> Vec<Signal> {
        let Some(data) = event.data() else {
            return Vec::new();
        };

        match UpstreamPayload::parse(data) {
            UpstreamPayload::Snapshot { text } => {
                self.advance(text).map(Signal::TextDelta).into_iter().collect()
            }
            UpstreamPayload::Final {
                text,
                finish_reason,
            } => {
                let mut signals = Vec::with_capacity(2);
                if let Some(text) = text.filter(|t| !t.is_empty() && *t != self.accumulated) {
                    if let Some(delta) = self.advance(text) {
                        signals.push(Signal::TextDelta(delta));
                    }
                }
                signals.push(Signal::Terminal(finish_reason));
                signals
            }
            UpstreamPayload::Unrecognized => {
                tracing::debug!(data_len = data.len(), "Ignoring unrecognized upstream payload");
                Vec::new()
            }
        }
    }

    /// Replace the accumulated text with `text`, returning the part not seen before.
    fn advance(&mut self, text: String) -> Option<String> {
        let delta = unseen_suffix(&text, &self.accumulated).to_string();
        self.accumulated = text;
        (!delta.is_empty()).then_some(delta)
    }
}

/// The part of `full` past the first `seen.chars().count()` characters.
fn unseen_suffix<'a>(full: &'a str, seen: &str) -> &'a str {
    if let Some(rest) = full.strip_prefix(seen) {
        return rest;
    }
    match full.char_indices().nth(seen.chars().count()) {
        Some((idx, _)) => &full[idx..],
        None => "",
    }
}
