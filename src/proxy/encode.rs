//! Chat Completions encoding of relayed replies.
//!
//! Two delivery modes over the same [`RelayEvent`] stream:
//! - [`sse_body`] writes each chunk as soon as it is produced
//! - [`collect_response`] folds everything into one `chat.completion`

use std::convert::Infallible;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::Serialize;

use super::continuation::RelayEvent;
use super::interpret::FinishReason;
use super::types::{
    ChatCompletionChunk, ChatCompletionResponse, Choice, ChunkChoice, Delta, Message, Usage,
    COMPLETION_CREATED, COMPLETION_ID,
};
use crate::error::Result;

/// End-of-stream sentinel frame.
pub const DONE_FRAME: &str = "data: [DONE]\n\n";

/// Builds chunks for one reply.
#[derive(Debug, Clone)]
pub struct ChunkEncoder {
    model: String,
}

impl ChunkEncoder {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
        }
    }

    /// A chunk carrying a content fragment.
    pub fn content(&self, text: &str) -> ChatCompletionChunk {
        self.chunk(
            Delta {
                content: Some(text.to_string()),
                finish_reason: None,
            },
            None,
        )
    }

    /// The closing chunk carrying the finish reason.
    pub fn finish(&self, reason: &FinishReason) -> ChatCompletionChunk {
        let reason = reason.as_str().to_string();
        self.chunk(
            Delta {
                content: None,
                finish_reason: Some(reason.clone()),
            },
            Some(reason),
        )
    }

    fn chunk(&self, delta: Delta, finish_reason: Option<String>) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: COMPLETION_ID.to_string(),
            object: "chat.completion.chunk".to_string(),
            created: COMPLETION_CREATED,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
        }
    }
}

fn data_frame(value: &impl Serialize) -> Bytes {
    match serde_json::to_string(value) {
        Ok(json) => Bytes::from(format!("data: {}\n\n", json)),
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize event-stream frame");
            Bytes::new()
        }
    }
}

/// `data: <chunk json>\n\n`
pub fn sse_frame(chunk: &ChatCompletionChunk) -> Bytes {
    data_frame(chunk)
}

/// `data: {"error": <message>}\n\n`
pub fn error_frame(message: &str) -> Bytes {
    data_frame(&serde_json::json!({ "error": message }))
}

/// Streaming delivery: encode relay events as event-stream frames.
///
/// A finished reply ends with its finish chunk and [`DONE_FRAME`]. A reply
/// that failed to open ends with one error frame. An interrupted reply just
/// stops; whatever was already written stands.
pub fn sse_body<S>(
    events: S,
    model: String,
) -> impl Stream<Item = std::result::Result<Bytes, Infallible>> + Send
where
    S: Stream<Item = RelayEvent> + Send + 'static,
{
    let encoder = ChunkEncoder::new(model);

    async_stream::stream! {
        futures::pin_mut!(events);

        while let Some(event) = events.next().await {
            match event {
                RelayEvent::Delta(text) => {
                    yield Ok(sse_frame(&encoder.content(&text)));
                }
                RelayEvent::Finish(reason) => {
                    yield Ok(sse_frame(&encoder.finish(&reason)));
                    yield Ok(Bytes::from_static(DONE_FRAME.as_bytes()));
                    return;
                }
                RelayEvent::Failed(e) => {
                    yield Ok(error_frame(&e.to_string()));
                    return;
                }
                RelayEvent::Interrupted(_) => return,
            }
        }
    }
}

/// Non-streaming delivery: the reply so far, built up event by event.
#[derive(Debug, Default)]
pub struct ResponseAccumulator {
    content: String,
    finish_reason: Option<FinishReason>,
}

impl ResponseAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in one event.
    ///
    /// `Failed` ends the reply with whatever was gathered before the failed
    /// round. `Interrupted` hands its error back.
    pub fn push(&mut self, event: RelayEvent) -> Result<()> {
        match event {
            RelayEvent::Delta(text) => self.content.push_str(&text),
            RelayEvent::Finish(reason) => self.finish_reason = Some(reason),
            RelayEvent::Failed(e) => {
                tracing::warn!(
                    error = %e,
                    content_len = self.content.len(),
                    "Upstream round failed, returning content gathered so far"
                );
            }
            RelayEvent::Interrupted(e) => return Err(e),
        }
        Ok(())
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn into_response(self, model: &str) -> ChatCompletionResponse {
        let finish_reason = self.finish_reason.unwrap_or(FinishReason::Stop);
        ChatCompletionResponse {
            id: COMPLETION_ID.to_string(),
            object: "chat.completion".to_string(),
            created: COMPLETION_CREATED,
            model: model.to_string(),
            choices: vec![Choice {
                index: 0,
                message: Message::new("assistant", self.content),
                finish_reason: Some(finish_reason.as_str().to_string()),
            }],
            usage: Usage::default(),
        }
    }
}

/// Drain a relay into a single response.
///
/// Returns early when a round is interrupted, which drops the relay and any
/// upstream connection it holds.
pub async fn collect_response<S>(events: S, model: &str) -> Result<ChatCompletionResponse>
where
    S: Stream<Item = RelayEvent>,
{
    futures::pin_mut!(events);
    let mut accumulator = ResponseAccumulator::new();

    while let Some(event) = events.next().await {
        accumulator.push(event)?;
    }

    Ok(accumulator.into_response(model))
}
