//! HTTP relay module.
//!
//! This module provides the OpenAI-compatible HTTP API, the translation
//! pipeline that turns upstream event streams into Chat Completions
//! chunks, and the outbound transport.

pub mod continuation;
pub mod encode;
mod handlers;
pub mod interpret;
mod server;
pub mod stream;
pub mod types;
pub mod upstream;

pub use continuation::{relay, Conversation, RelayEvent, RelayPolicy};
pub use server::{create_router, run_server, AppState, RequestId, REQUEST_ID_HEADER};
pub use types::{ChatCompletionRequest, ChatCompletionResponse, Message};
pub use upstream::{ByteStream, HttpTransport, UpstreamTransport};
