//! chatrelay - OpenAI-compatible relay for chatpro-style streaming upstreams
//!
//! This library provides the core functionality for the relay, including
//! configuration, model routing, and the streaming translation pipeline.

pub mod config;
pub mod error;
pub mod proxy;
pub mod router;

pub use config::Config;
pub use error::{Error, Result};
