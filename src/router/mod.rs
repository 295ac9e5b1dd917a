//! Router module for upstream selection.
//!
//! Maps a requested model name to the upstream endpoint family that
//! serves it, using an ordered prefix table.

mod selector;

pub use selector::{Router, SelectedRoute};
