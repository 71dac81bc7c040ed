//! Prelude module for common re-exports.
//!
//! This module provides convenient re-exports of commonly used types
//! so that consumers can do `use plexus_common::prelude::*;` and get
//! the most important types without listing individual paths.

// ─── Buffers ────────────────────────────────────────────────────────
pub use crate::buf::SlidingBuffer;

// ─── Endpoints ──────────────────────────────────────────────────────
pub use crate::endpoint::{Endpoint, EndpointError};

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{ConfigError, ConfigLoader, LogLevel};
