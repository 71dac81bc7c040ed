//! Plexus Common Library
//!
//! This crate provides the shared building blocks used by all plexus
//! workspace crates.
//!
//! # Module Structure
//!
//! - [`buf`] - Growable byte buffer with a read cursor (sliding buffer)
//! - [`endpoint`] - Endpoint parsing, resolution and socket binding
//! - [`config`] - Configuration loading traits and types
//! - [`prelude`] - Common re-exports for convenience
//!
//! # Usage
//!
//! Add to your `Cargo.toml` with alias for shorter imports:
//! ```toml
//! [dependencies]
//! plexus = { package = "plexus_common", path = "../plexus_common" }
//! ```
//!
//! Then import:
//! ```rust,ignore
//! use plexus::buf::SlidingBuffer;
//! use plexus::endpoint::Endpoint;
//! ```

pub mod buf;
pub mod config;
pub mod endpoint;
pub mod prelude;
