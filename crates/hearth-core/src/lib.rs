//! # Hearth Core
//!
//! Shared, I/O-free logic for Hearth: data models, the error taxonomy,
//! chunking, the embedding trait, the vector index abstraction, and the
//! context composer.
//!
//! This crate contains no tokio, filesystem, or model-runtime
//! dependencies. Everything here is synchronous and deterministic for
//! fixed inputs, which is what lets the application crate run it on
//! worker threads and test it without a runtime.

pub mod chunk;
pub mod compose;
pub mod embedding;
pub mod error;
pub mod index;
pub mod models;

pub use error::{Error, Result};
