//! Client for Google's CloudCode `v1internal` API surface.
//!
//! The gateway talks to four endpoints: `streamGenerateContent` (SSE),
//! `generateContent`, `fetchAvailableModels`, and `loadCodeAssist` (the
//! eligibility probe that yields an account's companion project). This crate
//! owns the wire types for those calls, the translation of the chunked SSE
//! stream into normalized events, and the classification of upstream
//! failures into rotation decisions.

pub mod classify;
pub mod client;
pub mod error;
pub mod stream;
pub mod wire;

pub use classify::{classify_generation, classify_refresh, ErrorClass};
pub use client::{ApiConfig, CloudCodeClient};
pub use error::{Error, Result};
pub use stream::{collect, Completion, StreamEvent, StreamTranslator, ToolCall, Usage};
