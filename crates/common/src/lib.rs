//! Shared types for the Gemini gateway workspace

mod secret;
mod error;

pub use secret::Secret;
pub use error::{Error, Result};
