//! Core capability errors (parsing, validation).
//!
//! These are bounded and stable: core errors represent domain/refusal states,
//! not library implementation details.

use thiserror::Error;

use crate::error::{Effect, Transience};

/// Invalid ID or 32-byte value.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum InvalidId {
    #[error("namespace `{raw}` is invalid: {reason}")]
    Namespace { raw: String, reason: String },
    #[error("batch id `{raw}` is invalid: {reason}")]
    Batch { raw: String, reason: String },
    #[error("32-byte value `{raw}` is invalid: {reason}")]
    Hash { raw: String, reason: String },
}

/// Canonical error enum for core capability.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum CoreError {
    #[error(transparent)]
    InvalidId(#[from] InvalidId),
}

impl CoreError {
    pub fn transience(&self) -> Transience {
        // Core errors are pure domain/input failures.
        Transience::Permanent
    }

    pub fn effect(&self) -> Effect {
        Effect::None
    }
}
