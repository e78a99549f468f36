//! Batch capability errors.
//!
//! Bounded, user-facing refusal states plus the handler failure wrapper that
//! drives flush retries.

use thiserror::Error;

use crate::core::{BatchId, MessageId, MessageType, TxType};
use crate::error::{Effect, Transience};

/// Canonical error enum for the batch capability.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BatchError {
    /// No persisted batch row with this id.
    #[error("batch {0} not found")]
    NotFound(BatchId),

    /// No dispatcher registered for this `(transaction type, message type)`.
    #[error("no dispatcher registered for transaction type `{tx_type}` and message type `{msg_type}`")]
    UnknownBatchType {
        tx_type: TxType,
        msg_type: MessageType,
    },

    /// The processor for this key is not currently in memory.
    #[error("batch processor `{key}` is not active")]
    ProcessorNotActive { key: String },

    /// Only contract-invoke-pin batches may be cancelled.
    #[error("batch {id} has transaction type `{tx_type}` and cannot be cancelled")]
    NotCancellable { id: BatchId, tx_type: TxType },

    /// The persisted batch hydrated to an empty payload.
    #[error("batch {0} has no payload messages")]
    NoPayload(BatchId),

    /// The message (or some of its data) was not available from the cache.
    #[error("message {0} is not available with complete data")]
    MissingData(MessageId),

    /// A pre-supplied pin failed to parse as a 32-byte hex value.
    #[error("pin `{raw}` on message {id} is invalid")]
    InvalidPin { id: MessageId, raw: String },

    /// A private message reached re-derivation without any pins.
    #[error("private message {0} carries no pins")]
    NoPins(MessageId),

    #[error("batch manifest encoding failed: {0}")]
    Manifest(String),

    /// The dispatcher handler refused the payload; the flush transaction is
    /// rolled back and retried.
    #[error("dispatch handler failed: {0}")]
    Handler(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl BatchError {
    pub fn transience(&self) -> Transience {
        match self {
            BatchError::Handler(_) => Transience::Retryable,
            BatchError::MissingData(_) => Transience::Retryable,
            _ => Transience::Permanent,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            BatchError::Handler(_) => Effect::Unknown,
            _ => Effect::None,
        }
    }
}
