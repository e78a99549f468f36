//! Batch assembly for downstream multiparty transports.
//!
//! Provides:
//! - `BatchManager` - lifecycle, sequencer, cancellation, status
//! - per-key processors assembling and flushing batches
//! - pin derivation and nonce allocation for broadcast/private ordering
//! - the dispatcher registry routing batches to transport handlers

pub mod error;
pub mod manager;
pub mod pins;
pub mod processor;
pub mod registry;
#[cfg(test)]
pub(crate) mod testing;

pub use error::BatchError;
pub use manager::{BatchManager, ProcessorStatus, StatusReport};
pub use processor::{FlushStatus, ProcessorKey};
pub use registry::{DispatchHandler, Dispatcher, DispatcherRegistry, HandlerResult};
