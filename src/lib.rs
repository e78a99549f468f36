#![forbid(unsafe_code)]

pub mod batch;
pub mod config;
pub mod core;
pub mod error;
pub mod store;

pub use error::{Effect, Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the working set at the crate root for convenience
pub use crate::batch::{
    BatchError, BatchManager, DispatchHandler, DispatcherRegistry, FlushStatus, HandlerResult,
    ProcessorKey, ProcessorStatus, StatusReport,
};
pub use crate::config::{BatchConfig, DispatcherOptions};
pub use crate::core::{
    sha256_bytes, Batch, BatchHeader, BatchId, BatchManifest, BatchPayload, BatchPersisted,
    BatchState, BatchType, Bytes32, CoreError, Data, DataId, DataRef, DispatchPayload, EventId,
    IdAndSequence, InvalidId, Message, MessageHeader, MessageId, MessageState, MessageType,
    NamespaceId, NodeId, SignerRef, TransactionRef, TxId, TxType, WallClock,
};
pub use crate::store::{
    BatchUpdate, DataManager, Event, EventType, IdentityManager, MessagePoll, MessageStateFilter,
    MessageUpdate, Nonce, NodeIdentity, Store, StoreError, Transaction, TxHelper, TxWriter,
};
