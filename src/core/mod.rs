//! Domain types shared across the subsystem.
//!
//! Identity atoms, message and batch rows, and the timestamps they carry.

pub mod batch;
pub mod error;
pub mod identity;
pub mod message;
pub mod time;

pub use batch::{
    Batch, BatchHeader, BatchManifest, BatchPayload, BatchPersisted, BatchState, BatchType,
    DataManifestEntry, DispatchPayload, MessageManifestEntry, TransactionRef, MANIFEST_VERSION,
};
pub use error::{CoreError, InvalidId};
pub use identity::{
    sha256_bytes, BatchId, Bytes32, DataId, EventId, MessageId, NamespaceId, NodeId, TxId,
};
pub use message::{
    Data, DataRef, IdAndSequence, Message, MessageHeader, MessageState, MessageType, SignerRef,
    TxType,
};
pub use time::WallClock;
