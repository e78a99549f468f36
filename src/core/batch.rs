//! Batch rows, manifests, and the transient dispatch payload.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::identity::{BatchId, Bytes32, DataId, MessageId, NamespaceId, NodeId, TxId};
use super::message::{Data, Message, SignerRef, TxType};
use super::time::WallClock;

/// Whether a dispatcher assembles broadcast or private batches.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchType {
    #[default]
    Broadcast,
    Private,
}

/// Batch lifecycle state in the store.
///
/// Rows are created `Prepared` before dispatch and finalized `Dispatched`
/// (or `Cancelled`) afterwards; their identity never changes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Prepared,
    Dispatched,
    Cancelled,
}

impl BatchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchState::Prepared => "prepared",
            BatchState::Dispatched => "dispatched",
            BatchState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchHeader {
    pub id: BatchId,
    pub namespace: NamespaceId,
    pub node: Option<NodeId>,
    pub group: Option<Bytes32>,
    pub signer: SignerRef,
    pub created: WallClock,
}

/// Reference to the transaction a batch is submitted under.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRef {
    pub tx_type: TxType,
    pub id: Option<TxId>,
}

/// The persisted batch row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchPersisted {
    pub header: BatchHeader,
    pub tx: TransactionRef,
    pub state: BatchState,
    /// SHA-256 of the serialized manifest, set on finalize.
    pub hash: Option<Bytes32>,
    /// Serialized [`BatchManifest`], set on finalize.
    pub manifest: Option<String>,
}

/// The durable record of what a batch contained.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchManifest {
    pub version: u32,
    pub id: BatchId,
    pub tx: TransactionRef,
    pub messages: Vec<MessageManifestEntry>,
    pub data: Vec<DataManifestEntry>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageManifestEntry {
    pub id: MessageId,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataManifestEntry {
    pub id: DataId,
    pub hash: Bytes32,
}

pub const MANIFEST_VERSION: u32 = 1;

impl BatchManifest {
    pub fn build(batch: &BatchPersisted, messages: &[Message], data: &[Data]) -> Self {
        Self {
            version: MANIFEST_VERSION,
            id: batch.header.id,
            tx: batch.tx,
            messages: messages
                .iter()
                .map(|m| MessageManifestEntry { id: m.header.id })
                .collect(),
            data: data
                .iter()
                .map(|d| DataManifestEntry {
                    id: d.id,
                    hash: d.hash,
                })
                .collect(),
        }
    }
}

/// Messages and data of a hydrated batch.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchPayload {
    pub messages: Vec<Message>,
    pub data: Vec<Data>,
}

/// A fully hydrated batch, as returned by the data manager.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub header: BatchHeader,
    pub tx: TransactionRef,
    pub payload: BatchPayload,
}

/// The transient value handed to a dispatcher: the batch row, its content,
/// and the ordered pins. Never persisted as-is.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatchPayload {
    pub batch: BatchPersisted,
    pub messages: Vec<Message>,
    pub data: Vec<Data>,
    pub pins: Vec<Bytes32>,
}
