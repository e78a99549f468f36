//! Message rows: the ordered input stream this subsystem assembles.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::identity::{BatchId, Bytes32, DataId, MessageId, NamespaceId};

/// How a message travels once batched.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Broadcast,
    Private,
    Definition,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Broadcast => "broadcast",
            MessageType::Private => "private",
            MessageType::Definition => "definition",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transaction type the batch will be submitted under.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxType {
    None,
    BatchPin,
    ContractInvokePin,
    Unpinned,
}

impl TxType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxType::None => "none",
            TxType::BatchPin => "batch_pin",
            TxType::ContractInvokePin => "contract_invoke_pin",
            TxType::Unpinned => "unpinned",
        }
    }
}

impl fmt::Display for TxType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message lifecycle state in the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    Ready,
    Sent,
    Cancelled,
}

impl MessageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageState::Ready => "ready",
            MessageState::Sent => "sent",
            MessageState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for MessageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who signed the message: author DID plus signing key reference.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignerRef {
    pub author: String,
    pub key: String,
}

/// Reference from a message to one of its data items.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRef {
    pub id: DataId,
    pub hash: Bytes32,
}

/// A data item, retrieved alongside its message via the cached hydrator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Data {
    pub id: DataId,
    pub hash: Bytes32,
    pub value: serde_json::Value,
}

impl Data {
    /// Rough serialized size, used for batch byte accounting.
    pub fn estimated_size(&self) -> usize {
        self.value.to_string().len()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub id: MessageId,
    pub namespace: NamespaceId,
    pub tx_type: TxType,
    pub msg_type: MessageType,
    /// Ordered, non-empty.
    pub topics: Vec<String>,
    pub signer: SignerRef,
    /// Required iff the message is private.
    pub group: Option<Bytes32>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub header: MessageHeader,
    /// Store-assigned, monotonically increasing.
    pub sequence: i64,
    pub state: MessageState,
    pub batch_id: Option<BatchId>,
    /// Pre-assigned pins (private only), hex-encoded.
    pub pins: Vec<String>,
    pub data: Vec<DataRef>,
}

/// Fixed per-message overhead for size estimation: header fields that do not
/// scale with content.
const MESSAGE_BASE_SIZE: usize = 128;

impl Message {
    /// Rough serialized size of the message row itself, excluding data.
    pub fn estimated_size(&self) -> usize {
        let header = &self.header;
        let topics: usize = header.topics.iter().map(String::len).sum();
        MESSAGE_BASE_SIZE
            + topics
            + header.signer.author.len()
            + header.signer.key.len()
            + self.pins.iter().map(String::len).sum::<usize>()
            + self.data.len() * 64
    }
}

/// A page entry from the store: just enough to drive the sequencer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdAndSequence {
    pub id: MessageId,
    pub sequence: i64,
}
