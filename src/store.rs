//! Seams to the external collaborators: the relational store, the
//! message-with-data cache, the identity manager, and the transaction helper.
//!
//! Everything here is a behavioral contract; the implementations (SQL plugin,
//! caching layer, identity service) live outside this crate.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::core::{
    Batch, BatchId, BatchPersisted, BatchState, Bytes32, Data, EventId, IdAndSequence, Message,
    MessageId, MessageState, NamespaceId, NodeId, TxId, TxType, WallClock,
};
use crate::error::{Effect, Transience};

/// Backend failure from any external collaborator.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("store row conflict: {0}")]
    Conflict(String),
}

impl StoreError {
    pub fn transience(&self) -> Transience {
        // Outages and row contention both clear with time.
        Transience::Retryable
    }

    pub fn effect(&self) -> Effect {
        Effect::Unknown
    }
}

/// Page filter for the sequencer: `sequence > after_sequence`, ascending,
/// at most `limit` rows.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessagePoll {
    pub after_sequence: i64,
    pub limit: usize,
}

/// Predicate for a guarded multi-message update: `id IN ids AND state == state`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageStateFilter {
    pub ids: Vec<MessageId>,
    pub state: MessageState,
}

/// Field updates applied to message rows. `None` leaves a field untouched.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessageUpdate {
    pub state: Option<MessageState>,
    pub batch_id: Option<Option<BatchId>>,
    pub pins: Option<Vec<String>>,
}

/// Field updates applied to a batch row.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchUpdate {
    pub state: Option<BatchState>,
    pub hash: Option<Bytes32>,
    pub manifest: Option<String>,
}

/// Persisted nonce row: a monotonic counter per `(group, topic, author)`
/// context, keyed by the SHA-256 of that context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nonce {
    pub context: Bytes32,
    pub nonce: i64,
}

/// Transaction row inserted when a batch is submitted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TxId,
    pub namespace: NamespaceId,
    pub tx_type: TxType,
    pub created: WallClock,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    TransactionSubmitted,
    BatchDispatched,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventType::TransactionSubmitted => "transaction_submitted",
            EventType::BatchDispatched => "batch_dispatched",
        };
        f.write_str(s)
    }
}

/// Event row emitted on the flush path.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub namespace: NamespaceId,
    pub event_type: EventType,
    /// Row the event refers to (transaction or batch id).
    pub reference: Uuid,
    pub created: WallClock,
}

/// The relational store.
///
/// `run_as_group` is the transactional primitive the whole flush protocol
/// hangs off: the closure runs inside a single store transaction, which
/// commits on `Ok` and rolls back otherwise, propagating the error.
pub trait Store: Send + Sync {
    fn get_message_ids(
        &self,
        namespace: &NamespaceId,
        poll: &MessagePoll,
    ) -> Result<Vec<IdAndSequence>, StoreError>;

    /// Idempotent by batch id: returns the existing row when one is already
    /// present instead of inserting.
    fn insert_or_get_batch(
        &self,
        batch: &BatchPersisted,
    ) -> Result<Option<BatchPersisted>, StoreError>;

    fn update_batch(
        &self,
        namespace: &NamespaceId,
        id: &BatchId,
        update: &BatchUpdate,
    ) -> Result<(), StoreError>;

    /// Applies `update` to every row matching `filter`, atomically with the
    /// filter predicate.
    fn update_messages(
        &self,
        namespace: &NamespaceId,
        filter: &MessageStateFilter,
        update: &MessageUpdate,
    ) -> Result<(), StoreError>;

    fn update_message(
        &self,
        namespace: &NamespaceId,
        id: &MessageId,
        update: &MessageUpdate,
    ) -> Result<(), StoreError>;

    fn insert_transaction(&self, txn: &Transaction) -> Result<(), StoreError>;

    fn insert_event(&self, event: &Event) -> Result<(), StoreError>;

    fn get_nonce(&self, context: &Bytes32) -> Result<Option<Nonce>, StoreError>;

    fn update_nonce(&self, nonce: &Nonce) -> Result<(), StoreError>;

    fn get_batch_by_id(
        &self,
        namespace: &NamespaceId,
        id: &BatchId,
    ) -> Result<Option<BatchPersisted>, StoreError>;

    fn run_as_group(
        &self,
        work: &mut dyn FnMut() -> crate::Result<()>,
    ) -> crate::Result<()>;
}

/// The message-with-data cache.
pub trait DataManager: Send + Sync {
    /// `None` means the message (or some of its data) is not available.
    fn get_message_with_data_cached(
        &self,
        id: &MessageId,
    ) -> Result<Option<(Message, Vec<Data>)>, StoreError>;

    /// Refresh the cached copy of a message after its row changed.
    fn update_message_if_cached(&self, message: &Message);

    fn hydrate_batch(&self, batch: &BatchPersisted) -> Result<Batch, StoreError>;
}

/// The local node identity, stamped into batch headers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub id: NodeId,
    pub name: String,
}

pub trait IdentityManager: Send + Sync {
    fn get_local_node(&self) -> Result<NodeIdentity, StoreError>;
}

/// The transaction helper: inserts the transaction row and its submit event.
pub trait TxHelper: Send + Sync {
    fn submit_new_transaction(
        &self,
        namespace: &NamespaceId,
        tx_type: TxType,
    ) -> Result<TxId, StoreError>;
}

/// Store-backed [`TxHelper`]: one transaction row plus one
/// `transaction_submitted` event per submission.
pub struct TxWriter {
    store: Arc<dyn Store>,
}

impl TxWriter {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

impl TxHelper for TxWriter {
    fn submit_new_transaction(
        &self,
        namespace: &NamespaceId,
        tx_type: TxType,
    ) -> Result<TxId, StoreError> {
        let txn = Transaction {
            id: TxId::random(),
            namespace: namespace.clone(),
            tx_type,
            created: WallClock::now(),
        };
        self.store.insert_transaction(&txn)?;
        self.store.insert_event(&Event {
            id: EventId::random(),
            namespace: namespace.clone(),
            event_type: EventType::TransactionSubmitted,
            reference: *txn.id.as_uuid(),
            created: WallClock::now(),
        })?;
        Ok(txn.id)
    }
}
