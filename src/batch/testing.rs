//! Test doubles for the external seams.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::core::{
    Batch, BatchHeader, BatchId, BatchPersisted, BatchState, Bytes32, Data, IdAndSequence,
    Message, MessageHeader, MessageId, MessageState, MessageType, NamespaceId, SignerRef,
    TransactionRef, TxType, WallClock,
};
use crate::store::{
    BatchUpdate, DataManager, Event, IdentityManager, MessagePoll, MessageStateFilter,
    MessageUpdate, Nonce, NodeIdentity, Store, StoreError, Transaction,
};

/// Scripted in-memory store. Rows mutated inside a failed `run_as_group`
/// closure are rolled back, mirroring the transactional contract.
#[derive(Default)]
pub(crate) struct MockStore {
    pub pages: Mutex<VecDeque<Result<Vec<IdAndSequence>, StoreError>>>,
    pub polls: Mutex<Vec<MessagePoll>>,
    pub batches: Mutex<HashMap<BatchId, BatchPersisted>>,
    pub batch_updates: Mutex<Vec<(BatchId, BatchUpdate)>>,
    pub message_updates: Mutex<Vec<(MessageStateFilter, MessageUpdate)>>,
    pub message_updates_single: Mutex<Vec<(MessageId, MessageUpdate)>>,
    pub transactions: Mutex<Vec<Transaction>>,
    pub events: Mutex<Vec<Event>>,
    pub nonces: Mutex<HashMap<Bytes32, i64>>,
    pub nonce_gets: Mutex<Vec<Bytes32>>,
    pub nonce_updates: Mutex<Vec<Nonce>>,
    pub update_messages_failures: Mutex<VecDeque<StoreError>>,
    pub group_calls: AtomicUsize,
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_page(&self, entries: Vec<IdAndSequence>) {
        self.pages.lock().expect("lock").push_back(Ok(entries));
    }

    pub fn push_page_error(&self, err: StoreError) {
        self.pages.lock().expect("lock").push_back(Err(err));
    }

    pub fn seed_nonce(&self, context: Bytes32, nonce: i64) {
        self.nonces.lock().expect("lock").insert(context, nonce);
    }

    pub fn seed_batch(&self, batch: BatchPersisted) {
        self.batches
            .lock()
            .expect("lock")
            .insert(batch.header.id, batch);
    }

    pub fn fail_next_update_messages(&self, message: &str) {
        self.update_messages_failures
            .lock()
            .expect("lock")
            .push_back(StoreError::Backend(message.into()));
    }
}

impl Store for MockStore {
    fn get_message_ids(
        &self,
        _namespace: &NamespaceId,
        poll: &MessagePoll,
    ) -> Result<Vec<IdAndSequence>, StoreError> {
        self.polls.lock().expect("lock").push(*poll);
        self.pages
            .lock()
            .expect("lock")
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    fn insert_or_get_batch(
        &self,
        batch: &BatchPersisted,
    ) -> Result<Option<BatchPersisted>, StoreError> {
        let mut batches = self.batches.lock().expect("lock");
        if let Some(existing) = batches.get(&batch.header.id) {
            return Ok(Some(existing.clone()));
        }
        batches.insert(batch.header.id, batch.clone());
        Ok(None)
    }

    fn update_batch(
        &self,
        _namespace: &NamespaceId,
        id: &BatchId,
        update: &BatchUpdate,
    ) -> Result<(), StoreError> {
        let mut batches = self.batches.lock().expect("lock");
        if let Some(row) = batches.get_mut(id) {
            if let Some(state) = update.state {
                row.state = state;
            }
            if let Some(hash) = update.hash {
                row.hash = Some(hash);
            }
            if let Some(manifest) = &update.manifest {
                row.manifest = Some(manifest.clone());
            }
        }
        self.batch_updates
            .lock()
            .expect("lock")
            .push((*id, update.clone()));
        Ok(())
    }

    fn update_messages(
        &self,
        _namespace: &NamespaceId,
        filter: &MessageStateFilter,
        update: &MessageUpdate,
    ) -> Result<(), StoreError> {
        if let Some(err) = self
            .update_messages_failures
            .lock()
            .expect("lock")
            .pop_front()
        {
            return Err(err);
        }
        self.message_updates
            .lock()
            .expect("lock")
            .push((filter.clone(), update.clone()));
        Ok(())
    }

    fn update_message(
        &self,
        _namespace: &NamespaceId,
        id: &MessageId,
        update: &MessageUpdate,
    ) -> Result<(), StoreError> {
        self.message_updates_single
            .lock()
            .expect("lock")
            .push((*id, update.clone()));
        Ok(())
    }

    fn insert_transaction(&self, txn: &Transaction) -> Result<(), StoreError> {
        self.transactions.lock().expect("lock").push(txn.clone());
        Ok(())
    }

    fn insert_event(&self, event: &Event) -> Result<(), StoreError> {
        self.events.lock().expect("lock").push(event.clone());
        Ok(())
    }

    fn get_nonce(&self, context: &Bytes32) -> Result<Option<Nonce>, StoreError> {
        self.nonce_gets.lock().expect("lock").push(*context);
        Ok(self
            .nonces
            .lock()
            .expect("lock")
            .get(context)
            .map(|&nonce| Nonce {
                context: *context,
                nonce,
            }))
    }

    fn update_nonce(&self, nonce: &Nonce) -> Result<(), StoreError> {
        self.nonce_updates.lock().expect("lock").push(*nonce);
        self.nonces
            .lock()
            .expect("lock")
            .insert(nonce.context, nonce.nonce);
        Ok(())
    }

    fn get_batch_by_id(
        &self,
        _namespace: &NamespaceId,
        id: &BatchId,
    ) -> Result<Option<BatchPersisted>, StoreError> {
        Ok(self.batches.lock().expect("lock").get(id).cloned())
    }

    fn run_as_group(&self, work: &mut dyn FnMut() -> crate::Result<()>) -> crate::Result<()> {
        self.group_calls.fetch_add(1, Ordering::SeqCst);
        let nonces_before = self.nonces.lock().expect("lock").clone();
        let batches_before = self.batches.lock().expect("lock").clone();
        let result = work();
        if result.is_err() {
            *self.nonces.lock().expect("lock") = nonces_before;
            *self.batches.lock().expect("lock") = batches_before;
        }
        result
    }
}

/// Scripted message-with-data cache.
#[derive(Default)]
pub(crate) struct MockData {
    pub messages: Mutex<HashMap<MessageId, (Message, Vec<Data>)>>,
    pub cached_updates: Mutex<Vec<Message>>,
    pub hydrated: Mutex<HashMap<BatchId, Batch>>,
    pub hydrate_failure: Mutex<Option<StoreError>>,
}

impl MockData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, message: Message, data: Vec<Data>) {
        self.messages
            .lock()
            .expect("lock")
            .insert(message.header.id, (message, data));
    }

    pub fn seed_hydrated(&self, batch: Batch) {
        self.hydrated
            .lock()
            .expect("lock")
            .insert(batch.header.id, batch);
    }

    pub fn fail_hydrate(&self, message: &str) {
        *self.hydrate_failure.lock().expect("lock") = Some(StoreError::Backend(message.into()));
    }
}

impl DataManager for MockData {
    fn get_message_with_data_cached(
        &self,
        id: &MessageId,
    ) -> Result<Option<(Message, Vec<Data>)>, StoreError> {
        Ok(self.messages.lock().expect("lock").get(id).cloned())
    }

    fn update_message_if_cached(&self, message: &Message) {
        self.cached_updates
            .lock()
            .expect("lock")
            .push(message.clone());
    }

    fn hydrate_batch(&self, batch: &BatchPersisted) -> Result<Batch, StoreError> {
        if let Some(err) = self.hydrate_failure.lock().expect("lock").clone() {
            return Err(err);
        }
        self.hydrated
            .lock()
            .expect("lock")
            .get(&batch.header.id)
            .cloned()
            .ok_or_else(|| StoreError::Backend("batch not hydratable".into()))
    }
}

/// Fixed local node.
pub(crate) struct MockIdentity {
    pub node: NodeIdentity,
}

impl MockIdentity {
    pub fn new() -> Self {
        Self {
            node: NodeIdentity {
                id: crate::core::NodeId::random(),
                name: "node1".into(),
            },
        }
    }
}

impl IdentityManager for MockIdentity {
    fn get_local_node(&self) -> Result<NodeIdentity, StoreError> {
        Ok(self.node.clone())
    }
}

pub(crate) fn test_namespace() -> NamespaceId {
    NamespaceId::parse("ns1").expect("namespace")
}

pub(crate) fn test_message(
    tx_type: TxType,
    msg_type: MessageType,
    topics: &[&str],
    group: Option<Bytes32>,
) -> Message {
    Message {
        header: MessageHeader {
            id: MessageId::random(),
            namespace: test_namespace(),
            tx_type,
            msg_type,
            topics: topics.iter().map(|t| t.to_string()).collect(),
            signer: SignerRef {
                author: "did:firefly:org/abcd".into(),
                key: "0x12345".into(),
            },
            group,
        },
        sequence: 0,
        state: MessageState::Ready,
        batch_id: None,
        pins: Vec::new(),
        data: Vec::new(),
    }
}

pub(crate) fn test_batch_persisted(id: BatchId, namespace: &NamespaceId) -> BatchPersisted {
    BatchPersisted {
        header: BatchHeader {
            id,
            namespace: namespace.clone(),
            node: None,
            group: None,
            signer: SignerRef::default(),
            created: WallClock::now(),
        },
        tx: TransactionRef {
            tx_type: TxType::BatchPin,
            id: None,
        },
        state: BatchState::Prepared,
        hash: None,
        manifest: None,
    }
}
