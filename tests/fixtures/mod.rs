//! Shared fixtures: in-memory collaborators behind the crate's seams.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bale::{
    Batch, BatchId, BatchPersisted, BatchUpdate, Bytes32, Data, DataManager, Event, IdAndSequence,
    IdentityManager, Message, MessageHeader, MessageId, MessagePoll, MessageState,
    MessageStateFilter, MessageType, MessageUpdate, NamespaceId, NodeId, NodeIdentity, Nonce,
    SignerRef, Store, StoreError, Transaction, TxType,
};

pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn wait_until(mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(
            Instant::now() < deadline,
            "condition not reached in time"
        );
        std::thread::sleep(Duration::from_millis(1));
    }
}

pub fn namespace() -> NamespaceId {
    NamespaceId::parse("ns1").expect("namespace")
}

pub fn message(
    tx_type: TxType,
    msg_type: MessageType,
    topics: &[&str],
    group: Option<Bytes32>,
) -> Message {
    Message {
        header: MessageHeader {
            id: MessageId::random(),
            namespace: namespace(),
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

/// Scripted in-memory store. Row state mutated inside a failed `run_as_group`
/// closure is rolled back, mirroring the transactional contract.
#[derive(Default)]
pub struct MemoryStore {
    pub pages: Mutex<VecDeque<Result<Vec<IdAndSequence>, StoreError>>>,
    pub polls: Mutex<Vec<MessagePoll>>,
    pub batches: Mutex<HashMap<BatchId, BatchPersisted>>,
    pub message_updates: Mutex<Vec<(MessageStateFilter, MessageUpdate)>>,
    pub message_updates_single: Mutex<Vec<(MessageId, MessageUpdate)>>,
    pub transactions: Mutex<Vec<Transaction>>,
    pub events: Mutex<Vec<Event>>,
    pub nonces: Mutex<HashMap<Bytes32, i64>>,
    pub nonce_gets: Mutex<Vec<Bytes32>>,
    pub nonce_updates: Mutex<Vec<Nonce>>,
    pub group_calls: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_page(&self, entries: Vec<IdAndSequence>) {
        self.pages.lock().expect("lock").push_back(Ok(entries));
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

    pub fn dispatched_batches(&self) -> usize {
        self.batches
            .lock()
            .expect("lock")
            .values()
            .filter(|b| b.state == bale::BatchState::Dispatched)
            .count()
    }
}

impl Store for MemoryStore {
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
        Ok(())
    }

    fn update_messages(
        &self,
        _namespace: &NamespaceId,
        filter: &MessageStateFilter,
        update: &MessageUpdate,
    ) -> Result<(), StoreError> {
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

    fn run_as_group(&self, work: &mut dyn FnMut() -> bale::Result<()>) -> bale::Result<()> {
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

/// In-memory message-with-data cache.
#[derive(Default)]
pub struct MemoryData {
    pub messages: Mutex<HashMap<MessageId, (Message, Vec<Data>)>>,
    pub cached_updates: Mutex<Vec<Message>>,
    pub hydrated: Mutex<HashMap<BatchId, Batch>>,
}

impl MemoryData {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, message: Message, data: Vec<Data>) {
        self.messages
            .lock()
            .expect("lock")
            .insert(message.header.id, (message, data));
    }

}

impl DataManager for MemoryData {
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
        self.hydrated
            .lock()
            .expect("lock")
            .get(&batch.header.id)
            .cloned()
            .ok_or_else(|| StoreError::Backend("batch not hydratable".into()))
    }
}

pub struct FixedIdentity {
    pub node: NodeIdentity,
}

impl FixedIdentity {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            node: NodeIdentity {
                id: NodeId::random(),
                name: "node1".into(),
            },
        })
    }
}

impl IdentityManager for FixedIdentity {
    fn get_local_node(&self) -> Result<NodeIdentity, StoreError> {
        Ok(self.node.clone())
    }
}
