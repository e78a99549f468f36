//! Per-key batch processors.
//!
//! One thread per `(transaction type, message type, group, author)` tuple
//! owns one assembling batch. All mutation is serialized on the processor's
//! bounded work channel; the sequencer is the sole producer, and the
//! cancellation path talks over a separate control channel.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam::channel::{after, bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use crossbeam::sync::WaitGroup;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::batch::pins;
use crate::batch::registry::Dispatcher;
use crate::batch::BatchError;
use crate::core::{
    sha256_bytes, BatchHeader, BatchId, BatchManifest, BatchPersisted, BatchState, Bytes32, Data,
    DispatchPayload, EventId, Message, MessageHeader, MessageId, MessageState, MessageType,
    NamespaceId, NodeId, SignerRef, TransactionRef, TxType, WallClock,
};
use crate::store::{
    BatchUpdate, DataManager, Event, EventType, IdentityManager, MessageStateFilter,
    MessageUpdate, Store, TxHelper,
};

/// Bound on the inbound work channel; the sequencer blocks once a processor
/// falls this far behind, which is the backpressure story for the whole
/// subsystem.
const WORK_CHANNEL_BOUND: usize = 16;

/// Identity of a processor: every message routed to it shares these fields.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProcessorKey {
    pub tx_type: TxType,
    pub msg_type: MessageType,
    pub group: Option<Bytes32>,
    pub author: String,
}

impl ProcessorKey {
    pub fn for_message(header: &MessageHeader) -> Self {
        Self {
            tx_type: header.tx_type,
            msg_type: header.msg_type,
            group: header.group,
            author: header.signer.author.clone(),
        }
    }
}

impl fmt::Display for ProcessorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:", self.tx_type, self.msg_type)?;
        match &self.group {
            Some(group) => write!(f, "{}", group)?,
            None => f.write_str("none")?,
        }
        write!(f, ":{}", self.author)
    }
}

/// Snapshot of a processor's flush state, for the status surface.
#[derive(Clone, Debug, Default, Serialize)]
pub struct FlushStatus {
    pub flushing: Option<BatchId>,
    pub pending_messages: usize,
    pub pending_bytes: usize,
    pub total_flushes: u64,
    pub flush_errors: u64,
    pub last_flush: Option<WallClock>,
}

/// A message plus its hydrated data, as handed off by the sequencer.
#[derive(Clone, Debug)]
pub(crate) struct BatchWork {
    pub message: Message,
    pub data: Vec<Data>,
}

/// The manager-side view of a live processor.
#[derive(Clone)]
pub(crate) struct ProcessorHandle {
    pub dispatcher_name: String,
    pub key: ProcessorKey,
    pub work_tx: Sender<BatchWork>,
    pub cancel_tx: Sender<BatchId>,
    pub status: Arc<Mutex<FlushStatus>>,
}

/// Shared dependencies cloned into every processor.
#[derive(Clone)]
pub(crate) struct ProcessorRuntime {
    pub namespace: NamespaceId,
    pub store: Arc<dyn Store>,
    pub data: Arc<dyn DataManager>,
    pub identity: Arc<dyn IdentityManager>,
    pub txns: Arc<dyn TxHelper>,
    pub shutdown: Arc<AtomicBool>,
    pub shutdown_rx: Receiver<()>,
    pub retry_init_delay: Duration,
    pub retry_max_delay: Duration,
}

pub(crate) type ProcessorMap = Arc<Mutex<HashMap<ProcessorKey, ProcessorHandle>>>;

pub(crate) struct BatchProcessor {
    key: ProcessorKey,
    dispatcher: Arc<Dispatcher>,
    runtime: ProcessorRuntime,
    processors: ProcessorMap,
    handle: ProcessorHandle,
    work_rx: Receiver<BatchWork>,
    cancel_rx: Receiver<BatchId>,
    status: Arc<Mutex<FlushStatus>>,

    assembly: Vec<BatchWork>,
    assembly_bytes: usize,
    batch_id: Option<BatchId>,
    cancel_requested: Option<BatchId>,
    node: Option<NodeId>,
}

enum Disposal {
    Exit,
    Keep,
    /// A hand-off raced the removal; the processor re-registered itself and
    /// keeps running with this work.
    Raced(BatchWork),
}

impl BatchProcessor {
    /// Spawn a processor thread and return the handle the manager keeps.
    pub(crate) fn spawn(
        key: ProcessorKey,
        dispatcher: Arc<Dispatcher>,
        runtime: ProcessorRuntime,
        processors: ProcessorMap,
        wait: WaitGroup,
    ) -> ProcessorHandle {
        let (work_tx, work_rx) = bounded(WORK_CHANNEL_BOUND);
        let (cancel_tx, cancel_rx) = unbounded();
        let status = Arc::new(Mutex::new(FlushStatus::default()));
        let handle = ProcessorHandle {
            dispatcher_name: dispatcher.name.clone(),
            key: key.clone(),
            work_tx,
            cancel_tx,
            status: Arc::clone(&status),
        };
        let processor = BatchProcessor {
            key,
            dispatcher,
            runtime,
            processors,
            handle: handle.clone(),
            work_rx,
            cancel_rx,
            status,
            assembly: Vec::new(),
            assembly_bytes: 0,
            batch_id: None,
            cancel_requested: None,
            node: None,
        };
        std::thread::spawn(move || {
            let _wait = wait;
            processor.run();
        });
        handle
    }

    fn run(mut self) {
        debug!(key = %self.key, dispatcher = %self.dispatcher.name, "batch processor starting");
        let dispose_timeout = self.dispatcher.options.dispose_timeout();
        let work_rx = self.work_rx.clone();
        let cancel_rx = self.cancel_rx.clone();
        let shutdown_rx = self.runtime.shutdown_rx.clone();
        let mut dispose_at = Instant::now() + dispose_timeout;
        let mut flush_at: Option<Instant> = None;

        loop {
            if self.runtime.shutdown.load(Ordering::Relaxed) {
                break;
            }
            let deadline = flush_at.unwrap_or(dispose_at);
            let tick = after(deadline.saturating_duration_since(Instant::now()));
            crossbeam::select! {
                recv(work_rx) -> work => {
                    let Ok(work) = work else { break };
                    self.accept(work, &mut flush_at);
                    dispose_at = Instant::now() + dispose_timeout;
                    if self.should_flush(flush_at) {
                        self.flush();
                        flush_at = None;
                        dispose_at = Instant::now() + dispose_timeout;
                    }
                }
                recv(cancel_rx) -> request => {
                    let Ok(id) = request else { break };
                    self.note_cancel(id);
                    if self.cancel_requested.is_some() && self.cancel_requested == self.batch_id {
                        self.cancel_assembly();
                        flush_at = None;
                        dispose_at = Instant::now() + dispose_timeout;
                    }
                }
                recv(shutdown_rx) -> _ => break,
                recv(tick) -> _ => {
                    let now = Instant::now();
                    if !self.assembly.is_empty() && flush_at.is_some_and(|at| now >= at) {
                        self.flush();
                        flush_at = None;
                        dispose_at = Instant::now() + dispose_timeout;
                    } else if self.assembly.is_empty() && now >= dispose_at {
                        match self.try_dispose() {
                            Disposal::Exit => break,
                            Disposal::Keep => {
                                dispose_at = Instant::now() + dispose_timeout;
                            }
                            Disposal::Raced(work) => {
                                self.accept(work, &mut flush_at);
                                dispose_at = Instant::now() + dispose_timeout;
                                if self.should_flush(flush_at) {
                                    self.flush();
                                    flush_at = None;
                                    dispose_at = Instant::now() + dispose_timeout;
                                }
                            }
                        }
                    }
                }
            }
        }
        debug!(key = %self.key, "batch processor exiting");
    }

    fn accept(&mut self, work: BatchWork, flush_at: &mut Option<Instant>) {
        if self.assembly.is_empty() {
            self.batch_id = Some(BatchId::random());
            *flush_at = Some(Instant::now() + self.dispatcher.options.batch_timeout());
        }
        self.assembly_bytes += work.message.estimated_size()
            + work.data.iter().map(Data::estimated_size).sum::<usize>();
        debug!(
            key = %self.key,
            message = %work.message.header.id,
            sequence = work.message.sequence,
            "message added to assembling batch"
        );
        self.assembly.push(work);
        let (messages, bytes) = (self.assembly.len(), self.assembly_bytes);
        self.update_status(|status| {
            status.pending_messages = messages;
            status.pending_bytes = bytes;
        });
    }

    fn should_flush(&self, flush_at: Option<Instant>) -> bool {
        if self.assembly.is_empty() {
            return false;
        }
        self.assembly.len() >= self.dispatcher.options.batch_max_count
            || self.assembly_bytes >= self.dispatcher.options.batch_max_size
            || flush_at.is_some_and(|at| Instant::now() >= at)
    }

    fn note_cancel(&mut self, id: BatchId) {
        if self.batch_id == Some(id) {
            info!(batch = %id, "cancellation requested for in-flight batch");
            self.cancel_requested = Some(id);
        } else {
            warn!(batch = %id, key = %self.key, "cancellation requested for batch not in flight; ignoring");
        }
    }

    fn drain_cancel_requests(&mut self) {
        while let Ok(id) = self.cancel_rx.try_recv() {
            self.note_cancel(id);
        }
    }

    /// Flush the assembling batch, retrying with backoff until it commits,
    /// is cancelled, or the manager shuts down. The assembly is retained
    /// across failures so a retry resumes the same batch id.
    fn flush(&mut self) {
        let Some(batch_id) = self.batch_id else { return };
        self.update_status(|status| status.flushing = Some(batch_id));
        info!(
            batch = %batch_id,
            key = %self.key,
            messages = self.assembly.len(),
            bytes = self.assembly_bytes,
            "flushing batch"
        );
        let mut backoff = Backoff::new(self.runtime.retry_init_delay, self.runtime.retry_max_delay);
        loop {
            if self.runtime.shutdown.load(Ordering::Relaxed) {
                self.update_status(|status| status.flushing = None);
                return;
            }
            self.drain_cancel_requests();
            if self.cancel_requested == Some(batch_id) {
                self.cancel_assembly();
                return;
            }
            match self.attempt_flush(batch_id) {
                Ok(()) => {
                    self.assembly.clear();
                    self.assembly_bytes = 0;
                    self.batch_id = None;
                    self.update_status(|status| {
                        status.flushing = None;
                        status.pending_messages = 0;
                        status.pending_bytes = 0;
                        status.total_flushes += 1;
                        status.last_flush = Some(WallClock::now());
                    });
                    return;
                }
                Err(err) => {
                    self.update_status(|status| status.flush_errors += 1);
                    let delay = backoff.next_delay();
                    warn!(
                        batch = %batch_id,
                        error = %err,
                        retry_in_ms = delay.as_millis() as u64,
                        "batch flush failed; retrying"
                    );
                    match self.runtime.shutdown_rx.recv_timeout(delay) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                            self.update_status(|status| status.flushing = None);
                            return;
                        }
                    }
                }
            }
        }
    }

    /// One flush attempt: the entire §flush protocol inside a single store
    /// transaction, so a failure anywhere rolls everything back, including
    /// nonce allocations.
    fn attempt_flush(&mut self, batch_id: BatchId) -> crate::Result<()> {
        let node = match self.node {
            Some(node) => node,
            None => {
                let node = self.runtime.identity.get_local_node()?.id;
                self.node = Some(node);
                node
            }
        };
        let signer_key = self
            .assembly
            .first()
            .map(|work| work.message.header.signer.key.clone())
            .unwrap_or_default();
        let mut payload = DispatchPayload {
            batch: BatchPersisted {
                header: BatchHeader {
                    id: batch_id,
                    namespace: self.runtime.namespace.clone(),
                    node: Some(node),
                    group: self.key.group,
                    signer: SignerRef {
                        author: self.key.author.clone(),
                        key: signer_key,
                    },
                    created: WallClock::now(),
                },
                tx: TransactionRef {
                    tx_type: self.key.tx_type,
                    id: None,
                },
                state: BatchState::Prepared,
                hash: None,
                manifest: None,
            },
            messages: self
                .assembly
                .iter()
                .map(|work| work.message.clone())
                .collect(),
            data: self
                .assembly
                .iter()
                .flat_map(|work| work.data.iter().cloned())
                .collect(),
            pins: Vec::new(),
        };
        let ids: Vec<MessageId> = payload.messages.iter().map(|m| m.header.id).collect();

        let store = Arc::clone(&self.runtime.store);
        let txns = Arc::clone(&self.runtime.txns);
        let handler = Arc::clone(&self.dispatcher.handler);
        let namespace = self.runtime.namespace.clone();
        let tx_type = self.key.tx_type;

        {
            let mut work = || -> crate::Result<()> {
                let tx_id = txns.submit_new_transaction(&namespace, tx_type)?;
                payload.batch.tx.id = Some(tx_id);
                if let Some(existing) = store.insert_or_get_batch(&payload.batch)? {
                    debug!(batch = %existing.header.id, "reusing persisted batch row");
                }
                store.update_messages(
                    &namespace,
                    &MessageStateFilter {
                        ids: ids.clone(),
                        state: MessageState::Ready,
                    },
                    &MessageUpdate {
                        state: Some(MessageState::Sent),
                        batch_id: Some(Some(batch_id)),
                        ..Default::default()
                    },
                )?;
                payload.pins =
                    pins::assign_pins(store.as_ref(), &namespace, &mut payload.messages)?;
                handler
                    .dispatch(&mut payload)
                    .map_err(BatchError::Handler)?;
                let manifest =
                    BatchManifest::build(&payload.batch, &payload.messages, &payload.data);
                let manifest_json = serde_json::to_string(&manifest)
                    .map_err(|err| BatchError::Manifest(err.to_string()))?;
                let hash = sha256_bytes(manifest_json.as_bytes());
                store.update_batch(
                    &namespace,
                    &batch_id,
                    &BatchUpdate {
                        state: Some(BatchState::Dispatched),
                        hash: Some(hash),
                        manifest: Some(manifest_json),
                    },
                )?;
                store.insert_event(&Event {
                    id: EventId::random(),
                    namespace: namespace.clone(),
                    event_type: EventType::BatchDispatched,
                    reference: *batch_id.as_uuid(),
                    created: WallClock::now(),
                })?;
                Ok(())
            };
            store.run_as_group(&mut work)?;
        }

        // Committed: refresh cached copies of the flushed messages.
        for message in &mut payload.messages {
            message.batch_id = Some(batch_id);
            message.state = MessageState::Sent;
            self.runtime.data.update_message_if_cached(message);
        }
        info!(batch = %batch_id, key = %self.key, "batch dispatched");
        Ok(())
    }

    /// Abort the in-flight batch: record the row as cancelled and revert any
    /// message-state transitions, then drop the assembly. The messages stay
    /// `ready` in the store either way, since no flush attempt committed.
    fn cancel_assembly(&mut self) {
        let Some(batch_id) = self.batch_id else { return };
        let ids: Vec<MessageId> = self
            .assembly
            .iter()
            .map(|work| work.message.header.id)
            .collect();
        let signer_key = self
            .assembly
            .first()
            .map(|work| work.message.header.signer.key.clone())
            .unwrap_or_default();
        let batch = BatchPersisted {
            header: BatchHeader {
                id: batch_id,
                namespace: self.runtime.namespace.clone(),
                node: self.node,
                group: self.key.group,
                signer: SignerRef {
                    author: self.key.author.clone(),
                    key: signer_key,
                },
                created: WallClock::now(),
            },
            tx: TransactionRef {
                tx_type: self.key.tx_type,
                id: None,
            },
            state: BatchState::Cancelled,
            hash: None,
            manifest: None,
        };
        let store = Arc::clone(&self.runtime.store);
        let namespace = self.runtime.namespace.clone();
        let result = {
            let mut work = || -> crate::Result<()> {
                store.insert_or_get_batch(&batch)?;
                store.update_batch(
                    &namespace,
                    &batch_id,
                    &BatchUpdate {
                        state: Some(BatchState::Cancelled),
                        ..Default::default()
                    },
                )?;
                store.update_messages(
                    &namespace,
                    &MessageStateFilter {
                        ids: ids.clone(),
                        state: MessageState::Sent,
                    },
                    &MessageUpdate {
                        state: Some(MessageState::Ready),
                        batch_id: Some(None),
                        ..Default::default()
                    },
                )?;
                Ok(())
            };
            store.run_as_group(&mut work)
        };
        match result {
            Ok(()) => info!(batch = %batch_id, key = %self.key, "batch cancelled"),
            Err(err) => {
                warn!(batch = %batch_id, error = %err, "failed to record batch cancellation")
            }
        }
        self.assembly.clear();
        self.assembly_bytes = 0;
        self.batch_id = None;
        self.cancel_requested = None;
        self.update_status(|status| {
            status.flushing = None;
            status.pending_messages = 0;
            status.pending_bytes = 0;
        });
    }

    /// Remove this processor from the map after the idle TTL. The removal is
    /// taken back if a hand-off raced it.
    fn try_dispose(&mut self) -> Disposal {
        {
            let mut processors = self
                .processors
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if !self.work_rx.is_empty() {
                return Disposal::Keep;
            }
            if let Some(handle) = processors.get(&self.key) {
                if Arc::ptr_eq(&handle.status, &self.status) {
                    processors.remove(&self.key);
                }
            }
        }
        if let Ok(work) = self.work_rx.try_recv() {
            let mut processors = self
                .processors
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            processors.insert(self.key.clone(), self.handle.clone());
            return Disposal::Raced(work);
        }
        info!(key = %self.key, "batch processor disposed after idle timeout");
        Disposal::Exit
    }

    fn update_status(&self, f: impl FnOnce(&mut FlushStatus)) {
        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut status);
    }
}

/// Exponential backoff with a cap; shared by flush retries and the
/// sequencer's page-read retries.
pub(crate) struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub(crate) fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            current: base,
        }
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let next = self.current.checked_mul(2).unwrap_or(self.max);
        self.current = std::cmp::min(next, self.max);
        delay
    }

    pub(crate) fn reset(&mut self) {
        self.current = self.base;
    }
}
