//! The batch manager façade and its two long-running loops.
//!
//! The sequencer is the single reader of the persisted message stream: it
//! pages new rows by sequence, hydrates them through the cache, and hands
//! each one to the processor owning its `(tx type, msg type, group, author)`
//! tuple. The notifier coalesces producer hints into rewinds and taps the
//! sequencer awake.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam::channel::{after, bounded, Receiver, RecvTimeoutError, Sender};
use crossbeam::sync::WaitGroup;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::batch::pins;
use crate::batch::processor::{
    Backoff, BatchProcessor, BatchWork, FlushStatus, ProcessorKey, ProcessorMap,
    ProcessorRuntime,
};
use crate::batch::registry::{DispatchHandler, Dispatcher, DispatcherRegistry};
use crate::batch::BatchError;
use crate::config::{BatchConfig, DispatcherOptions};
use crate::core::{
    Data, DispatchPayload, IdAndSequence, Message, MessageId, MessageType, NamespaceId, TxType,
};
use crate::store::{DataManager, IdentityManager, MessagePoll, Store, StoreError, TxHelper};

/// Snapshot of every live processor, for the admin surface.
#[derive(Clone, Debug, Serialize)]
pub struct StatusReport {
    pub processors: Vec<ProcessorStatus>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ProcessorStatus {
    pub dispatcher: String,
    pub key: String,
    pub status: FlushStatus,
}

/// `read_offset` is the highest store sequence already handled; pages filter
/// `sequence > read_offset`. A pending rewind lowers it before the next read.
struct Offsets {
    read_offset: i64,
    rewind_offset: Option<i64>,
}

pub struct BatchManager {
    inner: Arc<Inner>,
}

struct Inner {
    namespace: NamespaceId,
    store: Arc<dyn Store>,
    data: Arc<dyn DataManager>,
    identity: Arc<dyn IdentityManager>,
    txns: Arc<dyn TxHelper>,
    config: BatchConfig,
    registry: DispatcherRegistry,
    processors: ProcessorMap,
    offsets: Mutex<Offsets>,
    new_messages_tx: Sender<i64>,
    new_messages_rx: Receiver<i64>,
    tap_tx: Sender<()>,
    tap_rx: Receiver<()>,
    shutdown: Arc<AtomicBool>,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
    started: AtomicBool,
    wait: Mutex<Option<WaitGroup>>,
    threads: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl BatchManager {
    pub fn new(
        namespace: &str,
        store: Arc<dyn Store>,
        data: Arc<dyn DataManager>,
        identity: Arc<dyn IdentityManager>,
        txns: Arc<dyn TxHelper>,
        config: BatchConfig,
    ) -> crate::Result<Self> {
        let namespace = NamespaceId::parse(namespace)?;
        let (new_messages_tx, new_messages_rx) = bounded(config.read_page_size.max(1));
        let (tap_tx, tap_rx) = bounded(1);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        Ok(Self {
            inner: Arc::new(Inner {
                namespace,
                store,
                data,
                identity,
                txns,
                config,
                registry: DispatcherRegistry::new(),
                processors: Arc::new(Mutex::new(HashMap::new())),
                offsets: Mutex::new(Offsets {
                    read_offset: -1,
                    rewind_offset: None,
                }),
                new_messages_tx,
                new_messages_rx,
                tap_tx,
                tap_rx,
                shutdown: Arc::new(AtomicBool::new(false)),
                shutdown_tx: Mutex::new(Some(shutdown_tx)),
                shutdown_rx,
                started: AtomicBool::new(false),
                wait: Mutex::new(Some(WaitGroup::new())),
                threads: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Register a dispatcher for the `(tx type, msg type)` keys it implies.
    /// Call before `start`, or concurrently before the first matching
    /// message arrives.
    pub fn register_dispatcher(
        &self,
        name: &str,
        batch_pinned: bool,
        msg_types: &[MessageType],
        handler: Arc<dyn DispatchHandler>,
        options: DispatcherOptions,
    ) {
        self.inner
            .registry
            .register(name, batch_pinned, msg_types, handler, options);
    }

    /// Launch the sequencer and notifier. Idempotent.
    pub fn start(&self) -> crate::Result<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(namespace = %self.inner.namespace, "batch manager starting");
        let (notifier_wait, sequencer_wait) = {
            let guard = self.inner.wait.lock().unwrap_or_else(|e| e.into_inner());
            match guard.as_ref() {
                Some(wait) => (wait.clone(), wait.clone()),
                None => return Ok(()),
            }
        };
        let notifier = Arc::clone(&self.inner);
        let sequencer = Arc::clone(&self.inner);
        let mut threads = self.inner.threads.lock().unwrap_or_else(|e| e.into_inner());
        threads.push(std::thread::spawn(move || {
            let _wait = notifier_wait;
            notifier.new_message_notifier();
        }));
        threads.push(std::thread::spawn(move || {
            let _wait = sequencer_wait;
            sequencer.message_sequencer();
        }));
        Ok(())
    }

    /// Producer-facing hint channel: send the sequence of a newly inserted
    /// (or replayed) message row.
    pub fn new_messages(&self) -> Sender<i64> {
        self.inner.new_messages_tx.clone()
    }

    pub fn status(&self) -> StatusReport {
        let processors = self
            .inner
            .processors
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let mut report: Vec<ProcessorStatus> = processors
            .values()
            .map(|handle| ProcessorStatus {
                dispatcher: handle.dispatcher_name.clone(),
                key: handle.key.to_string(),
                status: handle
                    .status
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone(),
            })
            .collect();
        report.sort_by(|a, b| a.key.cmp(&b.key));
        StatusReport { processors: report }
    }

    /// Cancel a persisted batch before its dispatch completes.
    ///
    /// Only contract-invoke-pin batches are cancellable, and only while the
    /// owning processor still holds the batch in memory.
    pub fn cancel_batch(&self, id: &str) -> crate::Result<()> {
        let inner = &self.inner;
        let batch_id = crate::core::BatchId::parse(id)?;
        let persisted = inner
            .store
            .get_batch_by_id(&inner.namespace, &batch_id)?
            .ok_or(BatchError::NotFound(batch_id))?;
        if persisted.tx.tx_type != TxType::ContractInvokePin {
            return Err(BatchError::NotCancellable {
                id: batch_id,
                tx_type: persisted.tx.tx_type,
            }
            .into());
        }
        let batch = inner.data.hydrate_batch(&persisted)?;
        let Some(first) = batch.payload.messages.first() else {
            return Err(BatchError::NoPayload(batch_id).into());
        };
        let header = &first.header;
        if inner
            .registry
            .lookup(header.tx_type, header.msg_type)
            .is_none()
        {
            return Err(BatchError::UnknownBatchType {
                tx_type: header.tx_type,
                msg_type: header.msg_type,
            }
            .into());
        }
        let key = ProcessorKey::for_message(header);
        let handle = {
            let processors = inner.processors.lock().unwrap_or_else(|e| e.into_inner());
            processors.get(&key).cloned()
        };
        let handle = handle.ok_or_else(|| BatchError::ProcessorNotActive {
            key: key.to_string(),
        })?;
        handle
            .cancel_tx
            .send(batch_id)
            .map_err(|_| BatchError::ProcessorNotActive {
                key: key.to_string(),
            })?;
        info!(batch = %batch_id, key = %key, "batch cancellation forwarded");
        Ok(())
    }

    /// Recompute the pins of an already-formed payload without allocating
    /// nonces; pre-supplied private pins are authoritative.
    pub fn load_contexts(&self, payload: &mut DispatchPayload) -> crate::Result<()> {
        pins::load_contexts(payload)
    }

    /// Signal every loop to stop. Safe to call more than once.
    pub fn cancel(&self) {
        if !self.inner.shutdown.swap(true, Ordering::SeqCst) {
            info!(namespace = %self.inner.namespace, "batch manager stopping");
        }
        // Dropping the sender disconnects every shutdown receiver.
        let _ = self
            .inner
            .shutdown_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let _ = self.inner.tap_tx.try_send(());
    }

    /// Block until the sequencer, notifier, and every processor have exited.
    pub fn wait_stop(&self) {
        self.cancel();
        let handles: Vec<_> = {
            let mut threads = self.inner.threads.lock().unwrap_or_else(|e| e.into_inner());
            threads.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.join();
        }
        let wait = self.inner.wait.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(wait) = wait {
            wait.wait();
        }
    }
}

impl Inner {
    /// Coalesce producer hints: a hint at or below the read offset schedules
    /// a rewind to just before it, and the minimum of a burst wins.
    fn new_message_notifier(&self) {
        debug!("new message notifier starting");
        loop {
            crossbeam::select! {
                recv(self.new_messages_rx) -> sequence => {
                    let Ok(sequence) = sequence else { break };
                    self.note_new_sequence(sequence);
                    self.tap();
                }
                recv(self.shutdown_rx) -> _ => break,
            }
        }
        debug!("new message notifier exiting");
    }

    fn note_new_sequence(&self, sequence: i64) {
        let mut offsets = self.offsets.lock().unwrap_or_else(|e| e.into_inner());
        if sequence <= offsets.read_offset {
            let target = (sequence - 1).max(-1);
            offsets.rewind_offset = Some(match offsets.rewind_offset {
                Some(current) => current.min(target),
                None => target,
            });
            debug!(sequence, rewind = target, "rewind scheduled for replayed sequence");
        }
    }

    fn tap(&self) {
        // Bounded(1): a pending tap already covers this hint.
        let _ = self.tap_tx.try_send(());
    }

    fn message_sequencer(&self) {
        info!(namespace = %self.namespace, "message sequencer starting");
        let mut backoff = Backoff::new(
            self.config.retry_init_delay(),
            self.config.retry_max_delay(),
        );
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
            let page_limit = self.config.read_page_size.max(1);
            match self.read_page(page_limit) {
                Err(err) => {
                    let delay = backoff.next_delay();
                    warn!(
                        error = %err,
                        retry_in_ms = delay.as_millis() as u64,
                        "failed to read message page; retrying"
                    );
                    if self.sleep_or_shutdown(delay) {
                        break;
                    }
                }
                Ok(entries) => {
                    backoff.reset();
                    let full_page = entries.len() == page_limit;
                    if !entries.is_empty() {
                        self.process_page(entries);
                    }
                    if self.shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    if full_page {
                        // More rows are probably waiting; re-poll straight
                        // away, rate-limited to the minimum poll delay.
                        if self.sleep_or_shutdown(self.config.minimum_poll_delay()) {
                            break;
                        }
                    } else {
                        self.wait_for_new_messages();
                    }
                }
            }
        }
        info!("message sequencer exiting");
    }

    /// Returns true when shutdown interrupted the sleep.
    fn sleep_or_shutdown(&self, delay: Duration) -> bool {
        !matches!(
            self.shutdown_rx.recv_timeout(delay),
            Err(RecvTimeoutError::Timeout)
        )
    }

    fn wait_for_new_messages(&self) {
        let tick = after(self.config.message_poll_timeout());
        crossbeam::select! {
            recv(self.tap_rx) -> _ => {}
            recv(self.shutdown_rx) -> _ => {}
            recv(tick) -> _ => {}
        }
    }

    fn read_page(&self, limit: usize) -> Result<Vec<IdAndSequence>, StoreError> {
        let after_sequence = {
            let mut offsets = self.offsets.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(rewind) = offsets.rewind_offset.take() {
                if rewind < offsets.read_offset {
                    info!(
                        from = offsets.read_offset,
                        to = rewind,
                        "rewinding message poll offset"
                    );
                    offsets.read_offset = rewind;
                }
            }
            offsets.read_offset
        };
        self.store.get_message_ids(
            &self.namespace,
            &MessagePoll {
                after_sequence,
                limit,
            },
        )
    }

    fn process_page(&self, entries: Vec<IdAndSequence>) {
        for entry in entries {
            match self.assemble_message_data(&entry.id) {
                Err(err) => {
                    // Abandon the rest of the page without advancing past
                    // this entry; the next cycle retries it.
                    warn!(
                        message = %entry.id,
                        sequence = entry.sequence,
                        error = %err,
                        "failed to hydrate message; abandoning page"
                    );
                    return;
                }
                Ok((mut message, data)) => {
                    message.sequence = entry.sequence;
                    let header = &message.header;
                    match self.registry.lookup(header.tx_type, header.msg_type) {
                        None => {
                            debug!(
                                message = %header.id,
                                tx_type = %header.tx_type,
                                msg_type = %header.msg_type,
                                "no dispatcher for message; skipping"
                            );
                        }
                        Some(dispatcher) => {
                            if !self.submit_to_processor(&dispatcher, message, data) {
                                return;
                            }
                        }
                    }
                    self.advance_read_offset(entry.sequence);
                }
            }
        }
    }

    fn assemble_message_data(&self, id: &MessageId) -> crate::Result<(Message, Vec<Data>)> {
        match self.data.get_message_with_data_cached(id)? {
            Some((message, data)) => Ok((message, data)),
            None => Err(BatchError::MissingData(*id).into()),
        }
    }

    fn advance_read_offset(&self, sequence: i64) {
        let mut offsets = self.offsets.lock().unwrap_or_else(|e| e.into_inner());
        if sequence > offsets.read_offset {
            offsets.read_offset = sequence;
        }
    }

    /// Hand a message to its processor, blocking until accepted. Returns
    /// false when shutdown pre-empted the hand-off.
    fn submit_to_processor(
        &self,
        dispatcher: &Arc<Dispatcher>,
        message: Message,
        data: Vec<Data>,
    ) -> bool {
        let key = ProcessorKey::for_message(&message.header);
        let mut work = BatchWork { message, data };
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                return false;
            }
            let Some(work_tx) = self.processor_work_sender(&key, dispatcher) else {
                return false;
            };
            match work_tx.send(work) {
                Ok(()) => return true,
                // The processor disposed of itself between lookup and send;
                // resolve it again.
                Err(send_error) => work = send_error.0,
            }
        }
    }

    fn processor_work_sender(
        &self,
        key: &ProcessorKey,
        dispatcher: &Arc<Dispatcher>,
    ) -> Option<Sender<BatchWork>> {
        let mut processors = self.processors.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = processors.get(key) {
            return Some(handle.work_tx.clone());
        }
        let wait = {
            let guard = self.wait.lock().unwrap_or_else(|e| e.into_inner());
            guard.as_ref()?.clone()
        };
        let runtime = ProcessorRuntime {
            namespace: self.namespace.clone(),
            store: Arc::clone(&self.store),
            data: Arc::clone(&self.data),
            identity: Arc::clone(&self.identity),
            txns: Arc::clone(&self.txns),
            shutdown: Arc::clone(&self.shutdown),
            shutdown_rx: self.shutdown_rx.clone(),
            retry_init_delay: self.config.retry_init_delay(),
            retry_max_delay: self.config.retry_max_delay(),
        };
        let handle = BatchProcessor::spawn(
            key.clone(),
            Arc::clone(dispatcher),
            runtime,
            Arc::clone(&self.processors),
            wait,
        );
        let work_tx = handle.work_tx.clone();
        info!(key = %key, dispatcher = %dispatcher.name, "batch processor created");
        processors.insert(key.clone(), handle);
        Some(work_tx)
    }
}
