//! Dispatcher registry: routes `(transaction type, message type)` pairs to
//! handlers and their batching options.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::config::DispatcherOptions;
use crate::core::{DispatchPayload, MessageType, TxType};

pub type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// A downstream transport. Runs inside the flush transaction, so an error
/// here rolls back the whole batch.
pub trait DispatchHandler: Send + Sync {
    fn dispatch(&self, payload: &mut DispatchPayload) -> HandlerResult;
}

impl<F> DispatchHandler for F
where
    F: Fn(&mut DispatchPayload) -> HandlerResult + Send + Sync,
{
    fn dispatch(&self, payload: &mut DispatchPayload) -> HandlerResult {
        self(payload)
    }
}

/// A registered dispatcher: the handler plus how to batch for it.
pub struct Dispatcher {
    pub name: String,
    pub batch_pinned: bool,
    pub options: DispatcherOptions,
    pub handler: Arc<dyn DispatchHandler>,
}

/// Registry of dispatchers keyed by `(transaction type, message type)`.
///
/// A pinned dispatcher serves both the batch-pin and contract-invoke-pin
/// transaction types for each of its message types; an unpinned one serves
/// only the unpinned type. Re-registering a key replaces the prior entry.
#[derive(Default)]
pub struct DispatcherRegistry {
    inner: RwLock<HashMap<(TxType, MessageType), Arc<Dispatcher>>>,
}

impl DispatcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        name: &str,
        batch_pinned: bool,
        msg_types: &[MessageType],
        handler: Arc<dyn DispatchHandler>,
        options: DispatcherOptions,
    ) {
        let dispatcher = Arc::new(Dispatcher {
            name: name.to_string(),
            batch_pinned,
            options: DispatcherOptions {
                batch_max_size: options.batch_max_size.max(1),
                batch_max_count: options.batch_max_count.max(1),
                ..options
            },
            handler,
        });
        let tx_types: &[TxType] = if batch_pinned {
            &[TxType::BatchPin, TxType::ContractInvokePin]
        } else {
            &[TxType::Unpinned]
        };
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        for &tx_type in tx_types {
            for &msg_type in msg_types {
                inner.insert((tx_type, msg_type), Arc::clone(&dispatcher));
            }
        }
    }

    pub fn lookup(&self, tx_type: TxType, msg_type: MessageType) -> Option<Arc<Dispatcher>> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(tx_type, msg_type))
            .cloned()
    }
}
