//! Pin derivation and per-context nonce allocation.
//!
//! Broadcast pins are topic hashes. Private pins bind the topic to the group,
//! author, and a monotonically increasing nonce so downstream consumers can
//! enforce per-context ordering without seeing the message content.

use sha2::{Digest, Sha256};

use crate::batch::BatchError;
use crate::core::{sha256_bytes, Bytes32, DispatchPayload, Message, NamespaceId};
use crate::store::{MessageUpdate, Nonce, Store, StoreError};

/// Context key for the nonce row: `SHA256(group || topic || author)`.
pub fn nonce_context(group: &Bytes32, topic: &str, author: &str) -> Bytes32 {
    let mut hasher = Sha256::new();
    hasher.update(group.as_bytes());
    hasher.update(topic.as_bytes());
    hasher.update(author.as_bytes());
    digest_to_bytes32(hasher)
}

/// Private pin: `SHA256(topic || group || author || nonce_be64)`.
///
/// The nonce is encoded as a signed 64-bit big-endian value.
pub fn private_pin(topic: &str, group: &Bytes32, author: &str, nonce: i64) -> Bytes32 {
    let mut hasher = Sha256::new();
    hasher.update(topic.as_bytes());
    hasher.update(group.as_bytes());
    hasher.update(author.as_bytes());
    hasher.update(nonce.to_be_bytes());
    digest_to_bytes32(hasher)
}

fn digest_to_bytes32(hasher: Sha256) -> Bytes32 {
    let out = hasher.finalize();
    let mut buf = [0u8; 32];
    buf.copy_from_slice(&out);
    Bytes32::new(buf)
}

/// Allocate the next nonce for `(group, topic, author)` and upsert the row.
///
/// Must run inside the ambient flush transaction: a failed flush rolls the
/// allocation back with everything else.
fn next_nonce(
    store: &dyn Store,
    group: &Bytes32,
    topic: &str,
    author: &str,
) -> Result<i64, StoreError> {
    let context = nonce_context(group, topic, author);
    let next = match store.get_nonce(&context)? {
        Some(row) => row.nonce + 1,
        None => 0,
    };
    store.update_nonce(&Nonce {
        context,
        nonce: next,
    })?;
    Ok(next)
}

/// Compute the pins for an assembling payload, allocating nonces for private
/// messages that carry none and persisting the allocated pins back onto the
/// message rows.
///
/// Pin order is `(message index, topic index)`.
pub(crate) fn assign_pins(
    store: &dyn Store,
    namespace: &NamespaceId,
    messages: &mut [Message],
) -> crate::Result<Vec<Bytes32>> {
    let mut pins = Vec::new();
    for message in messages.iter_mut() {
        match message.header.group {
            None => {
                for topic in &message.header.topics {
                    pins.push(sha256_bytes(topic.as_bytes()));
                }
            }
            Some(group) => {
                if message.pins.is_empty() {
                    let author = message.header.signer.author.clone();
                    let mut assigned = Vec::with_capacity(message.header.topics.len());
                    for topic in &message.header.topics {
                        let nonce = next_nonce(store, &group, topic, &author)?;
                        let pin = private_pin(topic, &group, &author, nonce);
                        assigned.push(pin.to_hex());
                        pins.push(pin);
                    }
                    message.pins = assigned.clone();
                    store.update_message(
                        namespace,
                        &message.header.id,
                        &MessageUpdate {
                            pins: Some(assigned),
                            ..Default::default()
                        },
                    )?;
                } else {
                    append_supplied_pins(message, &mut pins)?;
                }
            }
        }
    }
    Ok(pins)
}

/// Recompute the pins of an already-formed payload.
///
/// Broadcast pins are recomputed trivially; private messages must carry their
/// pins, which are taken verbatim. Never allocates a nonce.
pub(crate) fn load_contexts(payload: &mut DispatchPayload) -> crate::Result<()> {
    let mut pins = Vec::new();
    for message in &payload.messages {
        match message.header.group {
            None => {
                for topic in &message.header.topics {
                    pins.push(sha256_bytes(topic.as_bytes()));
                }
            }
            Some(_) => {
                if message.pins.is_empty() {
                    return Err(BatchError::NoPins(message.header.id).into());
                }
                append_supplied_pins(message, &mut pins)?;
            }
        }
    }
    payload.pins = pins;
    Ok(())
}

fn append_supplied_pins(message: &Message, pins: &mut Vec<Bytes32>) -> crate::Result<()> {
    for raw in &message.pins {
        let pin = Bytes32::from_hex(raw).map_err(|_| BatchError::InvalidPin {
            id: message.header.id,
            raw: raw.clone(),
        })?;
        pins.push(pin);
    }
    Ok(())
}
