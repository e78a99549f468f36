//! Identity atoms: row identifiers, 32-byte values, namespaces.
//!
//! Everything that is persisted gets a newtype so a `BatchId` can never be
//! handed to a function expecting a `MessageId`.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::error::{CoreError, InvalidId};

/// Namespace identity - the partition every row in this subsystem belongs to.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NamespaceId(String);

impl NamespaceId {
    const MAX_LEN: usize = 64;

    pub fn parse(s: impl Into<String>) -> Result<Self, CoreError> {
        let raw = s.into();
        if raw.is_empty() {
            return Err(InvalidId::Namespace {
                raw,
                reason: "empty".into(),
            }
            .into());
        }
        if raw.len() > Self::MAX_LEN {
            return Err(InvalidId::Namespace {
                raw,
                reason: format!("length must be <= {}", Self::MAX_LEN),
            }
            .into());
        }
        let bytes = raw.as_bytes();
        if !bytes[0].is_ascii_lowercase() {
            return Err(InvalidId::Namespace {
                raw,
                reason: "must start with [a-z]".into(),
            }
            .into());
        }
        for &b in &bytes[1..] {
            let ok = b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_';
            if !ok {
                return Err(InvalidId::Namespace {
                    raw,
                    reason: "contains invalid character".into(),
                }
                .into());
            }
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for NamespaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NamespaceId({:?})", self.0)
    }
}

impl fmt::Display for NamespaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for NamespaceId {
    type Error = CoreError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        NamespaceId::parse(s)
    }
}

impl From<NamespaceId> for String {
    fn from(ns: NamespaceId) -> String {
        ns.0
    }
}

/// 32-byte value: group ids, data hashes, pins, nonce context hashes.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Bytes32([u8; 32]);

impl Bytes32 {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from a 64-char hex string.
    pub fn from_hex(s: &str) -> Result<Self, CoreError> {
        let decoded = hex::decode(s).map_err(|_| InvalidId::Hash {
            raw: s.to_string(),
            reason: "contains invalid hex".into(),
        })?;
        let bytes: [u8; 32] = decoded.try_into().map_err(|_| InvalidId::Hash {
            raw: s.to_string(),
            reason: "must be 64 hex chars".into(),
        })?;
        Ok(Self(bytes))
    }
}

impl fmt::Debug for Bytes32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bytes32({})", self.to_hex())
    }
}

impl fmt::Display for Bytes32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for Bytes32 {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Bytes32 {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Bytes32::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// SHA-256 of arbitrary bytes as a [`Bytes32`].
pub fn sha256_bytes(data: &[u8]) -> Bytes32 {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let out = hasher.finalize();
    let mut buf = [0u8; 32];
    buf.copy_from_slice(&out);
    Bytes32(buf)
}

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new(id: Uuid) -> Self {
                Self(id)
            }

            pub fn random() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Message row identifier.
    MessageId
);
uuid_id!(
    /// Batch row identifier. Minted once per assembly and reused across
    /// flush retries, which is what makes the flush idempotent.
    BatchId
);
uuid_id!(
    /// Data row identifier.
    DataId
);
uuid_id!(
    /// Transaction row identifier.
    TxId
);
uuid_id!(
    /// Event row identifier.
    EventId
);
uuid_id!(
    /// Local node identifier, stamped into batch headers.
    NodeId
);

impl BatchId {
    /// Parse a batch id from its canonical string form.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        let trimmed = s.trim();
        Uuid::parse_str(trimmed).map(Self).map_err(|_| {
            InvalidId::Batch {
                raw: s.to_string(),
                reason: "must be a UUID".into(),
            }
            .into()
        })
    }
}
