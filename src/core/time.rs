//! Wall-clock timestamps for persisted rows.

use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch.
///
/// Used for row timestamps and idle accounting, never for ordering decisions
/// (ordering is always the store-assigned sequence).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WallClock(pub u64);

impl WallClock {
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        Self(
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        )
    }
}
