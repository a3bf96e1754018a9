//! Persisted engine state.
//!
//! The row shape is exactly `(last_package, consecutive_ms, updated_at_ms)`;
//! there is no version column, so changing it means a migration or a reset.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    /// Empty when no tracked app was being accumulated.
    pub last_tracked_package: String,
    pub consecutive_ms: u64,
    /// Epoch milliseconds of the last save, 0 when nothing was ever saved.
    pub last_update_ms: i64,
}

impl SessionState {
    pub fn new(
        last_tracked_package: impl Into<String>,
        consecutive_ms: u64,
        last_update_ms: i64,
    ) -> Self {
        Self {
            last_tracked_package: last_tracked_package.into(),
            consecutive_ms,
            last_update_ms,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.last_tracked_package.is_empty() && self.consecutive_ms == 0
    }

    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        if self.last_update_ms <= 0 {
            return None;
        }
        Utc.timestamp_millis_opt(self.last_update_ms).single()
    }
}
