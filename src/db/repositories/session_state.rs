use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use crate::db::{
    connection::Database,
    helpers::{to_i64, to_u64},
    models::SessionState,
};

const ENABLE_LOGS: bool = true;

use crate::log_warn;

impl Database {
    /// Replace the persisted session with `(package, consecutive_ms)`, stamped now.
    pub async fn save_session_state(&self, package: &str, consecutive_ms: u64) -> Result<()> {
        self.save_session_state_at(package, consecutive_ms, Utc::now())
            .await
    }

    pub async fn save_session_state_at(
        &self,
        package: &str,
        consecutive_ms: u64,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        let package = package.to_string();
        self.execute(move |conn| {
            // Single-row table: one statement replaces all three fields.
            conn.execute(
                "INSERT OR REPLACE INTO session_state (id, last_package, consecutive_ms, updated_at_ms)
                 VALUES (1, ?1, ?2, ?3)",
                params![package, to_i64(consecutive_ms)?, updated_at.timestamp_millis()],
            )?;
            Ok(())
        })
        .await
    }

    /// Load the persisted session. Anything missing or unreadable yields the
    /// default (empty package, zero elapsed, zero timestamp).
    pub async fn restore_session_state(&self) -> SessionState {
        let result = self
            .execute(|conn| {
                let row = conn
                    .query_row(
                        "SELECT last_package, consecutive_ms, updated_at_ms
                         FROM session_state
                         WHERE id = 1",
                        [],
                        |row| {
                            Ok((
                                row.get::<_, String>(0)?,
                                row.get::<_, i64>(1)?,
                                row.get::<_, i64>(2)?,
                            ))
                        },
                    )
                    .optional()?;

                match row {
                    Some((package, consecutive_ms, updated_at_ms)) => Ok(Some(SessionState {
                        last_tracked_package: package,
                        consecutive_ms: to_u64(consecutive_ms, "consecutive_ms")?,
                        last_update_ms: updated_at_ms.max(0),
                    })),
                    None => Ok(None),
                }
            })
            .await;

        match result {
            Ok(Some(state)) => state,
            Ok(None) => SessionState::default(),
            Err(err) => {
                log_warn!("discarding unreadable session state: {err:#}");
                SessionState::default()
            }
        }
    }

    /// Zero the stored counter. Package and save time are left alone so the
    /// staleness check on resume still measures from the last real tick.
    pub async fn dismiss_session_state(&self) -> Result<()> {
        self.execute(|conn| {
            conn.execute(
                "UPDATE session_state SET consecutive_ms = 0 WHERE id = 1",
                [],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn clear_session_state(&self) -> Result<()> {
        self.execute(|conn| {
            conn.execute("DELETE FROM session_state", [])?;
            Ok(())
        })
        .await
    }
}
