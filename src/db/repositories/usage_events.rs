use std::time::Duration;

use anyhow::Result;
use rusqlite::{params, Row};

use crate::db::{
    connection::Database,
    models::{UsageEvent, UsageEventKind},
};

/// How long recorded events are kept before the daemon prunes them.
pub const EVENT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

fn row_to_usage_event(row: &Row) -> Result<UsageEvent> {
    let kind: String = row.get("kind")?;

    Ok(UsageEvent {
        package: row.get("package")?,
        kind: kind.parse::<UsageEventKind>()?,
        occurred_at_ms: row.get("occurred_at_ms")?,
    })
}

impl Database {
    pub async fn insert_usage_event(&self, event: &UsageEvent) -> Result<()> {
        let record = event.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO usage_events (package, kind, occurred_at_ms)
                 VALUES (?1, ?2, ?3)",
                params![record.package, record.kind.as_str(), record.occurred_at_ms],
            )?;
            Ok(())
        })
        .await
    }

    /// Events with `begin_ms <= occurred_at_ms <= end_ms`, oldest first.
    /// Events sharing a timestamp come back in insertion order.
    pub async fn query_usage_events(&self, begin_ms: i64, end_ms: i64) -> Result<Vec<UsageEvent>> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT package, kind, occurred_at_ms
                 FROM usage_events
                 WHERE occurred_at_ms >= ?1 AND occurred_at_ms <= ?2
                 ORDER BY occurred_at_ms ASC, id ASC",
            )?;

            let mut rows = stmt.query(params![begin_ms, end_ms])?;
            let mut events = Vec::new();
            while let Some(row) = rows.next()? {
                events.push(row_to_usage_event(row)?);
            }

            Ok(events)
        })
        .await
    }

    /// Most recent event at or before `at_ms`, if any.
    pub async fn latest_usage_event(&self, at_ms: i64) -> Result<Option<UsageEvent>> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT package, kind, occurred_at_ms
                 FROM usage_events
                 WHERE occurred_at_ms <= ?1
                 ORDER BY occurred_at_ms DESC, id DESC
                 LIMIT 1",
            )?;

            let mut rows = stmt.query(params![at_ms])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_usage_event(row)?)),
                None => Ok(None),
            }
        })
        .await
    }

    /// Delete events older than `before_ms`, returning how many were removed.
    pub async fn prune_usage_events(&self, before_ms: i64) -> Result<usize> {
        self.execute(move |conn| {
            let removed = conn.execute(
                "DELETE FROM usage_events WHERE occurred_at_ms < ?1",
                params![before_ms],
            )?;
            Ok(removed)
        })
        .await
    }
}
