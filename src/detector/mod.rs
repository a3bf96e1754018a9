//! Foreground app detection from the usage event log.
//!
//! Each call replays the resume/pause events of a short trailing window
//! instead of trusting per-app "last used" timestamps: when several apps were
//! active recently the timestamps alone can point at the wrong one, while the
//! event order cannot.

mod keepalive;

pub use keepalive::{refresh_foreground, run_foreground_keepalive, KEEPALIVE_INTERVAL};

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::db::{Database, UsageEvent, UsageEventKind};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_warn};

/// Trailing window replayed on every query. Wide enough to absorb irregular
/// polling and late event delivery.
pub const DETECTION_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Upper bound on a single event-log query.
pub const DETECTION_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForegroundSample {
    pub package: Option<String>,
    pub sampled_at: DateTime<Utc>,
}

/// Replay events (oldest first) through a single "currently resumed" slot.
///
/// A pause only clears the slot when it names the app in it, so a late pause
/// for an app that already lost focus cannot blank out its successor.
pub fn replay_foreground<'a, I>(events: I) -> Option<String>
where
    I: IntoIterator<Item = &'a UsageEvent>,
{
    let mut resumed: Option<&str> = None;
    for event in events {
        match event.kind {
            UsageEventKind::Resumed => resumed = Some(event.package.as_str()),
            UsageEventKind::Paused => {
                if resumed == Some(event.package.as_str()) {
                    resumed = None;
                }
            }
        }
    }
    resumed.map(str::to_string)
}

/// Stateless across calls: every query recomputes from the window ending at
/// "now", so it tolerates being called at arbitrary intervals.
#[derive(Clone)]
pub struct ForegroundDetector {
    db: Database,
    window: Duration,
    timeout: Duration,
}

impl ForegroundDetector {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            window: DETECTION_WINDOW,
            timeout: DETECTION_TIMEOUT,
        }
    }

    pub async fn current_foreground_app(&self) -> Option<String> {
        self.sample_at(Utc::now()).await.package
    }

    /// Never fails: an unreadable log or a slow query counts as "nothing
    /// detected".
    pub async fn sample_at(&self, now: DateTime<Utc>) -> ForegroundSample {
        let end_ms = now.timestamp_millis();
        let begin_ms = end_ms - self.window.as_millis() as i64;

        let query = self.db.query_usage_events(begin_ms, end_ms);
        let package = match tokio::time::timeout(self.timeout, query).await {
            Ok(Ok(events)) => {
                let package = replay_foreground(&events);
                log_debug!(
                    "replayed {} usage events, foreground={:?}",
                    events.len(),
                    package
                );
                package
            }
            Ok(Err(err)) => {
                log_warn!("usage event query failed: {err:#}");
                None
            }
            Err(_) => {
                log_warn!(
                    "usage event query timed out (> {}ms)",
                    self.timeout.as_millis()
                );
                None
            }
        };

        ForegroundSample {
            package,
            sampled_at: now,
        }
    }
}
