//! Keeps a still-focused app inside the detection window.
//!
//! Hosts only record transitions, so an app that stays in front for longer
//! than [`DETECTION_WINDOW`](super::DETECTION_WINDOW) would drop out of the
//! replay. While the newest event is a resume, the daemon re-appends it
//! every [`KEEPALIVE_INTERVAL`].

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::db::{Database, UsageEvent, UsageEventKind};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_warn};

/// Must stay well below the detection window.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);

/// Re-append the newest event at `now` when it is a resume at least
/// `refresh_after` old. Returns the refreshed package.
pub async fn refresh_foreground(
    db: &Database,
    now: DateTime<Utc>,
    refresh_after: Duration,
) -> Result<Option<String>> {
    let now_ms = now.timestamp_millis();
    let Some(latest) = db.latest_usage_event(now_ms).await? else {
        return Ok(None);
    };
    if latest.kind != UsageEventKind::Resumed {
        return Ok(None);
    }
    if now_ms - latest.occurred_at_ms < refresh_after.as_millis() as i64 {
        return Ok(None);
    }

    db.insert_usage_event(&UsageEvent::resumed(latest.package.clone(), now_ms))
        .await?;
    log_debug!("foreground keepalive for {}", latest.package);
    Ok(Some(latest.package))
}

pub async fn run_foreground_keepalive(
    db: Database,
    interval: Duration,
    cancel_token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(err) = refresh_foreground(&db, Utc::now(), interval).await {
                    log_warn!("foreground keepalive failed: {err:#}");
                }
            }
        }
    }
}
