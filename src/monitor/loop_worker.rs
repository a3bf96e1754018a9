use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::alert::{AlertSink, UsageAlert};
use crate::db::Database;
use crate::detector::ForegroundDetector;
use crate::settings::TrackedConfig;

use super::state::{resume_decision, MonitorState, TickOutcome, UsageEngine};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorCommand {
    ScreenOff,
    ScreenOn,
    Dismiss,
}

pub(crate) type CommandEnvelope = (MonitorCommand, oneshot::Sender<()>);

/// Everything the loop borrows from its host.
#[derive(Clone)]
pub struct MonitorContext {
    pub db: Database,
    pub detector: ForegroundDetector,
    pub sink: Arc<dyn AlertSink>,
    pub config_rx: watch::Receiver<Arc<TrackedConfig>>,
    pub tick_interval: Duration,
    pub stale_bound: Duration,
}

/// Owns the engine for the lifetime of one monitoring run.
///
/// Ticks never overlap: the next one is due `tick_interval` after the
/// previous one was due, and a late loop ticks once rather than catching
/// up. Commands are handled between ticks and
/// acknowledged once applied.
pub(crate) async fn monitor_loop(
    ctx: MonitorContext,
    manual: bool,
    mut commands: mpsc::Receiver<CommandEnvelope>,
    state_tx: Arc<watch::Sender<MonitorState>>,
    cancel_token: CancellationToken,
) {
    let mut engine = startup(&ctx, manual).await;
    state_tx.send_replace(engine.state().clone());

    let mut suspended = false;
    let mut commands_open = true;
    let mut next_tick = Instant::now();

    loop {
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => {
                log_info!("monitor loop shutting down");
                break;
            }
            envelope = commands.recv(), if commands_open => {
                let Some((command, ack)) = envelope else {
                    commands_open = false;
                    continue;
                };

                match command {
                    MonitorCommand::ScreenOff => {
                        if !suspended {
                            // The persisted row keeps the last tick so a quick
                            // screen-on can pick the session back up.
                            suspended = true;
                            engine.reset();
                            log_info!("screen off: ticks suspended");
                        }
                    }
                    MonitorCommand::ScreenOn => {
                        if suspended {
                            engine = startup(&ctx, false).await;
                            suspended = false;
                            next_tick = Instant::now();
                            log_info!("screen on: resumed as {:?}", engine.state());
                        }
                    }
                    MonitorCommand::Dismiss => {
                        engine.dismiss();
                        if suspended {
                            dismiss_persisted(&ctx.db).await;
                        } else {
                            persist(&ctx.db, &engine).await;
                        }
                        log_info!("alert dismissed; counter reset");
                    }
                }

                state_tx.send_replace(engine.state().clone());
                let _ = ack.send(());
            }
            _ = sleep_until(next_tick), if !suspended => {
                run_tick(&ctx, &mut engine).await;
                state_tx.send_replace(engine.state().clone());
                next_tick = (next_tick + ctx.tick_interval).max(Instant::now());
            }
        }
    }
}

/// Decide the initial engine state for a (re)start.
async fn startup(ctx: &MonitorContext, manual: bool) -> UsageEngine {
    if manual {
        if let Err(err) = ctx.db.save_session_state("", 0).await {
            log_error!("failed to reset session state on manual start: {err:#}");
        }
        log_info!("manual start: new session");
        return UsageEngine::new(ctx.tick_interval);
    }

    let persisted = ctx.db.restore_session_state().await;
    let now = Utc::now();
    let detected = ctx.detector.sample_at(now).await.package;
    let state = resume_decision(
        &persisted,
        detected.as_deref(),
        now.timestamp_millis(),
        ctx.stale_bound,
        ctx.tick_interval,
    );

    match &state {
        MonitorState::Accumulating {
            package,
            elapsed_ms,
        } => log_info!("resuming session for {package} at {elapsed_ms}ms"),
        MonitorState::Idle if !persisted.last_tracked_package.is_empty() => log_info!(
            "not resuming session for {} (detected {:?})",
            persisted.last_tracked_package,
            detected
        ),
        MonitorState::Idle => {}
    }

    UsageEngine::with_state(state, ctx.tick_interval)
}

async fn run_tick(ctx: &MonitorContext, engine: &mut UsageEngine) {
    // Config changes apply from the next tick on.
    let config = ctx.config_rx.borrow().clone();
    let sample = ctx.detector.sample_at(Utc::now()).await;

    let outcome = engine.tick(sample.package.as_deref(), &config);
    match &outcome {
        TickOutcome::AlertFired {
            package,
            minutes_used,
        } => {
            log_info!("threshold reached for {package}: {minutes_used} minutes");
            let alert = UsageAlert::new(package.clone(), *minutes_used);
            ctx.sink.deliver(&alert, config.alert_preferences());
        }
        other => log_debug!("tick {:?} -> {:?}", sample.package, other),
    }

    persist(&ctx.db, engine).await;
}

/// A failed write is retried implicitly by the next tick.
async fn persist(db: &Database, engine: &UsageEngine) {
    let state = engine.state();
    if let Err(err) = db
        .save_session_state(state.package(), state.elapsed_ms())
        .await
    {
        log_error!("failed to persist session state: {err:#}");
    }
}

/// Dismiss while suspended: zero the stored counter but keep its package and
/// save time, so screen-on can still resume a session suspended only briefly.
async fn dismiss_persisted(db: &Database) {
    if let Err(err) = db.dismiss_session_state().await {
        log_warn!("failed to persist dismiss while suspended: {err:#}");
    }
}
