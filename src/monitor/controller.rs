use anyhow::{anyhow, bail, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::alert::AlertSink;
use crate::db::Database;
use crate::detector::ForegroundDetector;
use crate::settings::TrackedConfig;

use super::loop_worker::{monitor_loop, CommandEnvelope, MonitorCommand, MonitorContext};
use super::state::{MonitorState, STALE_SESSION_BOUND, TICK_INTERVAL};

const ENABLE_LOGS: bool = true;

use crate::log_info;

const COMMAND_QUEUE_DEPTH: usize = 16;

struct RunningMonitor {
    handle: JoinHandle<()>,
    cancel_token: CancellationToken,
    commands: mpsc::Sender<CommandEnvelope>,
}

/// Start/stop and out-of-band control of the usage monitor.
///
/// At most one monitor loop runs per controller; it is the only writer of
/// the persisted session state while it runs.
#[derive(Clone)]
pub struct MonitorController {
    ctx: MonitorContext,
    running: Arc<Mutex<Option<RunningMonitor>>>,
    state_tx: Arc<watch::Sender<MonitorState>>,
}

impl MonitorController {
    pub fn new(
        db: Database,
        sink: Arc<dyn AlertSink>,
        config_rx: watch::Receiver<Arc<TrackedConfig>>,
    ) -> Self {
        Self::with_timing(db, sink, config_rx, TICK_INTERVAL, STALE_SESSION_BOUND)
    }

    pub fn with_timing(
        db: Database,
        sink: Arc<dyn AlertSink>,
        config_rx: watch::Receiver<Arc<TrackedConfig>>,
        tick_interval: Duration,
        stale_bound: Duration,
    ) -> Self {
        let (state_tx, _) = watch::channel(MonitorState::Idle);
        Self {
            ctx: MonitorContext {
                detector: ForegroundDetector::new(db.clone()),
                db,
                sink,
                config_rx,
                tick_interval,
                stale_bound,
            },
            running: Arc::new(Mutex::new(None)),
            state_tx: Arc::new(state_tx),
        }
    }

    pub fn state(&self) -> MonitorState {
        self.state_tx.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<MonitorState> {
        self.state_tx.subscribe()
    }

    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|running| !running.handle.is_finished())
            .unwrap_or(false)
    }

    /// Begin monitoring. A manual start discards any persisted session; an
    /// automatic one (process relaunch, watchdog) tries to resume it.
    pub async fn start(&self, manual: bool) -> Result<()> {
        let mut guard = self.running.lock().await;
        if guard
            .as_ref()
            .map(|running| !running.handle.is_finished())
            .unwrap_or(false)
        {
            bail!("monitoring already active");
        }

        let cancel_token = CancellationToken::new();
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);

        let handle = tokio::spawn(monitor_loop(
            self.ctx.clone(),
            manual,
            commands_rx,
            self.state_tx.clone(),
            cancel_token.clone(),
        ));

        *guard = Some(RunningMonitor {
            handle,
            cancel_token,
            commands: commands_tx,
        });
        log_info!("monitoring started (manual={manual})");
        Ok(())
    }

    /// Stop monitoring and forget the session.
    pub async fn stop(&self) -> Result<()> {
        self.halt().await?;
        self.ctx
            .db
            .clear_session_state()
            .await
            .context("failed to clear session state")?;
        self.state_tx.send_replace(MonitorState::Idle);
        log_info!("monitoring stopped");
        Ok(())
    }

    /// Stop the loop but keep the persisted session so the next launch can
    /// resume it. Used on process exit.
    pub async fn shutdown(&self) -> Result<()> {
        self.halt().await
    }

    /// Zero the current counter and persist. Accepted whether or not the
    /// loop is running.
    pub async fn dismiss(&self) -> Result<()> {
        if self.send(MonitorCommand::Dismiss).await? {
            return Ok(());
        }

        self.ctx.db.dismiss_session_state().await
    }

    /// Screen turned off or locked: cancel the pending tick and suspend.
    pub async fn screen_off(&self) -> Result<()> {
        self.send(MonitorCommand::ScreenOff).await.map(|_| ())
    }

    /// Screen back on: rerun the resume decision and tick right away.
    pub async fn screen_on(&self) -> Result<()> {
        self.send(MonitorCommand::ScreenOn).await.map(|_| ())
    }

    /// Deliver a command to the running loop and wait until it is applied.
    /// Returns `false` when no loop is running.
    async fn send(&self, command: MonitorCommand) -> Result<bool> {
        let commands = {
            let guard = self.running.lock().await;
            match guard.as_ref() {
                Some(running) if !running.handle.is_finished() => running.commands.clone(),
                _ => return Ok(false),
            }
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        commands
            .send((command, ack_tx))
            .await
            .map_err(|_| anyhow!("monitor loop is not accepting commands"))?;
        ack_rx
            .await
            .map_err(|_| anyhow!("monitor loop exited before applying {command:?}"))?;
        Ok(true)
    }

    async fn halt(&self) -> Result<()> {
        let running = self.running.lock().await.take();
        if let Some(running) = running {
            running.cancel_token.cancel();
            running
                .handle
                .await
                .context("monitor loop task failed to join")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::{AlertPreferences, UsageAlert};
    use crate::db::UsageEvent;
    use chrono::Utc;
    use std::collections::BTreeSet;
    use tempfile::tempdir;

    #[derive(Default)]
    struct RecordingSink {
        alerts: std::sync::Mutex<Vec<(UsageAlert, AlertPreferences)>>,
    }

    impl AlertSink for RecordingSink {
        fn deliver(&self, alert: &UsageAlert, preferences: AlertPreferences) {
            self.alerts
                .lock()
                .unwrap()
                .push((alert.clone(), preferences));
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        db: Database,
        sink: Arc<RecordingSink>,
        config_tx: watch::Sender<Arc<TrackedConfig>>,
        controller: MonitorController,
    }

    fn config(threshold: Duration, tracked: &[&str]) -> Arc<TrackedConfig> {
        Arc::new(TrackedConfig {
            tracked_packages: tracked.iter().map(|p| p.to_string()).collect::<BTreeSet<_>>(),
            threshold,
            sound_enabled: true,
            vibration_enabled: false,
        })
    }

    fn harness(tick_interval: Duration, config: Arc<TrackedConfig>) -> Harness {
        harness_with_bound(tick_interval, STALE_SESSION_BOUND, config)
    }

    fn harness_with_bound(
        tick_interval: Duration,
        stale_bound: Duration,
        config: Arc<TrackedConfig>,
    ) -> Harness {
        let dir = tempdir().unwrap();
        let db = Database::new(dir.path().join("monitor.sqlite3")).unwrap();
        let sink = Arc::new(RecordingSink::default());
        let (config_tx, config_rx) = watch::channel(config);
        let controller = MonitorController::with_timing(
            db.clone(),
            sink.clone(),
            config_rx,
            tick_interval,
            stale_bound,
        );
        Harness {
            _dir: dir,
            db,
            sink,
            config_tx,
            controller,
        }
    }

    async fn bring_to_foreground(db: &Database, package: &str) {
        db.insert_usage_event(&UsageEvent::resumed(package, Utc::now().timestamp_millis()))
            .await
            .unwrap();
    }

    async fn wait_for<F>(rx: &mut watch::Receiver<MonitorState>, pred: F) -> MonitorState
    where
        F: Fn(&MonitorState) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let current = rx.borrow_and_update().clone();
                if pred(&current) {
                    return current;
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .expect("monitor never reached the expected state")
    }

    fn accumulating(package: &str, elapsed_ms: u64) -> MonitorState {
        MonitorState::Accumulating {
            package: package.to_string(),
            elapsed_ms,
        }
    }

    const SLOW_TICK: Duration = Duration::from_secs(30);
    const TWENTY_MINUTES: Duration = Duration::from_secs(20 * 60);

    #[tokio::test]
    async fn manual_start_accumulates_and_persists() {
        let h = harness(Duration::from_millis(20), config(TWENTY_MINUTES, &["x"]));
        h.db.save_session_state("x", 300_000).await.unwrap();
        bring_to_foreground(&h.db, "x").await;
        let mut rx = h.controller.subscribe_state();

        h.controller.start(true).await.unwrap();
        let state = wait_for(&mut rx, |s| s.elapsed_ms() >= 60).await;

        // Manual start discarded the persisted 300 s.
        assert_eq!(state.package(), "x");
        assert!(state.elapsed_ms() < 300_000);
        assert_eq!(state.elapsed_ms() % 20, 0);

        let persisted = h.db.restore_session_state().await;
        assert_eq!(persisted.last_tracked_package, "x");

        h.controller.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn threshold_crossing_reaches_the_sink() {
        let h = harness(Duration::from_millis(20), config(Duration::from_millis(100), &["x"]));
        bring_to_foreground(&h.db, "x").await;

        h.controller.start(true).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while h.sink.alerts.lock().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("no alert delivered");
        h.controller.shutdown().await.unwrap();

        let alerts = h.sink.alerts.lock().unwrap();
        let (alert, preferences) = &alerts[0];
        assert_eq!(alert.package, "x");
        assert_eq!(alert.minutes_used, 0);
        assert_eq!(
            *preferences,
            AlertPreferences {
                sound: true,
                vibration: false
            }
        );
    }

    #[tokio::test]
    async fn restart_resumes_recent_session() {
        let h = harness(SLOW_TICK, config(TWENTY_MINUTES, &["x"]));
        h.db.save_session_state("x", 300_000).await.unwrap();
        bring_to_foreground(&h.db, "x").await;
        let mut rx = h.controller.subscribe_state();

        h.controller.start(false).await.unwrap();
        let state = wait_for(&mut rx, |s| s.elapsed_ms() > 0).await;
        assert_eq!(state, accumulating("x", 330_000));

        h.controller.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn restart_after_stale_gap_starts_over() {
        let h = harness(SLOW_TICK, config(TWENTY_MINUTES, &["x"]));
        let ten_minutes_ago = Utc::now() - chrono::Duration::minutes(10);
        h.db.save_session_state_at("x", 300_000, ten_minutes_ago)
            .await
            .unwrap();
        bring_to_foreground(&h.db, "x").await;
        let mut rx = h.controller.subscribe_state();

        h.controller.start(false).await.unwrap();
        let state = wait_for(&mut rx, |s| s.package() == "x").await;
        assert_eq!(state, accumulating("x", 0));

        h.controller.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn dismiss_twice_matches_dismiss_once() {
        let h = harness(SLOW_TICK, config(TWENTY_MINUTES, &["x"]));
        h.db.save_session_state("x", 300_000).await.unwrap();
        bring_to_foreground(&h.db, "x").await;
        let mut rx = h.controller.subscribe_state();

        h.controller.start(false).await.unwrap();
        wait_for(&mut rx, |s| s.elapsed_ms() == 330_000).await;

        h.controller.dismiss().await.unwrap();
        let once = (h.controller.state(), h.db.restore_session_state().await);
        h.controller.dismiss().await.unwrap();
        let twice = (h.controller.state(), h.db.restore_session_state().await);

        assert_eq!(once.0, accumulating("x", 0));
        assert_eq!(once.1.consecutive_ms, 0);
        assert_eq!(once.1.last_tracked_package, "x");
        assert_eq!(once.0, twice.0);
        assert_eq!(
            (twice.1.last_tracked_package, twice.1.consecutive_ms),
            ("x".to_string(), 0)
        );

        h.controller.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn dismiss_without_running_loop_zeroes_persisted_counter() {
        let h = harness(SLOW_TICK, config(TWENTY_MINUTES, &["x"]));
        h.db.save_session_state("x", 300_000).await.unwrap();

        h.controller.dismiss().await.unwrap();
        let persisted = h.db.restore_session_state().await;
        assert_eq!(persisted.last_tracked_package, "x");
        assert_eq!(persisted.consecutive_ms, 0);
    }

    #[tokio::test]
    async fn screen_off_suspends_and_screen_on_resumes() {
        let h = harness(SLOW_TICK, config(TWENTY_MINUTES, &["x"]));
        h.db.save_session_state("x", 300_000).await.unwrap();
        bring_to_foreground(&h.db, "x").await;
        let mut rx = h.controller.subscribe_state();

        h.controller.start(false).await.unwrap();
        wait_for(&mut rx, |s| s.elapsed_ms() == 330_000).await;

        h.controller.screen_off().await.unwrap();
        assert_eq!(h.controller.state(), MonitorState::Idle);
        // Persisted row is the snapshot from the last tick.
        assert_eq!(h.db.restore_session_state().await.consecutive_ms, 330_000);

        h.controller.screen_on().await.unwrap();
        let state = wait_for(&mut rx, |s| s.elapsed_ms() == 360_000).await;
        assert_eq!(state, accumulating("x", 360_000));

        h.controller.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn dismiss_while_screen_is_off_resumes_from_zero() {
        let h = harness(SLOW_TICK, config(TWENTY_MINUTES, &["x"]));
        h.db.save_session_state("x", 300_000).await.unwrap();
        bring_to_foreground(&h.db, "x").await;
        let mut rx = h.controller.subscribe_state();

        h.controller.start(false).await.unwrap();
        wait_for(&mut rx, |s| s.elapsed_ms() == 330_000).await;
        h.controller.screen_off().await.unwrap();
        let before = h.db.restore_session_state().await;

        h.controller.dismiss().await.unwrap();
        let after = h.db.restore_session_state().await;
        assert_eq!(after.last_tracked_package, "x");
        assert_eq!(after.consecutive_ms, 0);
        assert_eq!(after.last_update_ms, before.last_update_ms);
        assert_eq!(h.controller.state(), MonitorState::Idle);

        h.controller.screen_on().await.unwrap();
        let state = wait_for(&mut rx, |s| s.elapsed_ms() == 30_000).await;
        assert_eq!(state, accumulating("x", 30_000));

        h.controller.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn dismiss_while_screen_is_off_does_not_refresh_staleness() {
        let stale_bound = Duration::from_millis(300);
        let h = harness_with_bound(SLOW_TICK, stale_bound, config(TWENTY_MINUTES, &["x"]));
        h.db.save_session_state("x", 300_000).await.unwrap();
        bring_to_foreground(&h.db, "x").await;
        let mut rx = h.controller.subscribe_state();

        h.controller.start(false).await.unwrap();
        wait_for(&mut rx, |s| s.elapsed_ms() == 330_000).await;
        h.controller.screen_off().await.unwrap();

        // Dismissed inside the bound, screen back on past it (measured from
        // the last tick, not from the dismiss).
        tokio::time::sleep(Duration::from_millis(150)).await;
        h.controller.dismiss().await.unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        h.controller.screen_on().await.unwrap();

        // A resumed session would be at 30 s after the immediate tick; a
        // stale one restarts at zero.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.controller.state(), accumulating("x", 0));

        h.controller.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn config_updates_apply_to_later_ticks() {
        let h = harness(Duration::from_millis(20), config(TWENTY_MINUTES, &[]));
        bring_to_foreground(&h.db, "x").await;
        let mut rx = h.controller.subscribe_state();

        h.controller.start(true).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.controller.state(), MonitorState::Idle);

        h.config_tx.send_replace(config(TWENTY_MINUTES, &["x"]));
        let state = wait_for(&mut rx, |s| s.package() == "x").await;
        assert_eq!(state.package(), "x");

        h.controller.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn stop_clears_persisted_state() {
        let h = harness(Duration::from_millis(20), config(TWENTY_MINUTES, &["x"]));
        bring_to_foreground(&h.db, "x").await;
        let mut rx = h.controller.subscribe_state();

        h.controller.start(true).await.unwrap();
        wait_for(&mut rx, |s| s.package() == "x").await;
        assert!(h.controller.is_running().await);

        h.controller.stop().await.unwrap();
        assert!(!h.controller.is_running().await);
        assert_eq!(h.controller.state(), MonitorState::Idle);
        assert!(h.db.restore_session_state().await.is_empty());
        assert_eq!(h.db.restore_session_state().await.last_update_ms, 0);
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let h = harness(SLOW_TICK, config(TWENTY_MINUTES, &["x"]));
        h.controller.start(true).await.unwrap();
        assert!(h.controller.start(true).await.is_err());
        h.controller.shutdown().await.unwrap();

        // After shutdown a new run may begin.
        h.controller.start(false).await.unwrap();
        h.controller.shutdown().await.unwrap();
    }
}
