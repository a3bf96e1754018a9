//! Operations behind the `focuswatch` subcommands that do not host the
//! monitor themselves.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use clap::Subcommand;
use serde::Serialize;

use crate::control::HostCommand;
use crate::db::{Database, SessionState, UsageEvent, UsageEventKind};
use crate::detector::ForegroundDetector;
use crate::settings::{SettingsStore, UserSettings};
use crate::watchdog::{terminate_process, wait_for_exit, DaemonLauncher, PidFile, EXIT_WAIT};
use crate::DataPaths;

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum ConfigAction {
    /// Print the current settings as JSON
    Show,
    /// Add an app identifier to the tracked set
    Track { package: String },
    /// Remove an app identifier from the tracked set
    Untrack { package: String },
    /// Alert threshold in minutes (clamped to 5..=120)
    Threshold { minutes: f32 },
    /// Play a chime when an alert fires
    Sound {
        #[arg(action = clap::ArgAction::Set)]
        enabled: bool,
    },
    /// Play the buzz pattern when an alert fires
    Vibration {
        #[arg(action = clap::ArgAction::Set)]
        enabled: bool,
    },
}

pub fn apply_config(store: &SettingsStore, action: ConfigAction) -> Result<UserSettings> {
    match action {
        ConfigAction::Show => Ok(store.snapshot()),
        ConfigAction::Track { package } => {
            let package = package.trim();
            if package.is_empty() {
                bail!("app identifier must not be empty");
            }
            store.track(package)
        }
        ConfigAction::Untrack { package } => store.untrack(package.trim()),
        ConfigAction::Threshold { minutes } => store.set_threshold_minutes(minutes),
        ConfigAction::Sound { enabled } => store.set_sound_enabled(enabled),
        ConfigAction::Vibration { enabled } => store.set_vibration_enabled(enabled),
    }
}

/// Turn monitoring on and launch a daemon that starts a fresh session.
pub fn start_monitoring(paths: &DataPaths, launcher: &dyn DaemonLauncher) -> Result<u32> {
    let settings = SettingsStore::new(paths.settings())?;
    settings.set_monitoring_enabled(true)?;

    let pid_file = PidFile::new(paths.pid_file());
    if let Some(pid) = pid_file.live_pid() {
        bail!("monitoring already active (pid {pid})");
    }

    let pid = launcher.launch(true)?;
    log_info!("monitoring daemon launched as pid {pid}");
    Ok(pid)
}

/// Turn monitoring off, end the daemon and forget the session. Returns the
/// pid of the daemon that was running, if any.
///
/// A daemon that will not exit is an error; its pid file and session are
/// left in place.
pub async fn stop_monitoring(paths: &DataPaths) -> Result<Option<u32>> {
    let settings = SettingsStore::new(paths.settings())?;
    settings.set_monitoring_enabled(false)?;

    let pid_file = PidFile::new(paths.pid_file());
    let running = pid_file.live_pid();
    if let Some(pid) = running {
        if !end_daemon(paths, pid).await {
            bail!("monitoring daemon (pid {pid}) did not exit; session left in place");
        }
        log_info!("monitoring daemon pid {pid} exited");
    }
    pid_file.remove()?;

    let db = Database::new(paths.database())?;
    db.clear_session_state().await?;
    Ok(running)
}

/// Ask over the control socket first, then fall back to a signal.
async fn end_daemon(paths: &DataPaths, pid: u32) -> bool {
    match deliver(paths, HostCommand::Stop).await {
        Ok(()) => {
            if wait_for_exit(pid, EXIT_WAIT).await {
                return true;
            }
            log_warn!("daemon pid {pid} acknowledged stop but is still running");
        }
        Err(err) => log_warn!("stop over control socket failed: {err:#}"),
    }
    terminate_process(pid).await
}

/// Hand a host command to the running daemon. Returns whether a daemon took
/// it.
///
/// With no daemon, `dismiss` still zeroes the persisted counter so the next
/// launch resumes from 0; the screen commands need a daemon.
pub async fn send_command(paths: &DataPaths, command: HostCommand) -> Result<bool> {
    if PidFile::new(paths.pid_file()).live_pid().is_some() {
        deliver(paths, command).await?;
        return Ok(true);
    }

    match command {
        HostCommand::Dismiss => {
            let db = Database::new(paths.database())?;
            db.dismiss_session_state().await?;
            Ok(false)
        }
        other => bail!("monitoring daemon is not running; cannot {}", other.as_str()),
    }
}

#[cfg(unix)]
async fn deliver(paths: &DataPaths, command: HostCommand) -> Result<()> {
    crate::control::send_control_command(&paths.control_socket(), command).await
}

#[cfg(not(unix))]
async fn deliver(_paths: &DataPaths, command: HostCommand) -> Result<()> {
    bail!("{} needs the control socket, which is unix-only", command.as_str())
}

pub async fn record_event(
    paths: &DataPaths,
    kind: UsageEventKind,
    package: &str,
    at: DateTime<Utc>,
) -> Result<UsageEvent> {
    let package = package.trim();
    if package.is_empty() {
        bail!("app identifier must not be empty");
    }

    let event = UsageEvent {
        package: package.to_string(),
        kind,
        occurred_at_ms: at.timestamp_millis(),
    };
    let db = Database::new(paths.database())?;
    db.insert_usage_event(&event).await?;
    Ok(event)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub daemon_pid: Option<u32>,
    pub monitoring_enabled: bool,
    pub foreground_app: Option<String>,
    pub session: SessionState,
    pub last_saved: Option<DateTime<Utc>>,
}

pub async fn status(paths: &DataPaths) -> Result<StatusReport> {
    let settings = SettingsStore::new(paths.settings())?;
    let db = Database::new(paths.database())?;
    let detector = ForegroundDetector::new(db.clone());

    let session = db.restore_session_state().await;

    Ok(StatusReport {
        daemon_pid: PidFile::new(paths.pid_file()).live_pid(),
        monitoring_enabled: settings.snapshot().monitoring_enabled,
        foreground_app: detector.current_foreground_app().await,
        last_saved: session.last_update(),
        session,
    })
}
