pub mod alert;
pub mod commands;
pub mod control;
pub mod db;
pub mod detector;
pub mod monitor;
pub mod settings;
mod utils;
pub mod watchdog;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;

use alert::AlertDispatcher;
use db::{Database, EVENT_RETENTION};
use detector::{run_foreground_keepalive, KEEPALIVE_INTERVAL};
use monitor::MonitorController;
use settings::{watch_settings, SettingsStore};
use watchdog::PidFile;

const ENABLE_LOGS: bool = true;

/// Files kept in the focuswatch data directory.
#[derive(Debug, Clone)]
pub struct DataPaths {
    dir: PathBuf,
}

impl DataPaths {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// `<platform data dir>/focuswatch`.
    pub fn default_location() -> Result<Self> {
        let base = dirs::data_dir().ok_or_else(|| anyhow!("no data directory for this user"))?;
        Ok(Self::new(base.join("focuswatch")))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn settings(&self) -> PathBuf {
        self.dir.join("settings.json")
    }

    pub fn database(&self) -> PathBuf {
        self.dir.join("focuswatch.sqlite3")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.dir.join("focuswatch.pid")
    }

    pub fn daemon_log(&self) -> PathBuf {
        self.dir.join("focuswatch.log")
    }

    pub fn control_socket(&self) -> PathBuf {
        self.dir.join("focuswatch.sock")
    }
}

pub fn init_logging() {
    // Info by default; RUST_LOG overrides.
    let _ = env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .try_init();
}

/// Host the usage monitor until stopped.
///
/// Commands arrive on stdin and, on unix, on the control socket. A `stop`
/// command ends monitoring for good (flag cleared, session forgotten). Ctrl-C
/// only ends this process; the persisted session is kept so the next launch
/// can resume it.
pub async fn run_daemon(paths: &DataPaths, manual: bool) -> Result<()> {
    log_info!("focuswatch daemon starting (manual={manual})");
    std::fs::create_dir_all(paths.dir())
        .with_context(|| format!("failed to create {}", paths.dir().display()))?;

    let pid_file = PidFile::new(paths.pid_file());
    if let Some(pid) = pid_file.live_pid() {
        if pid != std::process::id() {
            bail!("monitoring daemon already running as pid {pid}");
        }
    }

    let db = Database::new(paths.database())?;
    let cutoff_ms = Utc::now().timestamp_millis() - EVENT_RETENTION.as_millis() as i64;
    match db.prune_usage_events(cutoff_ms).await {
        Ok(0) => {}
        Ok(pruned) => log_info!("pruned {pruned} usage events older than 24h"),
        Err(err) => log_warn!("failed to prune usage events: {err:#}"),
    }

    let settings = Arc::new(SettingsStore::new(paths.settings())?);
    let cancel_token = CancellationToken::new();
    let settings_task = tokio::spawn(watch_settings(settings.clone(), cancel_token.clone()));
    let keepalive_task = tokio::spawn(run_foreground_keepalive(
        db.clone(),
        KEEPALIVE_INTERVAL,
        cancel_token.clone(),
    ));

    let controller = MonitorController::new(
        db,
        Arc::new(AlertDispatcher::desktop()),
        settings.subscribe(),
    );

    pid_file.write_current()?;
    if let Err(err) = controller.start(manual).await {
        cancel_token.cancel();
        let _ = pid_file.remove();
        return Err(err);
    }

    #[cfg(unix)]
    let socket_task = match control::ControlSocket::bind(paths.control_socket()) {
        Ok(socket) => Some(tokio::spawn(
            socket.serve(controller.clone(), cancel_token.clone()),
        )),
        Err(err) => {
            log_warn!("detached control unavailable: {err:#}");
            None
        }
    };

    let stdin_task = tokio::spawn(control::read_host_commands(
        BufReader::new(tokio::io::stdin()),
        controller.clone(),
        cancel_token.clone(),
    ));

    let stopped = tokio::select! {
        _ = cancel_token.cancelled() => true,
        signal = tokio::signal::ctrl_c() => {
            if let Err(err) = signal {
                log_error!("failed to listen for ctrl-c: {err}");
            }
            log_info!("interrupted; session kept for the next launch");
            false
        }
    };
    cancel_token.cancel();

    controller.shutdown().await?;
    if stopped {
        settings.set_monitoring_enabled(false)?;
        log_info!("monitoring stopped by host command");
    }

    stdin_task.abort();
    #[cfg(unix)]
    if let Some(task) = socket_task {
        if let Err(err) = task.await {
            log_warn!("control socket ended abnormally: {err}");
        }
    }
    for (name, task) in [
        ("settings watcher", settings_task),
        ("foreground keepalive", keepalive_task),
    ] {
        if let Err(err) = task.await {
            log_warn!("{name} ended abnormally: {err}");
        }
    }
    if pid_file.read() == Some(std::process::id()) {
        pid_file.remove()?;
    }

    log_info!("focuswatch daemon exited");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_files_live_in_one_directory() {
        let paths = DataPaths::new(PathBuf::from("/tmp/fw"));
        assert_eq!(paths.settings(), PathBuf::from("/tmp/fw/settings.json"));
        assert_eq!(paths.database(), PathBuf::from("/tmp/fw/focuswatch.sqlite3"));
        assert_eq!(paths.pid_file(), PathBuf::from("/tmp/fw/focuswatch.pid"));
        assert_eq!(paths.daemon_log(), PathBuf::from("/tmp/fw/focuswatch.log"));
        assert_eq!(paths.control_socket(), PathBuf::from("/tmp/fw/focuswatch.sock"));
    }
}
