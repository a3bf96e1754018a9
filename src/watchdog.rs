//! Out-of-band liveness check for the monitoring daemon.
//!
//! The daemon records its pid on startup. The watchdog runs as its own
//! process, looks the pid up with `sysinfo` and relaunches the daemon through
//! the ordinary (resuming) start path when monitoring is enabled but nothing
//! is running.

use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, Signal, System};
use tokio_util::sync::CancellationToken;

use crate::settings::SettingsStore;

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

pub const WATCHDOG_INTERVAL: Duration = Duration::from_secs(15 * 60);

pub const EXIT_WAIT: Duration = Duration::from_secs(2);
const EXIT_POLL: Duration = Duration::from_millis(100);

pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn write(&self, pid: u32) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::write(&self.path, format!("{pid}\n"))
            .with_context(|| format!("failed to write pid file {}", self.path.display()))
    }

    pub fn write_current(&self) -> Result<()> {
        self.write(std::process::id())
    }

    /// Missing or unreadable files read as "no daemon".
    pub fn read(&self) -> Option<u32> {
        fs::read_to_string(&self.path).ok()?.trim().parse().ok()
    }

    pub fn remove(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err)
                .with_context(|| format!("failed to remove pid file {}", self.path.display())),
        }
    }

    /// Pid of the recorded daemon if that process still exists.
    pub fn live_pid(&self) -> Option<u32> {
        self.read().filter(|pid| process_alive(*pid))
    }
}

pub fn process_alive(pid: u32) -> bool {
    let mut system = System::new();
    let pid = Pid::from_u32(pid);
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]));

    system
        .process(pid)
        .map(|process| !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
        .unwrap_or(false)
}

/// Poll until the process is gone or `timeout` passes. Returns whether it
/// is gone.
pub async fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while process_alive(pid) {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(EXIT_POLL).await;
    }
    true
}

/// Ask the process to exit (SIGTERM where supported, otherwise kill) and
/// wait briefly for it to go away. Returns whether it is gone.
pub async fn terminate_process(pid: u32) -> bool {
    let signalled = {
        let mut system = System::new();
        let sys_pid = Pid::from_u32(pid);
        system.refresh_processes(ProcessesToUpdate::Some(&[sys_pid]));

        match system.process(sys_pid) {
            None => return true,
            Some(process) => process
                .kill_with(Signal::Term)
                .unwrap_or_else(|| process.kill()),
        }
    };
    if !signalled {
        log_warn!("failed to signal process {pid}");
        return !process_alive(pid);
    }

    wait_for_exit(pid, EXIT_WAIT).await
}

/// Starts a detached daemon process. Returns its pid.
pub trait DaemonLauncher: Send + Sync {
    fn launch(&self, manual: bool) -> Result<u32>;
}

/// Relaunches this executable as `focuswatch --data-dir <dir> run`, with
/// stdout and stderr appended to a log file in the data directory. The
/// detached daemon has no stdin; it takes commands on its control socket.
pub struct ExeLauncher {
    data_dir: PathBuf,
    log_path: PathBuf,
}

impl ExeLauncher {
    pub fn new(data_dir: PathBuf, log_path: PathBuf) -> Self {
        Self { data_dir, log_path }
    }
}

impl DaemonLauncher for ExeLauncher {
    fn launch(&self, manual: bool) -> Result<u32> {
        let exe = std::env::current_exe().context("failed to locate focuswatch executable")?;
        fs::create_dir_all(&self.data_dir)
            .with_context(|| format!("failed to create {}", self.data_dir.display()))?;
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .with_context(|| format!("failed to open {}", self.log_path.display()))?;

        let mut command = Command::new(exe);
        command.arg("--data-dir").arg(&self.data_dir).arg("run");
        if manual {
            command.arg("--manual");
        }
        let child = command
            .stdin(Stdio::null())
            .stdout(log.try_clone().context("failed to share log file")?)
            .stderr(log)
            .spawn()
            .context("failed to spawn monitoring daemon")?;

        Ok(child.id())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogVerdict {
    MonitoringDisabled,
    Alive(u32),
    Respawned(u32),
}

/// One liveness check. Settings are re-read from disk first since the
/// watchdog runs in a different process than the CLI that edits them.
pub fn check_once(
    settings: &SettingsStore,
    pid_file: &PidFile,
    launcher: &dyn DaemonLauncher,
) -> Result<WatchdogVerdict> {
    if let Err(err) = settings.reload() {
        log_warn!("watchdog using previous settings: {err:#}");
    }
    if !settings.snapshot().monitoring_enabled {
        return Ok(WatchdogVerdict::MonitoringDisabled);
    }

    if let Some(pid) = pid_file.live_pid() {
        return Ok(WatchdogVerdict::Alive(pid));
    }

    let pid = launcher.launch(false)?;
    log_info!("monitoring daemon was not running; relaunched as pid {pid}");
    Ok(WatchdogVerdict::Respawned(pid))
}

pub async fn run_watchdog(
    settings: &SettingsStore,
    pid_file: &PidFile,
    launcher: &dyn DaemonLauncher,
    interval: Duration,
    cancel_token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            _ = ticker.tick() => {
                match check_once(settings, pid_file, launcher) {
                    Ok(verdict) => log_info!("watchdog check: {verdict:?}"),
                    Err(err) => log_warn!("watchdog check failed: {err:#}"),
                }
            }
        }
    }
}
