//! Out-of-band commands for a running daemon.
//!
//! The same line protocol arrives two ways: on stdin when the daemon runs in
//! a terminal, and (on unix) over a socket in the data directory, which is
//! how `focuswatch dismiss|screen-off|screen-on|stop` reach a detached
//! daemon. Socket clients get one reply line per command: `ok` or
//! `error: <reason>`.

use anyhow::{bail, Result};
use std::str::FromStr;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::sync::CancellationToken;

use crate::monitor::MonitorController;

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

#[cfg(unix)]
pub use socket::{send_control_command, ControlSocket};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostCommand {
    ScreenOff,
    ScreenOn,
    Dismiss,
    Stop,
}

impl HostCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostCommand::ScreenOff => "screen-off",
            HostCommand::ScreenOn => "screen-on",
            HostCommand::Dismiss => "dismiss",
            HostCommand::Stop => "stop",
        }
    }
}

impl FromStr for HostCommand {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> Result<Self> {
        match line.trim().to_ascii_lowercase().as_str() {
            "screen-off" | "screen_off" | "lock" => Ok(HostCommand::ScreenOff),
            "screen-on" | "screen_on" | "unlock" => Ok(HostCommand::ScreenOn),
            "dismiss" => Ok(HostCommand::Dismiss),
            "stop" => Ok(HostCommand::Stop),
            other => bail!("unknown host command: {other:?}"),
        }
    }
}

/// Apply one command. Returns `true` when the daemon should exit.
pub async fn apply(command: HostCommand, controller: &MonitorController) -> Result<bool> {
    match command {
        HostCommand::ScreenOff => controller.screen_off().await?,
        HostCommand::ScreenOn => controller.screen_on().await?,
        HostCommand::Dismiss => controller.dismiss().await?,
        HostCommand::Stop => {
            controller.stop().await?;
            return Ok(true);
        }
    }
    Ok(false)
}

/// Parse and apply one line; `stop` cancels `cancel_token`.
async fn handle_line(
    line: &str,
    controller: &MonitorController,
    cancel_token: &CancellationToken,
) -> Result<HostCommand> {
    let command = line.parse::<HostCommand>()?;
    log_info!("host command: {command:?}");
    if apply(command, controller).await? {
        cancel_token.cancel();
    }
    Ok(command)
}

/// Read commands until EOF or cancellation. A closed input leaves the daemon
/// running.
pub async fn read_host_commands<R>(
    reader: R,
    controller: MonitorController,
    cancel_token: CancellationToken,
) where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    loop {
        let line = tokio::select! {
            _ = cancel_token.cancelled() => break,
            line = lines.next_line() => line,
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                log_info!("host command input closed");
                break;
            }
            Err(err) => {
                log_warn!("failed to read host command: {err}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match handle_line(&line, &controller, &cancel_token).await {
            Ok(HostCommand::Stop) => break,
            Ok(_) => {}
            Err(err) => log_warn!("host command {:?} failed: {err:#}", line.trim()),
        }
    }
}

#[cfg(unix)]
mod socket {
    use anyhow::{anyhow, bail, Context, Result};
    use std::path::{Path, PathBuf};
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{UnixListener, UnixStream};
    use tokio_util::sync::CancellationToken;

    use super::{handle_line, HostCommand};
    use crate::monitor::MonitorController;

    const ENABLE_LOGS: bool = true;

    use crate::{log_info, log_warn};

    /// Upper bound on one client exchange.
    const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);

    pub struct ControlSocket {
        listener: UnixListener,
        path: PathBuf,
    }

    impl ControlSocket {
        /// Bind at `path`, replacing a socket file left by a dead daemon.
        /// Callers check that no live daemon owns it first.
        pub fn bind(path: PathBuf) -> Result<Self> {
            if path.exists() {
                std::fs::remove_file(&path).with_context(|| {
                    format!("failed to remove stale control socket {}", path.display())
                })?;
            }
            let listener = UnixListener::bind(&path)
                .with_context(|| format!("failed to bind control socket {}", path.display()))?;
            log_info!("control socket listening at {}", path.display());
            Ok(Self { listener, path })
        }

        /// Accept clients one at a time until cancelled, then remove the
        /// socket file.
        pub async fn serve(self, controller: MonitorController, cancel_token: CancellationToken) {
            loop {
                let accepted = tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    accepted = self.listener.accept() => accepted,
                };

                match accepted {
                    Ok((stream, _)) => {
                        let exchange = serve_client(stream, &controller, &cancel_token);
                        match tokio::time::timeout(EXCHANGE_TIMEOUT, exchange).await {
                            Ok(Ok(())) => {}
                            Ok(Err(err)) => log_warn!("control client failed: {err:#}"),
                            Err(_) => log_warn!("control client timed out"),
                        }
                    }
                    Err(err) => log_warn!("control socket accept failed: {err}"),
                }
            }

            if let Err(err) = std::fs::remove_file(&self.path) {
                log_warn!("failed to remove control socket {}: {err}", self.path.display());
            }
        }
    }

    async fn serve_client(
        stream: UnixStream,
        controller: &MonitorController,
        cancel_token: &CancellationToken,
    ) -> Result<()> {
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let (reply, stop) = match handle_line(&line, controller, cancel_token).await {
                Ok(command) => ("ok".to_string(), command == HostCommand::Stop),
                Err(err) => (format!("error: {err:#}"), false),
            };
            write_half.write_all(format!("{reply}\n").as_bytes()).await?;
            if stop {
                break;
            }
        }
        Ok(())
    }

    /// Send one command to the daemon listening at `path` and wait for its
    /// reply.
    pub async fn send_control_command(path: &Path, command: HostCommand) -> Result<()> {
        let exchange = async {
            let stream = UnixStream::connect(path).await.with_context(|| {
                format!("no monitoring daemon listening at {}", path.display())
            })?;
            let (read_half, mut write_half) = stream.into_split();
            write_half
                .write_all(format!("{}\n", command.as_str()).as_bytes())
                .await?;
            write_half.shutdown().await?;

            let reply = BufReader::new(read_half)
                .lines()
                .next_line()
                .await?
                .ok_or_else(|| anyhow!("daemon closed the connection without replying"))?;
            if reply.trim() != "ok" {
                bail!("daemon rejected {}: {}", command.as_str(), reply.trim());
            }
            Ok::<(), anyhow::Error>(())
        };

        tokio::time::timeout(EXCHANGE_TIMEOUT, exchange)
            .await
            .map_err(|_| anyhow!("daemon did not answer {} in time", command.as_str()))?
    }
}
