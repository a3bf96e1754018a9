use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use focuswatch_lib::commands::{self, ConfigAction};
use focuswatch_lib::control::HostCommand;
use focuswatch_lib::db::UsageEventKind;
use focuswatch_lib::settings::SettingsStore;
use focuswatch_lib::watchdog::{self, ExeLauncher, PidFile, WATCHDOG_INTERVAL};
use focuswatch_lib::{init_logging, run_daemon, DataPaths};

/// Grace period for the blocking stdin reader when the runtime shuts down.
const RUNTIME_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(
    name = "focuswatch",
    version,
    about = "Alerts when a tracked app has been in the foreground too long"
)]
struct Cli {
    /// Directory holding settings, database and pid file
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Host the usage monitor in the foreground
    Run {
        /// Discard any persisted session instead of resuming it
        #[arg(long)]
        manual: bool,
    },
    /// Enable monitoring and launch the daemon
    Start,
    /// Disable monitoring, stop the daemon and clear the session
    Stop,
    /// Reset the running counter after an alert
    Dismiss,
    /// Tell the daemon the screen went off (suspends counting)
    ScreenOff,
    /// Tell the daemon the screen came back on
    ScreenOn,
    /// Record a foreground change in the usage event log
    Event {
        #[arg(value_enum)]
        kind: EventKind,
        /// App identifier
        app: String,
    },
    /// Settings management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Show daemon liveness and the persisted session
    Status,
    /// Relaunch the daemon whenever it is found dead
    Watchdog {
        /// Check once and exit
        #[arg(long)]
        once: bool,
        #[arg(long, default_value_t = WATCHDOG_INTERVAL.as_secs())]
        interval_secs: u64,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum EventKind {
    Resumed,
    Paused,
}

impl From<EventKind> for UsageEventKind {
    fn from(kind: EventKind) -> Self {
        match kind {
            EventKind::Resumed => UsageEventKind::Resumed,
            EventKind::Paused => UsageEventKind::Paused,
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging();

    if let Err(e) = run(cli) {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let paths = match cli.data_dir {
        Some(dir) => DataPaths::new(dir),
        None => DataPaths::default_location()?,
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(dispatch(cli.command, &paths));
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_GRACE);
    result
}

async fn dispatch(command: Commands, paths: &DataPaths) -> Result<()> {
    match command {
        Commands::Run { manual } => run_daemon(paths, manual).await?,
        Commands::Start => {
            let launcher = ExeLauncher::new(paths.dir().to_path_buf(), paths.daemon_log());
            let pid = commands::start_monitoring(paths, &launcher)?;
            println!("monitoring started (pid {pid})");
        }
        Commands::Stop => match commands::stop_monitoring(paths).await? {
            Some(pid) => println!("monitoring stopped (pid {pid})"),
            None => println!("monitoring stopped"),
        },
        Commands::Dismiss => {
            if !commands::send_command(paths, HostCommand::Dismiss).await? {
                println!("no daemon running; stored counter reset");
            }
        }
        Commands::ScreenOff => {
            commands::send_command(paths, HostCommand::ScreenOff).await?;
        }
        Commands::ScreenOn => {
            commands::send_command(paths, HostCommand::ScreenOn).await?;
        }
        Commands::Event { kind, app } => {
            let event = commands::record_event(paths, kind.into(), &app, Utc::now()).await?;
            println!("{} {} at {}", event.kind, event.package, event.occurred_at_ms);
        }
        Commands::Config { action } => {
            let store = SettingsStore::new(paths.settings())?;
            let settings = commands::apply_config(&store, action)?;
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
        Commands::Status => {
            let report = commands::status(paths).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Watchdog {
            once,
            interval_secs,
        } => {
            let settings = SettingsStore::new(paths.settings())?;
            let pid_file = PidFile::new(paths.pid_file());
            let launcher = ExeLauncher::new(paths.dir().to_path_buf(), paths.daemon_log());

            if once {
                let verdict = watchdog::check_once(&settings, &pid_file, &launcher)?;
                println!("{verdict:?}");
                return Ok(());
            }

            let cancel_token = CancellationToken::new();
            let ctrl_c_token = cancel_token.clone();
            tokio::spawn(async move {
                let _ = tokio::signal::ctrl_c().await;
                ctrl_c_token.cancel();
            });
            watchdog::run_watchdog(
                &settings,
                &pid_file,
                &launcher,
                Duration::from_secs(interval_secs.max(1)),
                cancel_token,
            )
            .await;
        }
    }
    Ok(())
}
