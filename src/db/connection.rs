use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rusqlite::Connection;
use tokio::sync::oneshot;

use super::migrations::run_migrations;

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info};

/// Lock waits longer than this fail the statement instead of hanging a tick.
const BUSY_TIMEOUT: Duration = Duration::from_secs(2);

type Job = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

/// Owns the worker. Dropping the last handle closes the job queue, which ends
/// the worker loop, and then joins the thread.
struct Worker {
    jobs: Option<mpsc::Sender<Job>>,
    thread: Option<JoinHandle<()>>,
}

impl Drop for Worker {
    fn drop(&mut self) {
        drop(self.jobs.take());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log_error!("database worker panicked");
            }
        }
    }
}

/// Handle to the SQLite store holding the usage event log and the session
/// state row.
///
/// All statements run on one dedicated thread that owns the connection;
/// callers hand it closures and await the reply. Cloning is cheap and every
/// clone talks to the same worker.
#[derive(Clone)]
pub struct Database {
    worker: Arc<Worker>,
}

impl Database {
    pub fn new(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory {}", parent.display())
            })?;
        }

        let (jobs_tx, jobs_rx) = mpsc::channel::<Job>();
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<()>>(1);
        let thread_path = path.clone();

        let thread = thread::Builder::new()
            .name("focuswatch-db".into())
            .spawn(move || {
                let mut conn = match open_connection(&thread_path) {
                    Ok(conn) => {
                        let _ = ready_tx.send(Ok(()));
                        conn
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                serve_jobs(&mut conn, jobs_rx);
            })
            .context("failed to spawn database worker thread")?;

        let opened = ready_rx
            .recv()
            .map_err(|_| anyhow!("database worker exited before opening {}", path.display()))?;
        if let Err(err) = opened {
            let _ = thread.join();
            return Err(err);
        }
        log_info!("database ready at {}", path.display());

        Ok(Self {
            worker: Arc::new(Worker {
                jobs: Some(jobs_tx),
                thread: Some(thread),
            }),
        })
    }

    /// Run `task` on the database thread and wait for its result.
    pub async fn execute<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let jobs = self
            .worker
            .jobs
            .as_ref()
            .ok_or_else(|| anyhow!("database worker already closed"))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        let job: Job = Box::new(move |conn| {
            // A dropped receiver means the caller gave up waiting.
            let _ = reply_tx.send(task(conn));
        });
        jobs.send(job)
            .map_err(|_| anyhow!("database worker is gone"))?;

        reply_rx
            .await
            .map_err(|_| anyhow!("database worker stopped before replying"))?
    }
}

/// Open the store in WAL mode (the CLI and the daemon share the file) and
/// bring the schema up to date.
fn open_connection(path: &Path) -> Result<Connection> {
    let mut conn = Connection::open(path)
        .with_context(|| format!("failed to open SQLite database {}", path.display()))?;
    conn.pragma_update(None, "journal_mode", "WAL")
        .context("failed to enable WAL mode")?;
    conn.busy_timeout(BUSY_TIMEOUT)
        .context("failed to set busy timeout")?;
    run_migrations(&mut conn).context("failed to run database migrations")?;
    Ok(conn)
}

fn serve_jobs(conn: &mut Connection, jobs: mpsc::Receiver<Job>) {
    for job in jobs {
        job(conn);
    }
    log_debug!("database worker finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn creates_parent_directories_and_runs_migrations() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("focuswatch.sqlite3");

        let db = Database::new(path.clone()).unwrap();
        assert!(path.exists());

        let version: i32 = db
            .execute(|conn| Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?))
            .await
            .unwrap();
        assert!(version >= 1);

        let journal: String = db
            .execute(|conn| Ok(conn.pragma_query_value(None, "journal_mode", |row| row.get(0))?))
            .await
            .unwrap();
        assert_eq!(journal.to_ascii_lowercase(), "wal");
    }

    #[tokio::test]
    async fn task_errors_are_returned_to_the_caller() {
        let dir = tempdir().unwrap();
        let db = Database::new(dir.path().join("db.sqlite3")).unwrap();

        let result: Result<()> = db
            .execute(|conn| {
                conn.execute("SELECT * FROM missing_table", [])?;
                Ok(())
            })
            .await;
        assert!(result.is_err());

        // The worker survives a failed task.
        let one: i64 = db
            .execute(|conn| Ok(conn.query_row("SELECT 1", [], |row| row.get(0))?))
            .await
            .unwrap();
        assert_eq!(one, 1);
    }

    #[tokio::test]
    async fn clones_outlive_the_original_handle() {
        let dir = tempdir().unwrap();
        let db = Database::new(dir.path().join("db.sqlite3")).unwrap();
        let clone = db.clone();
        drop(db);

        let one: i64 = clone
            .execute(|conn| Ok(conn.query_row("SELECT 1", [], |row| row.get(0))?))
            .await
            .unwrap();
        assert_eq!(one, 1);
    }

    #[test]
    fn unopenable_path_is_an_error() {
        let dir = tempdir().unwrap();
        // A directory cannot be opened as a database file.
        assert!(Database::new(dir.path().to_path_buf()).is_err());
    }
}
