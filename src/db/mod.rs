use std::{
    path::{Path, PathBuf},
    sync::{mpsc, Arc, Mutex},
    thread::{self, JoinHandle},
};

use anyhow::{anyhow, Context, Result};
use log::{error, info, warn};
use rusqlite::Connection;
use tokio::sync::oneshot;

mod helpers;
mod migrations;
pub mod models;
mod repositories;
mod store;

use migrations::run_migrations;

pub use models::{
    FocusSession, Interruption, NewInterruption, NewTask, SessionStatus, Task, TaskStatus,
};

pub const DB_FILE: &str = "noncrast.db";

/// Applied to every connection before migrations run. Failures are logged,
/// not fatal.
const PRAGMAS: &[(&str, &str)] = &[
    ("journal_mode", "WAL"),
    ("synchronous", "NORMAL"),
    ("foreign_keys", "ON"),
    ("busy_timeout", "5000"),
];

type DbJob = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum Request {
    Run(DbJob),
    Close,
}

struct Worker {
    requests: mpsc::Sender<Request>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Worker {
    fn drop(&mut self) {
        let thread = self
            .thread
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(thread) = thread else {
            return;
        };
        // A closed channel already ends the loop.
        let _ = self.requests.send(Request::Close);
        if thread.join().is_err() {
            error!("Database thread panicked during shutdown");
        }
    }
}

/// SQLite store for tasks, focus sessions and interruptions.
///
/// A single thread owns the connection; async callers hand it closures and
/// await the reply, so nothing blocks the runtime.
#[derive(Clone)]
pub struct Database {
    worker: Arc<Worker>,
}

impl Database {
    pub fn new(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory {}", parent.display())
            })?;
        }

        let (requests, inbox) = mpsc::channel::<Request>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();
        let thread_path = db_path.clone();

        let thread = thread::Builder::new()
            .name("noncrast-db".into())
            .spawn(move || {
                let mut conn = match open_connection(&thread_path) {
                    Ok(conn) => conn,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                if ready_tx.send(Ok(())).is_err() {
                    return;
                }
                serve(&mut conn, inbox);
            })
            .context("failed to spawn database thread")?;

        ready_rx
            .recv()
            .context("database thread exited before it was ready")??;
        info!("Database ready at {}", db_path.display());

        Ok(Self {
            worker: Arc::new(Worker {
                requests,
                thread: Mutex::new(Some(thread)),
            }),
        })
    }

    pub async fn execute<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();

        let job: DbJob = Box::new(move |conn| {
            // The caller may have given up waiting; nothing to report then.
            let _ = reply_tx.send(task(conn));
        });
        self.worker
            .requests
            .send(Request::Run(job))
            .map_err(|_| anyhow!("database thread is gone"))?;

        reply_rx
            .await
            .map_err(|_| anyhow!("database thread dropped the request"))?
    }
}

fn open_connection(path: &Path) -> Result<Connection> {
    let mut conn = Connection::open(path)
        .with_context(|| format!("failed to open SQLite database {}", path.display()))?;
    for (name, value) in PRAGMAS {
        if let Err(err) = conn.pragma_update(None, name, value) {
            warn!("Could not set PRAGMA {name}={value}: {err}");
        }
    }
    run_migrations(&mut conn).context("failed to run database migrations")?;
    Ok(conn)
}

fn serve(conn: &mut Connection, inbox: mpsc::Receiver<Request>) {
    while let Ok(Request::Run(job)) = inbox.recv() {
        job(conn);
    }
    info!("Database thread shutting down");
}
