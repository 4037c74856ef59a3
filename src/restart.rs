//! Restart & Shutdown
//!
//! Operators signal a restart by writing a marker `{time, soft}` into a
//! shared SQLite database; every broker process watching that database
//! picks the transition up on its next periodic check and drains (soft)
//! or stops (hard). OS signals feed the same shutdown channel.

use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::Result;

/// How often a running broker polls the marker store.
pub const RESTART_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// The durable restart rendezvous value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartMarker {
    /// Unix timestamp of the restart request; any transition triggers.
    pub time: u64,
    /// Drain instead of hard-stopping.
    pub soft: bool,
}

impl RestartMarker {
    pub fn now(soft: bool) -> Self {
        let time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        RestartMarker { time, soft }
    }
}

/// SQLite-backed store for the restart marker. The database lives outside
/// the process so several brokers can rendezvous on one marker.
pub struct MarkerStore {
    conn: Mutex<Connection>,
}

impl MarkerStore {
    /// Opens or creates the marker database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                let _ = std::fs::create_dir_all(parent);
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;",
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS restart_marker (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                time INTEGER NOT NULL,
                soft INTEGER NOT NULL
            )",
            [],
        )?;
        Ok(MarkerStore {
            conn: Mutex::new(conn),
        })
    }

    /// Creates an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    /// Writes the marker, replacing any previous one.
    pub fn write(&self, marker: RestartMarker) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO restart_marker (id, time, soft) VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET time = ?1, soft = ?2",
            params![marker.time as i64, marker.soft as i64],
        )?;
        Ok(())
    }

    /// Reads the current marker, if one was ever written.
    pub fn read(&self) -> Result<Option<RestartMarker>> {
        let conn = self.conn.lock().unwrap();
        let marker = conn
            .query_row(
                "SELECT time, soft FROM restart_marker WHERE id = 1",
                [],
                |row| {
                    Ok(RestartMarker {
                        time: row.get::<_, i64>(0)? as u64,
                        soft: row.get::<_, i64>(1)? != 0,
                    })
                },
            )
            .optional()?;
        Ok(marker)
    }
}

/// How the broker should go down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Decline new connections, close existing ones, then stop.
    Soft,
    /// Stop the loops immediately.
    Hard,
}

/// Broadcast handle used to fan a shutdown decision out to every loop.
#[derive(Clone)]
pub struct Shutdown {
    tx: watch::Sender<Option<ShutdownMode>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Shutdown { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<ShutdownMode>> {
        self.tx.subscribe()
    }

    /// Signals shutdown. The first mode wins; later triggers are ignored.
    pub fn trigger(&self, mode: ShutdownMode) {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(mode);
                true
            } else {
                false
            }
        });
    }

    pub fn is_triggered(&self) -> bool {
        self.tx.borrow().is_some()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Waits until shutdown is signalled and returns the mode.
pub async fn wait_for_shutdown(mut rx: watch::Receiver<Option<ShutdownMode>>) -> ShutdownMode {
    loop {
        if let Some(mode) = *rx.borrow() {
            return mode;
        }
        if rx.changed().await.is_err() {
            return ShutdownMode::Hard;
        }
    }
}

/// Spawns the periodic marker check. A change of `time` relative to the
/// value seen at startup triggers shutdown with the marker's mode.
pub fn spawn_restart_watcher(
    store: std::sync::Arc<MarkerStore>,
    shutdown: Shutdown,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let last_seen = store.read().ok().flatten().map(|m| m.time);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let marker = match store.read() {
                Ok(Some(marker)) => marker,
                Ok(None) => continue,
                Err(e) => {
                    debug!(error = %e, "restart marker read failed");
                    continue;
                }
            };
            if last_seen != Some(marker.time) {
                info!(soft = marker.soft, "restart marker changed, shutting down");
                shutdown.trigger(if marker.soft {
                    ShutdownMode::Soft
                } else {
                    ShutdownMode::Hard
                });
                return;
            }
        }
    })
}
