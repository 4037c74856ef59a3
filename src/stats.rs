//! Statistics Sink
//!
//! Append-only per-app counters: connections, disconnections, and
//! WebSocket message volume. A periodic task snapshots the counters of
//! every app that opted in and appends them to a durable store; rows
//! older than the retention window are deleted on flush.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::app::App;
use crate::error::Result;
use crate::restart::{Shutdown, ShutdownMode};

/// One flushed snapshot window for one app.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatisticsRecord {
    pub app_id: String,
    /// Unix timestamp of the snapshot.
    pub recorded_at: u64,
    /// Connections live at snapshot time.
    pub connections: i64,
    /// Connections opened during the window.
    pub new_connections: u64,
    /// Connections closed during the window.
    pub disconnections: u64,
    /// Client frames received during the window.
    pub messages_received: u64,
    /// Frames sent during the window.
    pub messages_sent: u64,
}

#[derive(Default)]
struct AppCounters {
    current: AtomicI64,
    new_connections: AtomicU64,
    disconnections: AtomicU64,
    messages_received: AtomicU64,
    messages_sent: AtomicU64,
}

/// In-process counters, marked from the connection lifecycle.
pub struct StatisticsCollector {
    counters: RwLock<HashMap<String, AppCounters>>,
    enabled: bool,
}

impl StatisticsCollector {
    pub fn new(enabled: bool) -> Self {
        StatisticsCollector {
            counters: RwLock::new(HashMap::new()),
            enabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn tracked(&self, app: &App) -> bool {
        self.enabled && app.statistics_enabled
    }

    fn with_counters<F: FnOnce(&AppCounters)>(&self, app: &App, f: F) {
        {
            let counters = self.counters.read().unwrap();
            if let Some(entry) = counters.get(&app.id) {
                f(entry);
                return;
            }
        }
        let mut counters = self.counters.write().unwrap();
        f(counters.entry(app.id.clone()).or_default());
    }

    pub fn mark_new_connection(&self, app: &App) {
        if !self.tracked(app) {
            return;
        }
        self.with_counters(app, |c| {
            c.current.fetch_add(1, Ordering::Relaxed);
            c.new_connections.fetch_add(1, Ordering::Relaxed);
        });
    }

    pub fn mark_disconnection(&self, app: &App) {
        if !self.tracked(app) {
            return;
        }
        self.with_counters(app, |c| {
            c.current.fetch_sub(1, Ordering::Relaxed);
            c.disconnections.fetch_add(1, Ordering::Relaxed);
        });
    }

    pub fn mark_message_received(&self, app: &App) {
        if !self.tracked(app) {
            return;
        }
        self.with_counters(app, |c| {
            c.messages_received.fetch_add(1, Ordering::Relaxed);
        });
    }

    pub fn mark_message_sent(&self, app: &App) {
        self.mark_messages_sent(app, 1);
    }

    pub fn mark_messages_sent(&self, app: &App, count: u64) {
        if count == 0 || !self.tracked(app) {
            return;
        }
        self.with_counters(app, |c| {
            c.messages_sent.fetch_add(count, Ordering::Relaxed);
        });
    }

    /// Snapshots every app's window counters and resets the deltas. The
    /// live-connection gauge carries over between windows.
    pub fn snapshot(&self) -> Vec<StatisticsRecord> {
        let recorded_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let counters = self.counters.read().unwrap();
        counters
            .iter()
            .map(|(app_id, c)| StatisticsRecord {
                app_id: app_id.clone(),
                recorded_at,
                connections: c.current.load(Ordering::Relaxed),
                new_connections: c.new_connections.swap(0, Ordering::Relaxed),
                disconnections: c.disconnections.swap(0, Ordering::Relaxed),
                messages_received: c.messages_received.swap(0, Ordering::Relaxed),
                messages_sent: c.messages_sent.swap(0, Ordering::Relaxed),
            })
            .collect()
    }
}

/// Durable sink for flushed statistics windows.
pub trait StatisticsStore: Send + Sync {
    fn append(&self, records: &[StatisticsRecord]) -> Result<()>;

    /// Deletes rows older than the retention window. Returns rows removed.
    fn cleanup_older_than(&self, retention: Duration) -> Result<usize>;

    /// Stored rows for one app, newest first.
    fn records_for(&self, app_id: &str) -> Result<Vec<StatisticsRecord>>;
}

/// SQLite-backed statistics store.
pub struct SqliteStatisticsStore {
    conn: Mutex<Connection>,
}

impl SqliteStatisticsStore {
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
            "CREATE TABLE IF NOT EXISTS statistics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                app_id TEXT NOT NULL,
                recorded_at INTEGER NOT NULL,
                connections INTEGER NOT NULL,
                new_connections INTEGER NOT NULL,
                disconnections INTEGER NOT NULL,
                messages_received INTEGER NOT NULL,
                messages_sent INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_statistics_app ON statistics(app_id, recorded_at)",
            [],
        )?;
        Ok(SqliteStatisticsStore {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }
}

impl StatisticsStore for SqliteStatisticsStore {
    fn append(&self, records: &[StatisticsRecord]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        for record in records {
            tx.execute(
                "INSERT INTO statistics (app_id, recorded_at, connections, new_connections,
                     disconnections, messages_received, messages_sent)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.app_id,
                    record.recorded_at as i64,
                    record.connections,
                    record.new_connections as i64,
                    record.disconnections as i64,
                    record.messages_received as i64,
                    record.messages_sent as i64,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn cleanup_older_than(&self, retention: Duration) -> Result<usize> {
        let cutoff = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
            .saturating_sub(retention.as_secs());
        let conn = self.conn.lock().unwrap();
        let removed = conn.execute(
            "DELETE FROM statistics WHERE recorded_at < ?1",
            params![cutoff as i64],
        )?;
        Ok(removed)
    }

    fn records_for(&self, app_id: &str) -> Result<Vec<StatisticsRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT app_id, recorded_at, connections, new_connections, disconnections,
                    messages_received, messages_sent
             FROM statistics WHERE app_id = ?1 ORDER BY recorded_at DESC",
        )?;
        let rows = stmt.query_map(params![app_id], |row| {
            Ok(StatisticsRecord {
                app_id: row.get(0)?,
                recorded_at: row.get::<_, i64>(1)? as u64,
                connections: row.get(2)?,
                new_connections: row.get::<_, i64>(3)? as u64,
                disconnections: row.get::<_, i64>(4)? as u64,
                messages_received: row.get::<_, i64>(5)? as u64,
                messages_sent: row.get::<_, i64>(6)? as u64,
            })
        })?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }
}

/// In-memory statistics store (for testing).
#[derive(Default)]
pub struct MemoryStatisticsStore {
    records: Mutex<Vec<StatisticsRecord>>,
}

impl MemoryStatisticsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StatisticsStore for MemoryStatisticsStore {
    fn append(&self, records: &[StatisticsRecord]) -> Result<()> {
        self.records.lock().unwrap().extend_from_slice(records);
        Ok(())
    }

    fn cleanup_older_than(&self, retention: Duration) -> Result<usize> {
        let cutoff = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
            .saturating_sub(retention.as_secs());
        let mut records = self.records.lock().unwrap();
        let before = records.len();
        records.retain(|r| r.recorded_at >= cutoff);
        Ok(before - records.len())
    }

    fn records_for(&self, app_id: &str) -> Result<Vec<StatisticsRecord>> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.app_id == app_id)
            .cloned()
            .collect())
    }
}

/// Spawns the periodic flush loop. Stops when shutdown is signalled.
pub fn spawn_statistics_flusher(
    collector: Arc<StatisticsCollector>,
    store: Arc<dyn StatisticsStore>,
    interval: Duration,
    retention: Duration,
    shutdown: Shutdown,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut rx = shutdown.subscribe();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = rx.changed() => {
                    if changed.is_err() || matches!(*rx.borrow(), Some(ShutdownMode::Hard) | Some(ShutdownMode::Soft)) {
                        break;
                    }
                    continue;
                }
            }

            let records = collector.snapshot();
            if records.is_empty() {
                continue;
            }
            if let Err(e) = store.append(&records) {
                warn!(error = %e, "statistics flush failed");
                continue;
            }
            match store.cleanup_older_than(retention) {
                Ok(removed) if removed > 0 => {
                    debug!(removed, "expired statistics rows removed");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "statistics cleanup failed"),
            }
        }
    })
}
