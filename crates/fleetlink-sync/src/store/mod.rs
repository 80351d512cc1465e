//! Durable local state backed by SQLite.
//!
//! One database file holds the telemetry record queue, the sync cursor,
//! the enrollment state machine, agent statistics and the last applied
//! policy. Every repository shares a single connection behind a mutex;
//! each operation takes the lock for its own statement or transaction
//! only, so collector appends never wait on a whole sync cycle.

mod enrollment;
mod events;
mod migrations;
mod policy;
mod stats;

pub use enrollment::{EnrollmentState, EnrollmentStateStore, EnrollmentStatus};
pub use events::{
    Batch, EventStore, EventStoreConfig, FailedRecord, RecordStatus, RequeueOutcome, StoreCounts,
    SyncCursor, TelemetryRecord,
};
pub use policy::{AppliedPolicy, PolicyStore};
pub use stats::{AgentStats, AgentStatsStore};

use crate::error::SyncResult;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Handle to the agent database
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the database at `path` and apply pending migrations
    pub fn open(path: &Path) -> SyncResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut conn = Connection::open(path)?;
        let journal_mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        if !journal_mode.eq_ignore_ascii_case("wal") {
            warn!("SQLite refused WAL mode, using {}", journal_mode);
        }
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        migrations::run(&mut conn)?;

        info!("Agent database opened at {}", path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory database (for testing)
    pub fn in_memory() -> SyncResult<Self> {
        let mut conn = Connection::open_in_memory()?;
        migrations::run(&mut conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Telemetry record queue
    pub fn events(&self, config: EventStoreConfig) -> EventStore {
        EventStore::new(self.conn.clone(), config)
    }

    /// Persisted enrollment state machine
    pub fn enrollment(&self) -> EnrollmentStateStore {
        EnrollmentStateStore::new(self.conn.clone())
    }

    /// Persisted agent counters
    pub fn agent_stats(&self) -> AgentStatsStore {
        AgentStatsStore::new(self.conn.clone())
    }

    /// Last policy pushed by the server
    pub fn policy(&self) -> PolicyStore {
        PolicyStore::new(self.conn.clone())
    }

    /// Applied schema version
    pub fn schema_version(&self) -> SyncResult<u32> {
        let conn = self.conn.lock();
        migrations::current_version(&conn)
    }
}

pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Build "?,?,?" for an IN clause
pub(crate) fn placeholders(n: usize) -> String {
    vec!["?"; n].join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_reopen_preserves_pending_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("fleetlink.db");

        {
            let db = Database::open(&path).unwrap();
            let events = db.events(EventStoreConfig::default());
            events.append(b"first").unwrap();
            events.append(b"second").unwrap();
            let batch = events.next_batch(1, usize::MAX).unwrap();
            assert_eq!(batch.ids(), vec![1]);
        }

        let db = Database::open(&path).unwrap();
        assert_eq!(db.schema_version().unwrap(), migrations::LATEST_VERSION);

        let events = db.events(EventStoreConfig::default());
        // The stale in-flight record is still there, nothing was lost
        let counts = events.counts().unwrap();
        assert_eq!(counts.pending + counts.in_flight, 2);

        events.recover_in_flight().unwrap();
        let batch = events.next_batch(10, usize::MAX).unwrap();
        assert_eq!(batch.ids(), vec![1, 2]);
        assert_eq!(batch.records[0].payload, b"first");
    }

    #[test]
    fn test_in_memory_is_migrated() {
        let db = Database::in_memory().unwrap();
        assert_eq!(db.schema_version().unwrap(), migrations::LATEST_VERSION);
        assert_eq!(
            db.enrollment().load().unwrap().status,
            EnrollmentStatus::Unenrolled
        );
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(placeholders(1), "?");
        assert_eq!(placeholders(3), "?,?,?");
    }
}
