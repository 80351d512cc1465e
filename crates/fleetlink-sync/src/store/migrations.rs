//! Embedded schema migrations.
//!
//! Migrations are applied in order and tracked with `PRAGMA user_version`.
//! Never edit an applied migration; append a new one instead. Each
//! migration runs in its own transaction together with the version bump.

use crate::error::SyncResult;
use rusqlite::Connection;
use tracing::info;

const MIGRATIONS: &[&str] = &[
    // 1: record queue, cursor, enrollment state, agent stats
    "CREATE TABLE IF NOT EXISTS telemetry_records (
        local_id INTEGER PRIMARY KEY AUTOINCREMENT,
        payload BLOB NOT NULL,
        created_at INTEGER NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL DEFAULT 'pending',
        batch_id TEXT,
        last_attempt_at INTEGER,
        acked_at INTEGER,
        failed_at INTEGER,
        last_error TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_telemetry_records_status
        ON telemetry_records(status, local_id);

    CREATE TABLE IF NOT EXISTS sync_cursor (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        last_compacted_id INTEGER NOT NULL DEFAULT 0,
        in_flight_batch_id TEXT
    );
    INSERT OR IGNORE INTO sync_cursor (id) VALUES (1);

    CREATE TABLE IF NOT EXISTS enrollment_state (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        status TEXT NOT NULL DEFAULT 'unenrolled',
        device_id TEXT,
        policy_id TEXT,
        enrolled_at INTEGER,
        last_error TEXT,
        retryable INTEGER NOT NULL DEFAULT 1,
        rejected_token_hash TEXT,
        updated_at INTEGER NOT NULL DEFAULT 0
    );
    INSERT OR IGNORE INTO enrollment_state (id) VALUES (1);",
    // 2: agent counters
    "CREATE TABLE IF NOT EXISTS agent_stats (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        total_checkins INTEGER NOT NULL DEFAULT 0,
        total_failures INTEGER NOT NULL DEFAULT 0,
        records_acked INTEGER NOT NULL DEFAULT 0,
        records_dropped INTEGER NOT NULL DEFAULT 0,
        last_sent_at INTEGER,
        last_sent_count INTEGER NOT NULL DEFAULT 0,
        last_sync_at INTEGER,
        last_sync_outcome TEXT,
        agent_health TEXT NOT NULL DEFAULT 'healthy'
    );
    INSERT OR IGNORE INTO agent_stats (id) VALUES (1);",
    // 3: last policy applied from the server
    "CREATE TABLE IF NOT EXISTS applied_policy (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        action_id TEXT,
        policy_id TEXT,
        settings TEXT NOT NULL,
        applied_at INTEGER NOT NULL
    );",
];

/// Schema version after all migrations are applied
pub const LATEST_VERSION: u32 = MIGRATIONS.len() as u32;

/// Read the applied schema version
pub fn current_version(conn: &Connection) -> SyncResult<u32> {
    let version: u32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    Ok(version)
}

/// Apply every migration newer than the stored version
pub fn run(conn: &mut Connection) -> SyncResult<()> {
    let current = current_version(conn)?;

    for (idx, sql) in MIGRATIONS.iter().enumerate().skip(current as usize) {
        let version = idx as u32 + 1;
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.pragma_update(None, "user_version", version)?;
        tx.commit()?;
        info!("Applied schema migration {}", version);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_is_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        run(&mut conn).unwrap();
        assert_eq!(current_version(&conn).unwrap(), LATEST_VERSION);

        conn.execute(
            "INSERT INTO telemetry_records (payload, created_at) VALUES (x'01', 0)",
            [],
        )
        .unwrap();

        run(&mut conn).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM telemetry_records", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_upgrade_from_older_version_keeps_records() {
        let mut conn = Connection::open_in_memory().unwrap();
        {
            let tx = conn.transaction().unwrap();
            tx.execute_batch(MIGRATIONS[0]).unwrap();
            tx.pragma_update(None, "user_version", 1u32).unwrap();
            tx.commit().unwrap();
        }
        conn.execute(
            "INSERT INTO telemetry_records (payload, created_at) VALUES (x'02', 0)",
            [],
        )
        .unwrap();

        run(&mut conn).unwrap();
        assert_eq!(current_version(&conn).unwrap(), LATEST_VERSION);

        let status: String = conn
            .query_row(
                "SELECT status FROM telemetry_records WHERE local_id = 1",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(status, "pending");
    }
}
