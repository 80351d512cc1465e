//! Persisted agent counters, reported with each check-in

use super::{from_millis, to_millis};
use crate::error::SyncResult;
use crate::types::AgentHealth;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::Serialize;
use std::sync::Arc;

/// Snapshot of the agent counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentStats {
    pub total_checkins: u64,
    pub total_failures: u64,
    pub records_acked: u64,
    pub records_dropped: u64,
    pub last_sent_at: Option<DateTime<Utc>>,
    pub last_sent_count: u64,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_sync_outcome: Option<String>,
    pub agent_health: AgentHealth,
}

#[derive(Clone)]
pub struct AgentStatsStore {
    conn: Arc<Mutex<Connection>>,
}

impl AgentStatsStore {
    pub(crate) fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    pub fn load(&self) -> SyncResult<AgentStats> {
        let conn = self.conn.lock();
        let stats = conn.query_row(
            "SELECT total_checkins, total_failures, records_acked, records_dropped,
                    last_sent_at, last_sent_count, last_sync_at, last_sync_outcome,
                    agent_health
             FROM agent_stats WHERE id = 1",
            [],
            |row| {
                Ok(AgentStats {
                    total_checkins: row.get::<_, i64>(0)? as u64,
                    total_failures: row.get::<_, i64>(1)? as u64,
                    records_acked: row.get::<_, i64>(2)? as u64,
                    records_dropped: row.get::<_, i64>(3)? as u64,
                    last_sent_at: row.get::<_, Option<i64>>(4)?.map(from_millis),
                    last_sent_count: row.get::<_, i64>(5)? as u64,
                    last_sync_at: row.get::<_, Option<i64>>(6)?.map(from_millis),
                    last_sync_outcome: row.get(7)?,
                    agent_health: AgentHealth::parse(&row.get::<_, String>(8)?),
                })
            },
        )?;
        Ok(stats)
    }

    /// Count records acknowledged (and dropped) by one delivery
    pub fn record_delivery(&self, acked: usize, dropped: usize) -> SyncResult<()> {
        let conn = self.conn.lock();
        if acked > 0 {
            conn.execute(
                "UPDATE agent_stats
                 SET records_acked = records_acked + ?1, last_sent_at = ?2, last_sent_count = ?1
                 WHERE id = 1",
                params![acked as i64, to_millis(Utc::now())],
            )?;
        }
        if dropped > 0 {
            conn.execute(
                "UPDATE agent_stats SET records_dropped = records_dropped + ?1 WHERE id = 1",
                params![dropped as i64],
            )?;
        }
        Ok(())
    }

    /// Count a check-in attempt
    pub fn record_checkin(&self, success: bool) -> SyncResult<()> {
        let conn = self.conn.lock();
        if success {
            conn.execute(
                "UPDATE agent_stats SET total_checkins = total_checkins + 1 WHERE id = 1",
                [],
            )?;
        } else {
            conn.execute(
                "UPDATE agent_stats SET total_failures = total_failures + 1 WHERE id = 1",
                [],
            )?;
        }
        Ok(())
    }

    /// Count a failed delivery attempt
    pub fn record_failure(&self) -> SyncResult<()> {
        self.record_checkin(false)
    }

    pub fn set_health(&self, health: AgentHealth) -> SyncResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE agent_stats SET agent_health = ?1 WHERE id = 1",
            params![health.as_str()],
        )?;
        Ok(())
    }

    /// Remember how the last sync cycle ended
    pub fn record_sync_outcome(&self, outcome: &str) -> SyncResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE agent_stats SET last_sync_at = ?1, last_sync_outcome = ?2 WHERE id = 1",
            params![to_millis(Utc::now()), outcome],
        )?;
        Ok(())
    }
}
