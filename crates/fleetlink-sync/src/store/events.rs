//! Telemetry record queue
//!
//! Records are appended by collectors and drained by the sync engine in
//! `local_id` order. A record moves Pending -> InFlight -> Acked, back to
//! Pending on retry, or to Failed once it is rejected or has used up its
//! attempts. At most one batch is in flight at a time; the cursor row keeps
//! its id so a crash mid-batch can be recovered.

use super::{from_millis, placeholders, to_millis};
use crate::error::{SyncError, SyncResult};
use chrono::{DateTime, Utc};
use fleetlink_core::FleetlinkConfig;
use parking_lot::Mutex;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

/// Upper bound on ids bound into one IN clause
const MAX_IN_PARAMS: usize = 500;

/// Delivery state of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Pending,
    InFlight,
    Acked,
    Failed,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Pending => "pending",
            RecordStatus::InFlight => "in_flight",
            RecordStatus::Acked => "acked",
            RecordStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RecordStatus::Pending),
            "in_flight" => Some(RecordStatus::InFlight),
            "acked" => Some(RecordStatus::Acked),
            "failed" => Some(RecordStatus::Failed),
            _ => None,
        }
    }
}

impl FromSql for RecordStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        RecordStatus::parse(s)
            .ok_or_else(|| FromSqlError::Other(format!("unknown record status: {}", s).into()))
    }
}

/// One observed event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryRecord {
    /// Monotonic, never reused
    pub local_id: i64,
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
    /// Failed delivery attempts so far
    pub attempts: u32,
    pub status: RecordStatus,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl TelemetryRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            local_id: row.get(0)?,
            payload: row.get(1)?,
            created_at: from_millis(row.get(2)?),
            attempts: row.get(3)?,
            status: row.get(4)?,
            last_attempt_at: row.get::<_, Option<i64>>(5)?.map(from_millis),
        })
    }
}

const RECORD_COLUMNS: &str =
    "local_id, payload, created_at, attempts, status, last_attempt_at";

/// Records handed out together under one batch id
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub id: String,
    pub records: Vec<TelemetryRecord>,
}

impl Batch {
    pub fn ids(&self) -> Vec<i64> {
        self.records.iter().map(|r| r.local_id).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Sum of payload sizes
    pub fn total_bytes(&self) -> usize {
        self.records.iter().map(|r| r.payload.len()).sum()
    }
}

/// Result of a requeue
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequeueOutcome {
    /// Records returned to Pending
    pub requeued: usize,
    /// Records that exceeded the attempts ceiling and became Failed
    pub failed: Vec<i64>,
}

/// A terminally failed record, for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct FailedRecord {
    pub local_id: i64,
    pub attempts: u32,
    pub failed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Persisted sync cursor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncCursor {
    pub last_compacted_id: i64,
    pub in_flight_batch_id: Option<String>,
}

/// Record counts per status
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreCounts {
    pub pending: u64,
    pub in_flight: u64,
    pub acked: u64,
    pub failed: u64,
    pub pending_bytes: u64,
    pub oldest_pending_at: Option<DateTime<Utc>>,
    pub last_local_id: i64,
}

impl StoreCounts {
    /// Records not yet delivered
    pub fn unsent(&self) -> u64 {
        self.pending + self.in_flight
    }
}

/// Queue policy
#[derive(Debug, Clone)]
pub struct EventStoreConfig {
    /// Requeues allowed before a record is dropped as failed
    pub max_attempts: u32,
    /// Unsent records allowed before appends fail (0 = unbounded)
    pub max_pending_records: usize,
    /// Age at which acked records are compacted
    pub ack_retention: Duration,
    /// Age at which failed records are compacted
    pub failed_retention: Duration,
}

impl Default for EventStoreConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            max_pending_records: 1_000_000,
            ack_retention: Duration::ZERO,
            failed_retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

impl EventStoreConfig {
    pub fn from_config(config: &FleetlinkConfig) -> Self {
        Self {
            max_attempts: config.sync.max_attempts,
            max_pending_records: config.storage.max_pending_records,
            ack_retention: config.storage.ack_retention(),
            failed_retention: config.storage.failed_retention(),
        }
    }
}

/// Durable, ordered queue of telemetry records
#[derive(Clone)]
pub struct EventStore {
    conn: Arc<Mutex<Connection>>,
    config: EventStoreConfig,
}

impl EventStore {
    pub(crate) fn new(conn: Arc<Mutex<Connection>>, config: EventStoreConfig) -> Self {
        Self { conn, config }
    }

    pub fn config(&self) -> &EventStoreConfig {
        &self.config
    }

    /// Append one payload; returns its new `local_id`
    pub fn append(&self, payload: &[u8]) -> SyncResult<i64> {
        let conn = self.conn.lock();
        self.check_capacity(&conn, 1)?;

        conn.execute(
            "INSERT INTO telemetry_records (payload, created_at, status)
             VALUES (?1, ?2, 'pending')",
            params![payload, to_millis(Utc::now())],
        )?;
        let local_id = conn.last_insert_rowid();

        debug!("Appended record {} ({} bytes)", local_id, payload.len());
        Ok(local_id)
    }

    /// Append several payloads atomically, preserving their order
    pub fn append_many<P: AsRef<[u8]>>(&self, payloads: &[P]) -> SyncResult<Vec<i64>> {
        if payloads.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        self.check_capacity(&tx, payloads.len())?;

        let now = to_millis(Utc::now());
        let mut ids = Vec::with_capacity(payloads.len());
        {
            let mut stmt = tx.prepare(
                "INSERT INTO telemetry_records (payload, created_at, status)
                 VALUES (?1, ?2, 'pending')",
            )?;
            for payload in payloads {
                stmt.execute(params![payload.as_ref(), now])?;
                ids.push(tx.last_insert_rowid());
            }
        }
        tx.commit()?;

        debug!("Appended {} records", ids.len());
        Ok(ids)
    }

    fn check_capacity(&self, conn: &Connection, incoming: usize) -> SyncResult<()> {
        let limit = self.config.max_pending_records;
        if limit == 0 {
            return Ok(());
        }

        let unsent: i64 = conn.query_row(
            "SELECT COUNT(*) FROM telemetry_records WHERE status IN ('pending', 'in_flight')",
            [],
            |row| row.get(0),
        )?;

        if unsent as usize + incoming > limit {
            warn!(
                "Record queue full ({} unsent, limit {}), refusing append",
                unsent, limit
            );
            return Err(SyncError::StorageFull(format!(
                "{} unsent records buffered (limit {})",
                unsent, limit
            )));
        }
        Ok(())
    }

    /// Take the oldest Pending records as a new in-flight batch.
    ///
    /// Stops at `max_count` records or before exceeding `max_bytes`; the
    /// first record is always taken so an oversized record cannot wedge the
    /// queue. Fails with `BatchOutstanding` while another batch is in flight.
    pub fn next_batch(&self, max_count: usize, max_bytes: usize) -> SyncResult<Batch> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let cursor_batch: Option<String> = tx.query_row(
            "SELECT in_flight_batch_id FROM sync_cursor WHERE id = 1",
            [],
            |row| row.get(0),
        )?;
        let in_flight: i64 = tx.query_row(
            "SELECT COUNT(*) FROM telemetry_records WHERE status = 'in_flight'",
            [],
            |row| row.get(0),
        )?;

        if in_flight > 0 {
            return Err(SyncError::BatchOutstanding(
                cursor_batch.unwrap_or_else(|| "unknown".to_string()),
            ));
        }
        if cursor_batch.is_some() {
            tx.execute(
                "UPDATE sync_cursor SET in_flight_batch_id = NULL WHERE id = 1",
                [],
            )?;
        }

        let candidates = if max_count == 0 {
            Vec::new()
        } else {
            let mut stmt = tx.prepare(&format!(
                "SELECT {} FROM telemetry_records
                 WHERE status = 'pending'
                 ORDER BY local_id ASC LIMIT ?1",
                RECORD_COLUMNS
            ))?;
            let rows = stmt.query_map(params![max_count as i64], TelemetryRecord::from_row)?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        let mut records = Vec::with_capacity(candidates.len());
        let mut total_bytes = 0usize;
        for record in candidates {
            let size = record.payload.len();
            if !records.is_empty() && total_bytes.saturating_add(size) > max_bytes {
                break;
            }
            total_bytes += size;
            records.push(record);
        }

        if records.is_empty() {
            tx.commit()?;
            return Ok(Batch::default());
        }

        let batch_id = Ulid::new().to_string();
        let now = Utc::now();
        {
            let mut stmt = tx.prepare(
                "UPDATE telemetry_records
                 SET status = 'in_flight', batch_id = ?1, last_attempt_at = ?2
                 WHERE local_id = ?3",
            )?;
            for record in records.iter_mut() {
                stmt.execute(params![batch_id, to_millis(now), record.local_id])?;
                record.status = RecordStatus::InFlight;
                record.last_attempt_at = Some(now);
            }
        }
        tx.execute(
            "UPDATE sync_cursor SET in_flight_batch_id = ?1 WHERE id = 1",
            params![batch_id],
        )?;
        tx.commit()?;

        debug!(
            "Batch {} holds {} records ({} bytes)",
            batch_id,
            records.len(),
            total_bytes
        );
        Ok(Batch {
            id: batch_id,
            records,
        })
    }

    /// Mark in-flight records Acked; returns how many changed
    pub fn ack(&self, ids: &[i64]) -> SyncResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let now = to_millis(Utc::now());

        let mut changed = 0;
        for chunk in ids.chunks(MAX_IN_PARAMS) {
            let sql = format!(
                "UPDATE telemetry_records
                 SET status = 'acked', acked_at = ?, batch_id = NULL, last_error = NULL
                 WHERE status = 'in_flight' AND local_id IN ({})",
                placeholders(chunk.len())
            );
            changed += tx.execute(
                &sql,
                params_from_iter(std::iter::once(now).chain(chunk.iter().copied())),
            )?;
        }

        settle_cursor(&tx)?;
        tx.commit()?;

        debug!("Acked {} records", changed);
        Ok(changed)
    }

    /// Return in-flight records to Pending, consuming one attempt each.
    ///
    /// Records whose attempts now exceed the ceiling become Failed instead;
    /// that is an explicit data-loss event and is logged as such.
    pub fn requeue(&self, ids: &[i64], reason: &str) -> SyncResult<RequeueOutcome> {
        if ids.is_empty() {
            return Ok(RequeueOutcome::default());
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let now = to_millis(Utc::now());
        let max_attempts = self.config.max_attempts;

        let mut outcome = RequeueOutcome::default();
        {
            let mut select = tx.prepare(
                "SELECT attempts FROM telemetry_records
                 WHERE local_id = ?1 AND status = 'in_flight'",
            )?;
            let mut to_pending = tx.prepare(
                "UPDATE telemetry_records
                 SET status = 'pending', attempts = ?2, batch_id = NULL, last_error = ?3
                 WHERE local_id = ?1",
            )?;
            let mut to_failed = tx.prepare(
                "UPDATE telemetry_records
                 SET status = 'failed', attempts = ?2, batch_id = NULL,
                     failed_at = ?3, last_error = ?4
                 WHERE local_id = ?1",
            )?;

            for &id in ids {
                let attempts: Option<u32> = select.query_row(params![id], |row| row.get(0)).optional()?;
                let Some(attempts) = attempts else {
                    continue;
                };

                let attempts = attempts + 1;
                if attempts > max_attempts {
                    to_failed.execute(params![id, attempts, now, reason])?;
                    outcome.failed.push(id);
                } else {
                    to_pending.execute(params![id, attempts, reason])?;
                    outcome.requeued += 1;
                }
            }
        }

        settle_cursor(&tx)?;
        tx.commit()?;

        if !outcome.failed.is_empty() {
            error!(
                dropped = outcome.failed.len(),
                ids = ?outcome.failed,
                "Records exceeded {} attempts and were dropped: {}",
                max_attempts,
                reason
            );
        }
        debug!("Requeued {} records", outcome.requeued);
        Ok(outcome)
    }

    /// Return in-flight records to Pending without consuming an attempt
    pub fn release(&self, ids: &[i64]) -> SyncResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let mut changed = 0;
        for chunk in ids.chunks(MAX_IN_PARAMS) {
            let sql = format!(
                "UPDATE telemetry_records SET status = 'pending', batch_id = NULL
                 WHERE status = 'in_flight' AND local_id IN ({})",
                placeholders(chunk.len())
            );
            changed += tx.execute(&sql, params_from_iter(chunk.iter()))?;
        }

        settle_cursor(&tx)?;
        tx.commit()?;

        debug!("Released {} records", changed);
        Ok(changed)
    }

    /// Mark records terminally Failed without further attempts
    pub fn mark_failed(&self, ids: &[i64], reason: &str) -> SyncResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let now = to_millis(Utc::now());

        let mut changed = 0;
        for chunk in ids.chunks(MAX_IN_PARAMS) {
            let sql = format!(
                "UPDATE telemetry_records
                 SET status = 'failed', failed_at = ?1, last_error = ?2, batch_id = NULL
                 WHERE status IN ('pending', 'in_flight') AND local_id IN ({})",
                (0..chunk.len())
                    .map(|i| format!("?{}", i + 3))
                    .collect::<Vec<_>>()
                    .join(",")
            );
            let mut stmt = tx.prepare(&sql)?;
            stmt.raw_bind_parameter(1, now)?;
            stmt.raw_bind_parameter(2, reason)?;
            for (i, id) in chunk.iter().enumerate() {
                stmt.raw_bind_parameter(i + 3, *id)?;
            }
            changed += stmt.raw_execute()?;
        }

        settle_cursor(&tx)?;
        tx.commit()?;

        if changed > 0 {
            warn!("Marked {} records failed: {}", changed, reason);
        }
        Ok(changed)
    }

    /// Reset every InFlight record to Pending.
    ///
    /// Run on startup and at the start of each cycle: a batch left in flight
    /// by a crash or cancellation was never confirmed delivered.
    pub fn recover_in_flight(&self) -> SyncResult<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let recovered = tx.execute(
            "UPDATE telemetry_records SET status = 'pending', batch_id = NULL
             WHERE status = 'in_flight'",
            [],
        )?;
        tx.execute(
            "UPDATE sync_cursor SET in_flight_batch_id = NULL WHERE id = 1",
            [],
        )?;
        tx.commit()?;

        if recovered > 0 {
            warn!(
                "Recovered {} records left in flight by an interrupted cycle",
                recovered
            );
        }
        Ok(recovered)
    }

    /// Delete Acked and Failed records past their retention windows
    pub fn compact(&self) -> SyncResult<usize> {
        self.compact_at(Utc::now())
    }

    /// Compact as if the current time were `now`
    pub fn compact_at(&self, now: DateTime<Utc>) -> SyncResult<usize> {
        let now_ms = to_millis(now);
        let ack_cutoff = now_ms.saturating_sub(duration_ms(self.config.ack_retention));
        let failed_cutoff = now_ms.saturating_sub(duration_ms(self.config.failed_retention));

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let predicate = "(status = 'acked' AND acked_at <= ?1)
                         OR (status = 'failed' AND failed_at <= ?2)";
        let max_id: Option<i64> = tx.query_row(
            &format!(
                "SELECT MAX(local_id) FROM telemetry_records WHERE {}",
                predicate
            ),
            params![ack_cutoff, failed_cutoff],
            |row| row.get(0),
        )?;
        let removed = tx.execute(
            &format!("DELETE FROM telemetry_records WHERE {}", predicate),
            params![ack_cutoff, failed_cutoff],
        )?;
        if let Some(max_id) = max_id {
            tx.execute(
                "UPDATE sync_cursor SET last_compacted_id = MAX(last_compacted_id, ?1)
                 WHERE id = 1",
                params![max_id],
            )?;
        }
        tx.commit()?;

        if removed > 0 {
            info!("Compacted {} delivered or failed records", removed);
        }
        Ok(removed)
    }

    /// Look up a single record
    pub fn get(&self, local_id: i64) -> SyncResult<Option<TelemetryRecord>> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                &format!(
                    "SELECT {} FROM telemetry_records WHERE local_id = ?1",
                    RECORD_COLUMNS
                ),
                params![local_id],
                TelemetryRecord::from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Most recent terminally failed records
    pub fn failed_records(&self, limit: usize) -> SyncResult<Vec<FailedRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT local_id, attempts, failed_at, last_error FROM telemetry_records
             WHERE status = 'failed'
             ORDER BY local_id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(FailedRecord {
                local_id: row.get(0)?,
                attempts: row.get(1)?,
                failed_at: row.get::<_, Option<i64>>(2)?.map(from_millis),
                last_error: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Record counts per status
    pub fn counts(&self) -> SyncResult<StoreCounts> {
        let conn = self.conn.lock();
        let mut counts = StoreCounts::default();

        {
            let mut stmt = conn.prepare(
                "SELECT status, COUNT(*), COALESCE(SUM(LENGTH(payload)), 0)
                 FROM telemetry_records GROUP BY status",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, RecordStatus>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?;
            for row in rows {
                let (status, count, bytes) = row?;
                let count = count as u64;
                match status {
                    RecordStatus::Pending => {
                        counts.pending = count;
                        counts.pending_bytes = bytes as u64;
                    }
                    RecordStatus::InFlight => counts.in_flight = count,
                    RecordStatus::Acked => counts.acked = count,
                    RecordStatus::Failed => counts.failed = count,
                }
            }
        }

        counts.oldest_pending_at = conn
            .query_row(
                "SELECT MIN(created_at) FROM telemetry_records WHERE status = 'pending'",
                [],
                |row| row.get::<_, Option<i64>>(0),
            )?
            .map(from_millis);

        counts.last_local_id = conn
            .query_row(
                "SELECT seq FROM sqlite_sequence WHERE name = 'telemetry_records'",
                [],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0);

        Ok(counts)
    }

    /// Persisted sync cursor
    pub fn cursor(&self) -> SyncResult<SyncCursor> {
        let conn = self.conn.lock();
        let cursor = conn.query_row(
            "SELECT last_compacted_id, in_flight_batch_id FROM sync_cursor WHERE id = 1",
            [],
            |row| {
                Ok(SyncCursor {
                    last_compacted_id: row.get(0)?,
                    in_flight_batch_id: row.get(1)?,
                })
            },
        )?;
        Ok(cursor)
    }
}

/// Clear the cursor's batch id once nothing is in flight
fn settle_cursor(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE sync_cursor SET in_flight_batch_id = NULL
         WHERE id = 1
           AND NOT EXISTS (SELECT 1 FROM telemetry_records WHERE status = 'in_flight')",
        [],
    )?;
    Ok(())
}

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Database;

    fn store_with(config: EventStoreConfig) -> EventStore {
        Database::in_memory().unwrap().events(config)
    }

    fn store() -> EventStore {
        store_with(EventStoreConfig::default())
    }

    fn append_n(store: &EventStore, n: usize) -> Vec<i64> {
        (0..n)
            .map(|i| store.append(format!("record-{}", i).as_bytes()).unwrap())
            .collect()
    }

    #[test]
    fn test_append_assigns_increasing_ids() {
        let store = store();
        let ids = append_n(&store, 3);
        assert_eq!(ids, vec![1, 2, 3]);

        let record = store.get(2).unwrap().unwrap();
        assert_eq!(record.payload, b"record-1");
        assert_eq!(record.status, RecordStatus::Pending);
        assert_eq!(record.attempts, 0);
        assert!(record.last_attempt_at.is_none());
    }

    #[test]
    fn test_ids_never_reused_after_compaction() {
        let store = store();
        append_n(&store, 2);
        let batch = store.next_batch(10, usize::MAX).unwrap();
        store.ack(&batch.ids()).unwrap();
        assert_eq!(store.compact().unwrap(), 2);

        assert_eq!(store.append(b"after").unwrap(), 3);
        assert_eq!(store.cursor().unwrap().last_compacted_id, 2);
    }

    #[test]
    fn test_partial_ack_scenario() {
        let store = store();
        assert_eq!(append_n(&store, 5), vec![1, 2, 3, 4, 5]);

        let batch = store.next_batch(3, usize::MAX).unwrap();
        assert_eq!(batch.ids(), vec![1, 2, 3]);
        assert!(batch
            .records
            .iter()
            .all(|r| r.status == RecordStatus::InFlight));
        assert_eq!(
            store.cursor().unwrap().in_flight_batch_id.as_deref(),
            Some(batch.id.as_str())
        );

        assert_eq!(store.ack(&[1, 2]).unwrap(), 2);
        let outcome = store.requeue(&[3], "not acknowledged").unwrap();
        assert_eq!(outcome.requeued, 1);
        assert!(outcome.failed.is_empty());
        assert_eq!(store.get(3).unwrap().unwrap().attempts, 1);

        let next = store.next_batch(10, usize::MAX).unwrap();
        assert_eq!(next.ids(), vec![3, 4, 5]);
        assert_ne!(next.id, batch.id);
    }

    #[test]
    fn test_single_batch_in_flight() {
        let store = store();
        append_n(&store, 4);

        let first = store.next_batch(2, usize::MAX).unwrap();
        let err = store.next_batch(2, usize::MAX).unwrap_err();
        assert!(matches!(err, SyncError::BatchOutstanding(ref id) if *id == first.id));

        // Appends are not blocked by the outstanding batch
        assert_eq!(store.append(b"late").unwrap(), 5);

        store.ack(&first.ids()).unwrap();
        assert!(store.cursor().unwrap().in_flight_batch_id.is_none());

        let second = store.next_batch(10, usize::MAX).unwrap();
        assert_eq!(second.ids(), vec![3, 4, 5]);
    }

    #[test]
    fn test_max_bytes_limits_batch() {
        let store = store();
        store.append(&[0u8; 40]).unwrap();
        store.append(&[0u8; 40]).unwrap();
        store.append(&[0u8; 40]).unwrap();

        let batch = store.next_batch(10, 100).unwrap();
        assert_eq!(batch.ids(), vec![1, 2]);
        assert_eq!(batch.total_bytes(), 80);
    }

    #[test]
    fn test_oversized_record_still_sent_alone() {
        let store = store();
        store.append(&[1u8; 500]).unwrap();
        store.append(&[2u8; 10]).unwrap();

        let batch = store.next_batch(10, 100).unwrap();
        assert_eq!(batch.ids(), vec![1]);
    }

    #[test]
    fn test_empty_queue_yields_empty_batch() {
        let store = store();
        let batch = store.next_batch(10, usize::MAX).unwrap();
        assert!(batch.is_empty());
        assert!(store.cursor().unwrap().in_flight_batch_id.is_none());

        append_n(&store, 1);
        assert!(store.next_batch(0, usize::MAX).unwrap().is_empty());
    }

    #[test]
    fn test_attempts_ceiling_drops_record() {
        let store = store_with(EventStoreConfig {
            max_attempts: 2,
            ..Default::default()
        });
        append_n(&store, 2);

        for attempt in 1..=2 {
            let batch = store.next_batch(1, usize::MAX).unwrap();
            assert_eq!(batch.ids(), vec![1]);
            let outcome = store.requeue(&batch.ids(), "timeout").unwrap();
            assert_eq!(outcome.requeued, 1);
            assert_eq!(store.get(1).unwrap().unwrap().attempts, attempt);
        }

        let batch = store.next_batch(1, usize::MAX).unwrap();
        let outcome = store.requeue(&batch.ids(), "timeout").unwrap();
        assert_eq!(outcome.requeued, 0);
        assert_eq!(outcome.failed, vec![1]);

        let record = store.get(1).unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::Failed);
        assert_eq!(record.attempts, 3);

        // Excluded from all future batches
        let batch = store.next_batch(10, usize::MAX).unwrap();
        assert_eq!(batch.ids(), vec![2]);

        let failed = store.failed_records(10).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].last_error.as_deref(), Some("timeout"));
    }

    #[test]
    fn test_crash_between_batch_and_ack_redelivers() {
        let store = store();
        append_n(&store, 3);

        let lost = store.next_batch(10, usize::MAX).unwrap();
        assert_eq!(lost.ids(), vec![1, 2, 3]);

        // Process dies here; on restart the batch is recovered
        assert_eq!(store.recover_in_flight().unwrap(), 3);
        assert!(store.cursor().unwrap().in_flight_batch_id.is_none());

        let again = store.next_batch(10, usize::MAX).unwrap();
        assert_eq!(again.ids(), lost.ids());
        // Recovery does not consume attempts
        assert!(again.records.iter().all(|r| r.attempts == 0));

        store.ack(&again.ids()).unwrap();
        assert!(store.next_batch(10, usize::MAX).unwrap().is_empty());
    }

    #[test]
    fn test_acked_records_never_resurrected() {
        let store = store();
        append_n(&store, 2);
        let batch = store.next_batch(10, usize::MAX).unwrap();
        store.ack(&[1]).unwrap();

        // Late requeue / release / recover of an acked id has no effect
        let outcome = store.requeue(&[1, 2], "late").unwrap();
        assert_eq!(outcome.requeued, 1);
        assert_eq!(store.release(&[1]).unwrap(), 0);
        store.recover_in_flight().unwrap();
        assert_eq!(store.get(1).unwrap().unwrap().status, RecordStatus::Acked);
        assert_eq!(batch.len(), 2);

        let next = store.next_batch(10, usize::MAX).unwrap();
        assert_eq!(next.ids(), vec![2]);
    }

    #[test]
    fn test_ack_ignores_pending_records() {
        let store = store();
        append_n(&store, 1);
        assert_eq!(store.ack(&[1]).unwrap(), 0);
        assert_eq!(store.get(1).unwrap().unwrap().status, RecordStatus::Pending);
    }

    #[test]
    fn test_release_keeps_attempts() {
        let store = store();
        append_n(&store, 2);
        let batch = store.next_batch(10, usize::MAX).unwrap();
        assert_eq!(store.release(&batch.ids()).unwrap(), 2);

        let again = store.next_batch(10, usize::MAX).unwrap();
        assert_eq!(again.ids(), vec![1, 2]);
        assert!(again.records.iter().all(|r| r.attempts == 0));
    }

    #[test]
    fn test_mark_failed() {
        let store = store();
        append_n(&store, 3);
        let batch = store.next_batch(10, usize::MAX).unwrap();

        assert_eq!(store.mark_failed(&[2], "schema violation").unwrap(), 1);
        store.ack(&[1, 3]).unwrap();
        assert!(store.cursor().unwrap().in_flight_batch_id.is_none());
        assert_eq!(batch.len(), 3);

        let counts = store.counts().unwrap();
        assert_eq!(counts.acked, 2);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.unsent(), 0);
    }

    #[test]
    fn test_compact_respects_retention() {
        let store = store_with(EventStoreConfig {
            ack_retention: Duration::from_secs(60),
            failed_retention: Duration::from_secs(3600),
            ..Default::default()
        });
        append_n(&store, 3);
        let batch = store.next_batch(10, usize::MAX).unwrap();
        store.ack(&[1, 2]).unwrap();
        store.mark_failed(&[3], "rejected").unwrap();
        assert_eq!(batch.len(), 3);

        let now = Utc::now();
        assert_eq!(store.compact_at(now).unwrap(), 0);

        // Acked records age out first
        assert_eq!(
            store
                .compact_at(now + chrono::Duration::seconds(120))
                .unwrap(),
            2
        );
        assert_eq!(store.get(3).unwrap().unwrap().status, RecordStatus::Failed);

        assert_eq!(
            store
                .compact_at(now + chrono::Duration::seconds(7200))
                .unwrap(),
            1
        );
        assert_eq!(store.cursor().unwrap().last_compacted_id, 3);
    }

    #[test]
    fn test_compact_never_touches_unsent() {
        let store = store();
        append_n(&store, 2);
        store.next_batch(1, usize::MAX).unwrap();

        assert_eq!(
            store
                .compact_at(Utc::now() + chrono::Duration::days(365))
                .unwrap(),
            0
        );
        assert_eq!(store.counts().unwrap().unsent(), 2);
    }

    #[test]
    fn test_storage_full() {
        let store = store_with(EventStoreConfig {
            max_pending_records: 2,
            ..Default::default()
        });
        append_n(&store, 2);

        let err = store.append(b"overflow").unwrap_err();
        assert!(matches!(err, SyncError::StorageFull(_)));
        assert!(store.append_many(&[b"a", b"b"]).is_err());

        // Delivered records free capacity
        let batch = store.next_batch(1, usize::MAX).unwrap();
        store.ack(&batch.ids()).unwrap();
        assert!(store.append(b"fits").is_ok());
    }

    #[test]
    fn test_append_many_preserves_order() {
        let store = store();
        let ids = store
            .append_many(&[b"a".to_vec(), b"b".to_vec(), b"c".to_vec()])
            .unwrap();
        assert_eq!(ids, vec![1, 2, 3]);

        let batch = store.next_batch(10, usize::MAX).unwrap();
        let payloads: Vec<_> = batch.records.iter().map(|r| r.payload.clone()).collect();
        assert_eq!(payloads, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn test_counts() {
        let store = store();
        let counts = store.counts().unwrap();
        assert_eq!(counts.pending, 0);
        assert!(counts.oldest_pending_at.is_none());
        assert_eq!(counts.last_local_id, 0);

        store.append(&[0u8; 10]).unwrap();
        store.append(&[0u8; 5]).unwrap();
        store.next_batch(1, usize::MAX).unwrap();

        let counts = store.counts().unwrap();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.in_flight, 1);
        assert_eq!(counts.pending_bytes, 5);
        assert!(counts.oldest_pending_at.is_some());
        assert_eq!(counts.last_local_id, 2);
    }

    #[test]
    fn test_concurrent_appends_keep_order() {
        let store = store();
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        store.append(format!("{}-{}", t, i).as_bytes()).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let batch = store.next_batch(1000, usize::MAX).unwrap();
        let ids = batch.ids();
        assert_eq!(ids.len(), 100);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }
}
