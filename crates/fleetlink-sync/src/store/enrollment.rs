//! Persisted enrollment state machine

use super::{from_millis, to_millis};
use crate::error::{SyncError, SyncResult};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

/// Where the device stands with the fleet server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    #[default]
    Unenrolled,
    Enrolling,
    Enrolled,
    Failed,
}

impl EnrollmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrollmentStatus::Unenrolled => "unenrolled",
            EnrollmentStatus::Enrolling => "enrolling",
            EnrollmentStatus::Enrolled => "enrolled",
            EnrollmentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unenrolled" => Some(EnrollmentStatus::Unenrolled),
            "enrolling" => Some(EnrollmentStatus::Enrolling),
            "enrolled" => Some(EnrollmentStatus::Enrolled),
            "failed" => Some(EnrollmentStatus::Failed),
            _ => None,
        }
    }

    /// Allowed edges of the state machine.
    ///
    /// Any state may go back to Unenrolled through an explicit reset.
    pub fn can_transition_to(&self, next: EnrollmentStatus) -> bool {
        use EnrollmentStatus::*;
        matches!(
            (self, next),
            (Unenrolled, Enrolling)
                | (Failed, Enrolling)
                | (Enrolling, Enrolled)
                | (Enrolling, Failed)
                | (Enrolled, Failed)
                | (_, Unenrolled)
        )
    }
}

impl std::fmt::Display for EnrollmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable enrollment record. Holds no secrets; the API key lives in the vault.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnrollmentState {
    pub status: EnrollmentStatus,
    pub device_id: Option<String>,
    pub policy_id: Option<String>,
    pub enrolled_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Whether a Failed state may be retried with the same token
    pub retryable: bool,
    /// sha256 of a token the server terminally rejected
    #[serde(skip)]
    pub rejected_token_hash: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl EnrollmentState {
    pub fn unenrolled() -> Self {
        Self {
            retryable: true,
            ..Default::default()
        }
    }

    pub fn enrolling() -> Self {
        Self {
            status: EnrollmentStatus::Enrolling,
            retryable: true,
            ..Default::default()
        }
    }

    pub fn enrolled(
        device_id: impl Into<String>,
        policy_id: Option<String>,
        enrolled_at: DateTime<Utc>,
    ) -> Self {
        Self {
            status: EnrollmentStatus::Enrolled,
            device_id: Some(device_id.into()),
            policy_id,
            enrolled_at: Some(enrolled_at),
            retryable: true,
            ..Default::default()
        }
    }

    pub fn failed(reason: impl Into<String>, retryable: bool) -> Self {
        Self {
            status: EnrollmentStatus::Failed,
            last_error: Some(reason.into()),
            retryable,
            ..Default::default()
        }
    }

    pub fn is_enrolled(&self) -> bool {
        self.status == EnrollmentStatus::Enrolled
    }
}

/// Repository for the single enrollment state row
#[derive(Clone)]
pub struct EnrollmentStateStore {
    conn: Arc<Mutex<Connection>>,
}

impl EnrollmentStateStore {
    pub(crate) fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    pub fn load(&self) -> SyncResult<EnrollmentState> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT status, device_id, policy_id, enrolled_at, last_error,
                        retryable, rejected_token_hash, updated_at
                 FROM enrollment_state WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<i64>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, bool>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, i64>(7)?,
                    ))
                },
            )
            .optional()?;

        let Some((status, device_id, policy_id, enrolled_at, last_error, retryable, hash, updated)) =
            row
        else {
            return Ok(EnrollmentState::unenrolled());
        };

        let status = EnrollmentStatus::parse(&status).ok_or_else(|| {
            SyncError::StorageCorrupt(format!("unknown enrollment status '{}'", status))
        })?;

        Ok(EnrollmentState {
            status,
            device_id,
            policy_id,
            enrolled_at: enrolled_at.map(from_millis),
            last_error,
            retryable,
            rejected_token_hash: hash,
            updated_at: (updated > 0).then(|| from_millis(updated)),
        })
    }

    /// Overwrite the state, whatever writer came before.
    ///
    /// Still refuses an edge the state machine does not allow.
    pub fn save(&self, state: &EnrollmentState) -> SyncResult<()> {
        let conn = self.conn.lock();
        let current = current_status(&conn)?;
        check_transition(current, state.status)?;
        write_state(&conn, state, None)?;
        debug!("Enrollment state -> {}", state.status);
        Ok(())
    }

    /// Replace the state only if its current status is `expected`.
    ///
    /// Returns false when another writer changed it first, and
    /// `InvalidTransition` when `expected -> next` is not an allowed edge.
    pub fn compare_and_swap(
        &self,
        expected: EnrollmentStatus,
        next: &EnrollmentState,
    ) -> SyncResult<bool> {
        check_transition(expected, next.status)?;
        let conn = self.conn.lock();
        let swapped = write_state(&conn, next, Some(expected))? == 1;
        if swapped {
            debug!("Enrollment state {} -> {}", expected, next.status);
        }
        Ok(swapped)
    }

    /// Update the policy id of an enrolled device
    pub fn set_policy_id(&self, policy_id: Option<&str>) -> SyncResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE enrollment_state SET policy_id = ?1, updated_at = ?2 WHERE id = 1",
            params![policy_id, to_millis(Utc::now())],
        )?;
        Ok(())
    }
}

fn check_transition(from: EnrollmentStatus, to: EnrollmentStatus) -> SyncResult<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(SyncError::InvalidTransition { from, to })
    }
}

fn current_status(conn: &Connection) -> SyncResult<EnrollmentStatus> {
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM enrollment_state WHERE id = 1",
            [],
            |row| row.get(0),
        )
        .optional()?;
    match status {
        None => Ok(EnrollmentStatus::Unenrolled),
        Some(s) => EnrollmentStatus::parse(&s).ok_or_else(|| {
            SyncError::StorageCorrupt(format!("unknown enrollment status '{}'", s))
        }),
    }
}

fn write_state(
    conn: &Connection,
    state: &EnrollmentState,
    expected: Option<EnrollmentStatus>,
) -> rusqlite::Result<usize> {
    // ?9 NULL matches any current status
    conn.execute(
        "UPDATE enrollment_state
         SET status = ?1, device_id = ?2, policy_id = ?3, enrolled_at = ?4,
             last_error = ?5, retryable = ?6, rejected_token_hash = ?7, updated_at = ?8
         WHERE id = 1 AND (?9 IS NULL OR status = ?9)",
        params![
            state.status.as_str(),
            state.device_id,
            state.policy_id,
            state.enrolled_at.map(to_millis),
            state.last_error,
            state.retryable,
            state.rejected_token_hash,
            to_millis(Utc::now()),
            expected.map(|s| s.as_str()),
        ],
    )
}
