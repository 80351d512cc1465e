//! The last policy settings received from the server.
//!
//! Kept so a restarted agent runs with the fleet's settings before its
//! first check-in.

use super::{from_millis, to_millis};
use crate::error::SyncResult;
use crate::types::PolicySettings;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedPolicy {
    pub action_id: Option<String>,
    pub policy_id: Option<String>,
    pub settings: PolicySettings,
    pub applied_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct PolicyStore {
    conn: Arc<Mutex<Connection>>,
}

impl PolicyStore {
    pub(crate) fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    pub fn load(&self) -> SyncResult<Option<AppliedPolicy>> {
        let row = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT action_id, policy_id, settings, applied_at FROM applied_policy WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?
        };

        match row {
            Some((action_id, policy_id, settings, applied_at)) => Ok(Some(AppliedPolicy {
                action_id,
                policy_id,
                settings: serde_json::from_str(&settings)?,
                applied_at: from_millis(applied_at),
            })),
            None => Ok(None),
        }
    }

    pub fn save(
        &self,
        action_id: Option<&str>,
        policy_id: Option<&str>,
        settings: &PolicySettings,
    ) -> SyncResult<()> {
        let settings = serde_json::to_string(settings)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO applied_policy (id, action_id, policy_id, settings, applied_at)
             VALUES (1, ?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                action_id = excluded.action_id,
                policy_id = excluded.policy_id,
                settings = excluded.settings,
                applied_at = excluded.applied_at",
            params![action_id, policy_id, settings, to_millis(Utc::now())],
        )?;
        Ok(())
    }

    /// Forget the policy, e.g. after unenrolling
    pub fn clear(&self) -> SyncResult<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM applied_policy", [])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::store::Database;
    use crate::types::PolicySettings;

    #[test]
    fn test_save_load_and_replace() {
        let db = Database::in_memory().unwrap();
        let store = db.policy();
        assert!(store.load().unwrap().is_none());

        let settings = PolicySettings {
            put_interval: Some("15s".into()),
            max_documents_per_request: Some(50),
            ..Default::default()
        };
        store.save(Some("act-1"), Some("p-1"), &settings).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.action_id.as_deref(), Some("act-1"));
        assert_eq!(loaded.settings, settings);

        let newer = PolicySettings {
            use_backoff: Some(false),
            ..Default::default()
        };
        store.save(None, Some("p-2"), &newer).unwrap();
        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.policy_id.as_deref(), Some("p-2"));
        assert!(loaded.action_id.is_none());
        assert_eq!(loaded.settings, newer);

        store.clear().unwrap();
        assert!(store.load().unwrap().is_none());
    }
}
