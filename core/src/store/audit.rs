use super::{from_millis, to_millis, EngineStore};
use crate::{
    collaborator::AuditSink,
    error::{EngineError, EngineResult},
    event::AuditRecord,
};
use rusqlite::params;
use uuid::Uuid;

impl EngineStore {
    /// Audit trail of one component in insertion order.
    pub fn audit_records(&self, component: &str) -> EngineResult<Vec<AuditRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT audit_id, timestamp_ms, component, event_type, subject_id,
                    before_json, after_json, reason
             FROM audit_log WHERE component = ?1
             ORDER BY rowid ASC",
        )?;
        let rows = stmt
            .query_map(params![component], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, ts, component, event_type, subject_id, before, after, reason)| -> EngineResult<AuditRecord> {
                Ok(AuditRecord {
                    audit_id: Uuid::parse_str(&id).map_err(|e| {
                        EngineError::invalid_input("audit_id", format!("'{id}' is not a uuid: {e}"))
                    })?,
                    timestamp: from_millis(ts)?,
                    component,
                    event_type,
                    subject_id,
                    before: serde_json::from_str(&before)?,
                    after: serde_json::from_str(&after)?,
                    reason,
                })
            })
            .collect()
    }

    pub fn audit_count(&self, component: &str, event_type: &str) -> EngineResult<i64> {
        let count: i64 = self.conn()?.query_row(
            "SELECT COUNT(*) FROM audit_log WHERE component = ?1 AND event_type = ?2",
            params![component, event_type],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

impl AuditSink for EngineStore {
    fn append_audit(&self, record: &AuditRecord) -> EngineResult<()> {
        self.conn()?.execute(
            "INSERT INTO audit_log (
                audit_id, timestamp_ms, component, event_type, subject_id,
                before_json, after_json, reason
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.audit_id.to_string(),
                to_millis(record.timestamp),
                record.component,
                record.event_type,
                record.subject_id,
                serde_json::to_string(&record.before)?,
                serde_json::to_string(&record.after)?,
                record.reason,
            ],
        )?;
        Ok(())
    }
}
