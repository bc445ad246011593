//! Metric windows and approval requests.

use super::{from_millis, to_millis, EngineStore};
use crate::{
    collaborator::{ApprovalGate, MetricSource},
    error::EngineResult,
    types::Timestamp,
    variance_controller::{CorrectionEvent, FunctionMetricWindow},
};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

impl EngineStore {
    pub fn insert_metric_window(&self, window: &FunctionMetricWindow) -> EngineResult<()> {
        self.conn()?.execute(
            "INSERT OR REPLACE INTO function_metric_window (
                function_code, period_start_ms, period_end_ms, forecast_cost, actual_cost,
                quality_score, effectiveness_score
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                window.function_code,
                to_millis(window.period_start),
                to_millis(window.period_end),
                window.forecast_cost,
                window.actual_cost,
                window.quality_score,
                window.effectiveness_score,
            ],
        )?;
        Ok(())
    }

    /// Event ids still waiting for a decision, oldest first.
    pub fn pending_approval_ids(&self) -> EngineResult<Vec<Uuid>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT event_id FROM approval_request ORDER BY requested_at_ms ASC")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids.iter().filter_map(|id| Uuid::parse_str(id).ok()).collect())
    }
}

impl MetricSource for EngineStore {
    fn fetch_metric_window(
        &self,
        function_code: &str,
        start: Timestamp,
        end: Timestamp,
    ) -> EngineResult<Option<FunctionMetricWindow>> {
        let row = self
            .conn()?
            .query_row(
                "SELECT period_start_ms, period_end_ms, forecast_cost, actual_cost,
                        quality_score, effectiveness_score
                 FROM function_metric_window
                 WHERE function_code = ?1 AND period_start_ms >= ?2 AND period_end_ms <= ?3
                 ORDER BY period_end_ms DESC LIMIT 1",
                params![function_code, to_millis(start), to_millis(end)],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, f64>(2)?,
                        row.get::<_, f64>(3)?,
                        row.get::<_, Option<f64>>(4)?,
                        row.get::<_, Option<f64>>(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((start_ms, end_ms, forecast_cost, actual_cost, quality_score, effectiveness_score)) = row
        else {
            return Ok(None);
        };
        Ok(Some(FunctionMetricWindow {
            function_code: function_code.to_string(),
            period_start: from_millis(start_ms)?,
            period_end: from_millis(end_ms)?,
            forecast_cost,
            actual_cost,
            quality_score,
            effectiveness_score,
        }))
    }
}

impl ApprovalGate for EngineStore {
    fn request_approval(&self, event: &CorrectionEvent) -> EngineResult<()> {
        self.conn()?.execute(
            "INSERT OR IGNORE INTO approval_request (
                event_id, function_code, rule_id, requested_at_ms, payload
             ) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.event_id.to_string(),
                event.function_code,
                event.rule_id,
                to_millis(event.triggered_at),
                serde_json::to_string(event)?,
            ],
        )?;
        Ok(())
    }

    fn approval_resolved(&self, event_id: Uuid) -> EngineResult<()> {
        self.conn()?.execute(
            "DELETE FROM approval_request WHERE event_id = ?1",
            params![event_id.to_string()],
        )?;
        Ok(())
    }
}
