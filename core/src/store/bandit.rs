use super::EngineStore;
use crate::{bandit_engine::BanditArmState, collaborator::ArmStore, error::EngineResult};
use rusqlite::params;

impl ArmStore for EngineStore {
    fn load_arm_state(&self, experiment_id: &str) -> EngineResult<Vec<BanditArmState>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT variant_id, alpha, beta, impressions, conversions,
                    cumulative_revenue, traffic_allocation_pct
             FROM bandit_arm WHERE experiment_id = ?1
             ORDER BY variant_id ASC",
        )?;
        let arms = stmt
            .query_map(params![experiment_id], |row| {
                Ok(BanditArmState {
                    variant_id:             row.get(0)?,
                    alpha:                  row.get::<_, i64>(1)? as u64,
                    beta:                   row.get::<_, i64>(2)? as u64,
                    impressions:            row.get::<_, i64>(3)? as u64,
                    conversions:            row.get::<_, i64>(4)? as u64,
                    cumulative_revenue:     row.get(5)?,
                    traffic_allocation_pct: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(arms)
    }

    fn save_arm_state(&self, experiment_id: &str, arm: &BanditArmState) -> EngineResult<()> {
        self.conn()?.execute(
            "INSERT INTO bandit_arm (
                experiment_id, variant_id, alpha, beta, impressions, conversions,
                cumulative_revenue, traffic_allocation_pct
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(experiment_id, variant_id) DO UPDATE SET
                alpha = excluded.alpha,
                beta = excluded.beta,
                impressions = excluded.impressions,
                conversions = excluded.conversions,
                cumulative_revenue = excluded.cumulative_revenue,
                traffic_allocation_pct = excluded.traffic_allocation_pct",
            params![
                experiment_id,
                arm.variant_id,
                arm.alpha as i64,
                arm.beta as i64,
                arm.impressions as i64,
                arm.conversions as i64,
                arm.cumulative_revenue,
                arm.traffic_allocation_pct,
            ],
        )?;
        Ok(())
    }
}
