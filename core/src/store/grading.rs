//! Donor population and grade publication.

use super::EngineStore;
use crate::{
    collaborator::{DonorSource, GradeSink},
    error::EngineResult,
    grade::Grade,
    grading_engine::{DonorSnapshot, GradeScope, ScopeEntry, ScopeRanking},
};
use rusqlite::{params, OptionalExtension};

impl EngineStore {
    pub fn upsert_donor(&self, donor: &DonorSnapshot) -> EngineResult<()> {
        self.conn()?.execute(
            "INSERT INTO donor (donor_id, contribution_total, county) VALUES (?1, ?2, ?3)
             ON CONFLICT(donor_id) DO UPDATE SET
                contribution_total = excluded.contribution_total,
                county = excluded.county",
            params![donor.donor_id, donor.contribution_total, donor.county],
        )?;
        Ok(())
    }

    /// Bulk insert in one transaction (used by seeding and tests).
    pub fn upsert_donors(&self, donors: &[DonorSnapshot]) -> EngineResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO donor (donor_id, contribution_total, county) VALUES (?1, ?2, ?3)
                 ON CONFLICT(donor_id) DO UPDATE SET
                    contribution_total = excluded.contribution_total,
                    county = excluded.county",
            )?;
            for donor in donors {
                stmt.execute(params![donor.donor_id, donor.contribution_total, donor.county])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn donor_count(&self) -> EngineResult<i64> {
        let count: i64 = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM donor", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Published ranking of one scope, best rank first.
    pub fn scope_grades(&self, scope: &GradeScope) -> EngineResult<Vec<ScopeEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT donor_id, rank, percentile, grade FROM donor_grade
             WHERE scope_key = ?1 ORDER BY rank ASC",
        )?;
        let rows = stmt
            .query_map(params![scope.key()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(donor_id, rank, percentile, grade)| -> EngineResult<ScopeEntry> {
                Ok(ScopeEntry {
                    donor_id,
                    rank: rank as u32,
                    percentile,
                    grade: grade.parse()?,
                })
            })
            .collect()
    }

    /// A donor's published grade in one scope; `U` when unranked there.
    pub fn published_grade(&self, scope: &GradeScope, donor_id: &str) -> EngineResult<Grade> {
        let grade: Option<String> = self
            .conn()?
            .query_row(
                "SELECT grade FROM donor_grade WHERE scope_key = ?1 AND donor_id = ?2",
                params![scope.key(), donor_id],
                |row| row.get(0),
            )
            .optional()?;
        match grade {
            Some(g) => g.parse(),
            None => Ok(Grade::U),
        }
    }
}

impl DonorSource for EngineStore {
    fn fetch_qualifying_donors(&self) -> EngineResult<Vec<DonorSnapshot>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT donor_id, contribution_total, county FROM donor ORDER BY donor_id ASC",
        )?;
        let donors = stmt
            .query_map([], |row| {
                Ok(DonorSnapshot {
                    donor_id:           row.get(0)?,
                    contribution_total: row.get(1)?,
                    county:             row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(donors)
    }
}

impl GradeSink for EngineStore {
    /// One transaction for the whole cycle. Any failure rolls every scope back.
    fn publish_cycle(&self, rankings: &[ScopeRanking], cleared: &[GradeScope]) -> EngineResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut delete = tx.prepare("DELETE FROM donor_grade WHERE scope_key = ?1")?;
            let mut insert = tx.prepare(
                "INSERT INTO donor_grade (scope_key, donor_id, rank, percentile, grade)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for scope in cleared {
                delete.execute(params![scope.key()])?;
            }
            for ranking in rankings {
                let key = ranking.scope.key();
                delete.execute(params![key])?;
                for entry in &ranking.entries {
                    insert.execute(params![
                        key,
                        entry.donor_id,
                        entry.rank as i64,
                        entry.percentile,
                        entry.grade.as_str(),
                    ])?;
                }
            }
        }
        tx.commit()?;
        log::debug!(
            "store: published {} scopes ({} rows), cleared {}",
            rankings.len(),
            rankings.iter().map(|r| r.entries.len()).sum::<usize>(),
            cleared.len()
        );
        Ok(())
    }
}
