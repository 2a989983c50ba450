//! Targets: concrete DOM elements recorded for page test cases

use super::{placeholders, text_column, Database};
use crate::types::{Target, TestStatus};
use crate::Result;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use tracing::debug;

const TARGET_COLUMNS: &str = "id, run_id, page_id, page_test_case_id, source, status, rule_id, \
     selector, html, failure_summary, notes, remediation_id, landmark_id, parent_landmark_id, \
     occurrence_key, status_occurrences, remediation_occurrences, created_at";

fn row_to_target(row: &Row<'_>) -> rusqlite::Result<Target> {
    Ok(Target {
        id: row.get(0)?,
        run_id: row.get(1)?,
        page_id: row.get(2)?,
        page_test_case_id: row.get(3)?,
        source: text_column(row, 4)?,
        status: text_column(row, 5)?,
        rule_id: row.get(6)?,
        selector: row.get(7)?,
        html: row.get(8)?,
        failure_summary: row.get(9)?,
        notes: row.get(10)?,
        remediation_id: row.get(11)?,
        landmark_id: row.get(12)?,
        parent_landmark_id: row.get(13)?,
        occurrence_key: row.get(14)?,
        status_occurrences: row.get(15)?,
        remediation_occurrences: row.get(16)?,
        created_at: row.get(17)?,
    })
}

/// Insert one target, ignoring duplicates of (test case, rule, selector)
pub(super) fn insert_target_row(conn: &Connection, t: &Target) -> Result<bool> {
    let inserted = conn.execute(
        &format!(
            "INSERT OR IGNORE INTO targets ({}) VALUES \
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            TARGET_COLUMNS
        ),
        params![
            t.id,
            t.run_id,
            t.page_id,
            t.page_test_case_id,
            t.source.as_str(),
            t.status.as_str(),
            t.rule_id,
            t.selector,
            t.html,
            t.failure_summary,
            t.notes,
            t.remediation_id,
            t.landmark_id,
            t.parent_landmark_id,
            t.occurrence_key,
            t.status_occurrences,
            t.remediation_occurrences,
            t.created_at,
        ],
    )?;
    Ok(inserted > 0)
}

/// Review fields written by a manual decision
#[derive(Debug, Clone, Default)]
pub struct TargetReview {
    pub status: Option<TestStatus>,
    pub notes: Option<String>,
    pub remediation_id: Option<String>,
}

impl Database {
    /// Insert targets with duplicate tolerance, returning how many were new
    pub fn insert_targets(&self, targets: &[Target]) -> Result<usize> {
        let inserted = self.transaction(|tx| {
            let mut inserted = 0;
            for target in targets {
                if insert_target_row(tx, target)? {
                    inserted += 1;
                }
            }
            Ok(inserted)
        })?;
        debug!(
            "Inserted {} of {} targets ({} duplicates skipped)",
            inserted,
            targets.len(),
            targets.len() - inserted
        );
        Ok(inserted)
    }

    pub fn get_target(&self, id: &str) -> Result<Option<Target>> {
        let conn = self.conn.lock();
        let target = conn
            .query_row(
                &format!("SELECT {} FROM targets WHERE id = ?1", TARGET_COLUMNS),
                params![id],
                row_to_target,
            )
            .optional()?;
        Ok(target)
    }

    pub fn list_targets(&self, run_id: &str) -> Result<Vec<Target>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM targets WHERE run_id = ?1 ORDER BY page_id, created_at, rowid",
            TARGET_COLUMNS
        ))?;
        let rows = stmt.query_map(params![run_id], row_to_target)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Targets captured for one page, in capture order
    pub fn list_targets_for_page(&self, run_id: &str, page_id: &str) -> Result<Vec<Target>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM targets WHERE run_id = ?1 AND page_id = ?2 ORDER BY rowid",
            TARGET_COLUMNS
        ))?;
        let rows = stmt.query_map(params![run_id, page_id], row_to_target)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// One page of a run's targets, ordered by id so paging is stable
    pub fn list_targets_page(&self, run_id: &str, offset: usize, limit: usize) -> Result<Vec<Target>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM targets WHERE run_id = ?1 ORDER BY id LIMIT ?2 OFFSET ?3",
            TARGET_COLUMNS
        ))?;
        let rows = stmt.query_map(params![run_id, limit as i64, offset as i64], row_to_target)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn count_targets(&self, run_id: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM targets WHERE run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// All members of the given occurrence groups within a run
    pub fn list_occurrences(&self, run_id: &str, keys: &[String]) -> Result<Vec<Target>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM targets WHERE run_id = ? AND occurrence_key IN ({}) ORDER BY rowid",
            TARGET_COLUMNS,
            placeholders(keys.len())
        ))?;
        let args = std::iter::once(run_id.to_string()).chain(keys.iter().cloned());
        let rows = stmt.query_map(params_from_iter(args), row_to_target)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Apply a review decision to the listed targets
    pub fn review_targets(&self, ids: &[String], review: &TargetReview) -> Result<usize> {
        self.transaction(|tx| {
            let mut stmt = tx.prepare(
                "UPDATE targets SET
                    status = COALESCE(?1, status),
                    notes = COALESCE(?2, notes),
                    remediation_id = COALESCE(?3, remediation_id)
                 WHERE id = ?4",
            )?;
            let mut updated = 0;
            for id in ids {
                updated += stmt.execute(params![
                    review.status.map(|s| s.as_str()),
                    review.notes,
                    review.remediation_id,
                    id,
                ])?;
            }
            Ok(updated)
        })
    }

    /// Write recomputed occurrence counters as `(id, same status, same remediation)`
    pub fn write_occurrence_counters(&self, counters: &[(String, i64, i64)]) -> Result<()> {
        self.transaction(|tx| {
            let mut stmt = tx.prepare(
                "UPDATE targets SET status_occurrences = ?1, remediation_occurrences = ?2 WHERE id = ?3",
            )?;
            for (id, by_status, by_remediation) in counters {
                stmt.execute(params![by_status, by_remediation, id])?;
            }
            Ok(())
        })
    }

    /// Whether any target of the run still awaits a reviewer decision
    pub fn needs_manual_check(&self, run_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM targets WHERE run_id = ?1 AND status IN (?2, ?3, ?4))",
            params![
                run_id,
                TestStatus::Manual.as_str(),
                TestStatus::Incomplete.as_str(),
                TestStatus::Error.as_str(),
            ],
            |row| row.get(0),
        )?;
        Ok(exists)
    }
}
