//! Environment tests, their page links and page test cases

use super::{text_column, targets::insert_target_row, Database};
use crate::types::{
    PageRunStatus, PageTestCase, RunPage, RunStatus, Target, TestCaseKind, TestRun, TestStatus,
};
use crate::{Error, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};

const RUN_COLUMNS: &str =
    "id, environment_id, name, status, notes, started_at, ended_at, created_at";
const RUN_PAGE_COLUMNS: &str = "run_id, page_id, role, position, status, started_at, ended_at";
const CASE_COLUMNS: &str = "id, run_id, page_id, test_case_id, status, started_at, ended_at";

fn row_to_run(row: &Row<'_>) -> rusqlite::Result<TestRun> {
    Ok(TestRun {
        id: row.get(0)?,
        environment_id: row.get(1)?,
        name: row.get(2)?,
        status: text_column(row, 3)?,
        notes: row.get(4)?,
        started_at: row.get(5)?,
        ended_at: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn row_to_run_page(row: &Row<'_>) -> rusqlite::Result<RunPage> {
    Ok(RunPage {
        run_id: row.get(0)?,
        page_id: row.get(1)?,
        role: text_column(row, 2)?,
        position: row.get(3)?,
        status: text_column(row, 4)?,
        started_at: row.get(5)?,
        ended_at: row.get(6)?,
    })
}

fn row_to_case(row: &Row<'_>) -> rusqlite::Result<PageTestCase> {
    Ok(PageTestCase {
        id: row.get(0)?,
        run_id: row.get(1)?,
        page_id: row.get(2)?,
        test_case_id: row.get(3)?,
        status: text_column(row, 4)?,
        started_at: row.get(5)?,
        ended_at: row.get(6)?,
    })
}

pub(super) fn insert_run_page_row(conn: &Connection, link: &RunPage) -> Result<()> {
    conn.execute(
        &format!("INSERT INTO run_pages ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)", RUN_PAGE_COLUMNS),
        params![
            link.run_id,
            link.page_id,
            link.role.as_str(),
            link.position,
            link.status.as_str(),
            link.started_at,
            link.ended_at,
        ],
    )?;
    Ok(())
}

pub(super) fn insert_case_row(conn: &Connection, case: &PageTestCase) -> Result<()> {
    conn.execute(
        &format!("INSERT INTO page_test_cases ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)", CASE_COLUMNS),
        params![
            case.id,
            case.run_id,
            case.page_id,
            case.test_case_id,
            case.status.as_str(),
            case.started_at,
            case.ended_at,
        ],
    )?;
    Ok(())
}

impl Database {
    // ========================================================================
    // Runs
    // ========================================================================

    /// Create a run header, its page links and the page test case cross product atomically
    pub fn create_run(&self, run: &TestRun, pages: &[RunPage], cases: &[PageTestCase]) -> Result<()> {
        self.transaction(|tx| {
            tx.execute(
                &format!("INSERT INTO runs ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)", RUN_COLUMNS),
                params![
                    run.id,
                    run.environment_id,
                    run.name,
                    run.status.as_str(),
                    run.notes,
                    run.started_at,
                    run.ended_at,
                    run.created_at,
                ],
            )?;
            for link in pages {
                insert_run_page_row(tx, link)?;
            }
            for case in cases {
                insert_case_row(tx, case)?;
            }
            Ok(())
        })?;

        info!(
            "Created run {} ({} pages, {} page test cases)",
            run.id,
            pages.len(),
            cases.len()
        );
        Ok(())
    }

    pub fn get_run(&self, id: &str) -> Result<Option<TestRun>> {
        let conn = self.conn.lock();
        let run = conn
            .query_row(
                &format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS),
                params![id],
                row_to_run,
            )
            .optional()?;
        Ok(run)
    }

    /// Fetch a run or fail with `NotFound`
    pub fn require_run(&self, id: &str) -> Result<TestRun> {
        self.get_run(id)?.ok_or_else(|| Error::not_found("run", id))
    }

    pub fn list_runs(&self, environment_id: Option<&str>) -> Result<Vec<TestRun>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM runs WHERE (?1 IS NULL OR environment_id = ?1) ORDER BY created_at DESC",
            RUN_COLUMNS
        ))?;
        let rows = stmt.query_map(params![environment_id], row_to_run)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn set_run_status(&self, id: &str, status: RunStatus) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE runs SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        debug!("Run {} -> {}", id, status);
        Ok(())
    }

    /// Move to `status` and stamp the start time
    pub fn mark_run_started(&self, id: &str, status: RunStatus, at: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE runs SET status = ?1, started_at = ?2, ended_at = NULL WHERE id = ?3",
            params![status.as_str(), at, id],
        )?;
        Ok(())
    }

    /// Move to `status` and stamp the end time
    pub fn mark_run_ended(&self, id: &str, status: RunStatus, at: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE runs SET status = ?1, ended_at = ?2 WHERE id = ?3",
            params![status.as_str(), at, id],
        )?;
        Ok(())
    }

    /// Rearm a failed run for another attempt, all or nothing
    ///
    /// ERROR cases go back to IN_PROGRESS (automatic) or MANUAL (manual), every
    /// page link that did not succeed goes back to pending, and the header is
    /// moved to `status` with a fresh start time. Returns the cases reset.
    pub fn restart_run(&self, id: &str, status: RunStatus, at: i64) -> Result<usize> {
        let reset_kind = "UPDATE page_test_cases SET status = ?1, started_at = NULL, ended_at = NULL
             WHERE run_id = ?2 AND status = ?3
               AND test_case_id IN (SELECT id FROM test_cases WHERE kind = ?4)";
        self.transaction(|tx| {
            let mut reset = tx.execute(
                reset_kind,
                params![
                    TestStatus::InProgress.as_str(),
                    id,
                    TestStatus::Error.as_str(),
                    TestCaseKind::Automatic.as_str(),
                ],
            )?;
            reset += tx.execute(
                reset_kind,
                params![
                    TestStatus::Manual.as_str(),
                    id,
                    TestStatus::Error.as_str(),
                    TestCaseKind::Manual.as_str(),
                ],
            )?;
            tx.execute(
                "UPDATE run_pages SET status = ?1, started_at = NULL, ended_at = NULL
                 WHERE run_id = ?2 AND status != ?3",
                params![
                    PageRunStatus::Pending.as_str(),
                    id,
                    PageRunStatus::Success.as_str(),
                ],
            )?;
            tx.execute(
                "UPDATE runs SET status = ?1, started_at = ?2, ended_at = NULL WHERE id = ?3",
                params![status.as_str(), at, id],
            )?;
            Ok(reset)
        })
    }

    // ========================================================================
    // Run pages
    // ========================================================================

    /// Page links in stored execution order
    pub fn list_run_pages(&self, run_id: &str) -> Result<Vec<RunPage>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM run_pages WHERE run_id = ?1 ORDER BY position, role",
            RUN_PAGE_COLUMNS
        ))?;
        let rows = stmt.query_map(params![run_id], row_to_run_page)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn mark_run_page_started(&self, run_id: &str, page_id: &str, at: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE run_pages SET status = ?1, started_at = ?2, ended_at = NULL WHERE run_id = ?3 AND page_id = ?4",
            params![PageRunStatus::InProgress.as_str(), at, run_id, page_id],
        )?;
        Ok(())
    }

    pub fn mark_run_page_finished(
        &self,
        run_id: &str,
        page_id: &str,
        status: PageRunStatus,
        at: i64,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE run_pages SET status = ?1, ended_at = ?2 WHERE run_id = ?3 AND page_id = ?4",
            params![status.as_str(), at, run_id, page_id],
        )?;
        Ok(())
    }

    // ========================================================================
    // Page test cases
    // ========================================================================

    pub fn list_cases_for_page(&self, run_id: &str, page_id: &str) -> Result<Vec<PageTestCase>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM page_test_cases WHERE run_id = ?1 AND page_id = ?2 ORDER BY test_case_id",
            CASE_COLUMNS
        ))?;
        let rows = stmt.query_map(params![run_id, page_id], row_to_case)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// One page of a run's test cases, ordered by id so paging is stable
    pub fn list_cases_page(&self, run_id: &str, offset: usize, limit: usize) -> Result<Vec<PageTestCase>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM page_test_cases WHERE run_id = ?1 ORDER BY id LIMIT ?2 OFFSET ?3",
            CASE_COLUMNS
        ))?;
        let rows = stmt.query_map(params![run_id, limit as i64, offset as i64], row_to_case)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn count_cases(&self, run_id: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM page_test_cases WHERE run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn mark_cases_started(&self, run_id: &str, page_id: &str, at: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE page_test_cases SET started_at = ?1 WHERE run_id = ?2 AND page_id = ?3",
            params![at, run_id, page_id],
        )?;
        Ok(())
    }

    /// Write final statuses for a batch of page test cases
    pub fn finish_cases(&self, statuses: &[(String, TestStatus)], at: i64) -> Result<()> {
        self.transaction(|tx| {
            let mut stmt =
                tx.prepare("UPDATE page_test_cases SET status = ?1, ended_at = ?2 WHERE id = ?3")?;
            for (id, status) in statuses {
                stmt.execute(params![status.as_str(), at, id])?;
            }
            Ok(())
        })
    }

    pub fn set_case_status(&self, id: &str, status: TestStatus) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE page_test_cases SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        Ok(())
    }

    /// Turn a page's still-running test cases into ERROR, returning how many changed
    pub fn fail_in_progress_cases(&self, run_id: &str, page_id: &str, at: i64) -> Result<usize> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE page_test_cases SET status = ?1, ended_at = ?2
             WHERE run_id = ?3 AND page_id = ?4 AND status = ?5",
            params![
                TestStatus::Error.as_str(),
                at,
                run_id,
                page_id,
                TestStatus::InProgress.as_str(),
            ],
        )?;
        Ok(changed)
    }

    // ========================================================================
    // Bulk row archival
    // ========================================================================

    /// Remove a run's page links, test cases and (by cascade) targets; the header stays
    pub fn delete_run_bulk(&self, run_id: &str) -> Result<usize> {
        self.transaction(|tx| {
            tx.execute("DELETE FROM run_pages WHERE run_id = ?1", params![run_id])?;
            let cases = tx.execute("DELETE FROM page_test_cases WHERE run_id = ?1", params![run_id])?;
            Ok(cases)
        })
    }

    /// Recreate a run's bulk rows and restore its status, all or nothing
    pub fn restore_run_bulk(
        &self,
        run_id: &str,
        status: RunStatus,
        pages: &[RunPage],
        cases: &[PageTestCase],
        targets: &[Target],
    ) -> Result<()> {
        self.transaction(|tx| {
            for link in pages {
                insert_run_page_row(tx, link)?;
            }
            for case in cases {
                insert_case_row(tx, case)?;
            }
            for target in targets {
                if !insert_target_row(tx, target)? {
                    return Err(Error::AlreadyExists {
                        kind: "target".to_string(),
                        id: target.id.clone(),
                    });
                }
            }
            let updated = tx.execute(
                "UPDATE runs SET status = ?1 WHERE id = ?2",
                params![status.as_str(), run_id],
            )?;
            if updated == 0 {
                return Err(Error::not_found("run", run_id));
            }
            Ok(())
        })
    }
}
