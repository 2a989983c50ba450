//! SQLite database for Lumen state persistence
//!
//! Tables:
//! - environments, pages: the site tree produced by crawling
//! - landmarks, remediation_categories, remediations, criteria, test_cases: static catalog
//! - runs, run_pages: environment tests and their selected pages
//! - page_test_cases, targets: bulk result rows owned by a run

mod catalog;
mod runs;
mod site;
mod targets;

pub use targets::TargetReview;

use crate::{Error, Result};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{Connection, Row, Transaction};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

/// Largest number of rows bound into a single statement
const MAX_BATCH: usize = 400;

/// Database wrapper for state persistence
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;

        // Enable WAL mode for better concurrency
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;",
        )?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        info!("Opened database at {:?}", path.as_ref());
        Ok(db)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            -- Sites under test
            CREATE TABLE IF NOT EXISTS environments (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                base_url TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            -- Page tree
            CREATE TABLE IF NOT EXISTS pages (
                id TEXT PRIMARY KEY,
                environment_id TEXT NOT NULL,
                path TEXT NOT NULL,
                name TEXT NOT NULL,
                parent_id TEXT,
                navigable INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                UNIQUE(environment_id, path),
                FOREIGN KEY(environment_id) REFERENCES environments(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_pages_env ON pages(environment_id);

            -- Catalog
            CREATE TABLE IF NOT EXISTS landmarks (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                selectors TEXT NOT NULL DEFAULT '[]'
            );

            CREATE TABLE IF NOT EXISTS remediation_categories (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS remediations (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                category_id TEXT NOT NULL,
                selectors TEXT NOT NULL DEFAULT '[]'
            );

            CREATE TABLE IF NOT EXISTS criteria (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                remediation_ids TEXT NOT NULL DEFAULT '[]'
            );

            CREATE TABLE IF NOT EXISTS test_cases (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                rule_ids TEXT NOT NULL DEFAULT '[]',
                selectors TEXT NOT NULL DEFAULT '[]',
                remediation_ids TEXT NOT NULL DEFAULT '[]',
                criteria_ids TEXT NOT NULL DEFAULT '[]',
                selected INTEGER NOT NULL DEFAULT 1
            );

            -- Environment tests
            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                environment_id TEXT NOT NULL,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                notes TEXT,
                started_at INTEGER,
                ended_at INTEGER,
                created_at INTEGER NOT NULL,
                FOREIGN KEY(environment_id) REFERENCES environments(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS run_pages (
                run_id TEXT NOT NULL,
                page_id TEXT NOT NULL,
                role TEXT NOT NULL,
                position INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                started_at INTEGER,
                ended_at INTEGER,
                PRIMARY KEY(run_id, page_id, role),
                FOREIGN KEY(run_id) REFERENCES runs(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_run_pages_run ON run_pages(run_id, position);

            -- Bulk result rows
            CREATE TABLE IF NOT EXISTS page_test_cases (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                page_id TEXT NOT NULL,
                test_case_id TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at INTEGER,
                ended_at INTEGER,
                FOREIGN KEY(run_id) REFERENCES runs(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_page_test_cases_page ON page_test_cases(run_id, page_id);

            CREATE TABLE IF NOT EXISTS targets (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                page_id TEXT NOT NULL,
                page_test_case_id TEXT NOT NULL,
                source TEXT NOT NULL,
                status TEXT NOT NULL,
                rule_id TEXT NOT NULL,
                selector TEXT NOT NULL,
                html TEXT NOT NULL,
                failure_summary TEXT,
                notes TEXT,
                remediation_id TEXT,
                landmark_id TEXT,
                parent_landmark_id TEXT,
                occurrence_key TEXT NOT NULL,
                status_occurrences INTEGER NOT NULL DEFAULT 1,
                remediation_occurrences INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                UNIQUE(page_test_case_id, rule_id, selector),
                FOREIGN KEY(page_test_case_id) REFERENCES page_test_cases(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_targets_page ON targets(run_id, page_id);
            CREATE INDEX IF NOT EXISTS idx_targets_occurrence ON targets(run_id, occurrence_key);
            CREATE INDEX IF NOT EXISTS idx_targets_status ON targets(run_id, status);
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    /// Run `f` inside a single transaction; any error rolls everything back
    pub fn transaction<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Set one column for many rows with a single `CASE` update per batch
    pub fn bulk_update_column(
        &self,
        table: &str,
        column: &str,
        values: &[(String, Option<String>)],
    ) -> Result<usize> {
        if values.is_empty() {
            return Ok(0);
        }

        self.transaction(|tx| {
            let mut updated = 0;
            for chunk in values.chunks(MAX_BATCH) {
                let mut sql = format!("UPDATE {} SET {} = CASE id", table, column);
                let mut args: Vec<&dyn rusqlite::ToSql> = Vec::with_capacity(chunk.len() * 3);
                for (id, value) in chunk {
                    sql.push_str(" WHEN ? THEN ?");
                    args.push(id);
                    args.push(value);
                }
                sql.push_str(&format!(" ELSE {} END WHERE id IN (", column));
                sql.push_str(&vec!["?"; chunk.len()].join(", "));
                sql.push(')');
                for (id, _) in chunk {
                    args.push(id);
                }
                updated += tx.execute(&sql, args.as_slice())?;
            }
            debug!("Bulk updated {}.{} on {} rows", table, column, updated);
            Ok(updated)
        })
    }
}

// ============================================================================
// Row helpers
// ============================================================================

/// Read a TEXT column into an enum with a `FromStr` text form
pub(crate) fn text_column<T: FromStr<Err = String>>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            Box::new(Error::Internal(e)),
        )
    })
}

/// Read a JSON-encoded string list column
pub(crate) fn list_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Vec<String>> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn to_json_list(items: &[String]) -> Result<String> {
    Ok(serde_json::to_string(items)?)
}

/// `?, ?, ?` placeholder list for an IN clause
pub(crate) fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}


#[cfg(test)]
mod tests {
    use super::fixtures;
    use super::*;
    use crate::types::TestStatus;

    #[test]
    fn bulk_update_sets_only_listed_rows() {
        let db = Database::open_memory().unwrap();
        let (env, pages) = fixtures::site(&db);
        let (_run, cases) = fixtures::run(&db, &env, &pages);
        let a = fixtures::target(&cases[0], "html > body > nav", TestStatus::Fail);
        let b = fixtures::target(&cases[0], "html > body > main", TestStatus::Fail);
        db.insert_targets(&[a.clone(), b.clone()]).unwrap();

        let updated = db
            .bulk_update_column(
                "targets",
                "landmark_id",
                &[(a.id.clone(), Some("LANDMARK_NAV".into()))],
            )
            .unwrap();
        assert_eq!(updated, 1);

        assert_eq!(
            db.get_target(&a.id).unwrap().unwrap().landmark_id.as_deref(),
            Some("LANDMARK_NAV")
        );
        assert_eq!(db.get_target(&b.id).unwrap().unwrap().landmark_id, None);
    }

    #[test]
    fn failed_transaction_rolls_back() {
        let db = Database::open_memory().unwrap();
        let (env, pages) = fixtures::site(&db);
        let (run, _cases) = fixtures::run(&db, &env, &pages);

        let result: Result<()> = db.transaction(|tx| {
            tx.execute("DELETE FROM page_test_cases WHERE run_id = ?1", [&run.id])?;
            Err(Error::Internal("boom".into()))
        });
        assert!(result.is_err());
        assert_eq!(db.count_cases(&run.id).unwrap(), 3);
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        let env_id = {
            let db = Database::open(&path).unwrap();
            let (env, _) = fixtures::site(&db);
            env.id
        };

        let db = Database::open(&path).unwrap();
        assert!(db.get_environment(&env_id).unwrap().is_some());
        assert_eq!(db.list_pages(&env_id).unwrap().len(), 3);
    }
}
