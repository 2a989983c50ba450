//! Environments and the page tree

use super::Database;
use crate::types::{Environment, Page};
use crate::Result;
use rusqlite::{params, OptionalExtension, Row};
use tracing::debug;

const PAGE_COLUMNS: &str = "id, environment_id, path, name, parent_id, navigable, created_at";

fn row_to_page(row: &Row<'_>) -> rusqlite::Result<Page> {
    Ok(Page {
        id: row.get(0)?,
        environment_id: row.get(1)?,
        path: row.get(2)?,
        name: row.get(3)?,
        parent_id: row.get(4)?,
        navigable: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn row_to_environment(row: &Row<'_>) -> rusqlite::Result<Environment> {
    Ok(Environment {
        id: row.get(0)?,
        name: row.get(1)?,
        base_url: row.get(2)?,
        created_at: row.get(3)?,
    })
}

impl Database {
    // ========================================================================
    // Environments
    // ========================================================================

    pub fn insert_environment(&self, env: &Environment) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO environments (id, name, base_url, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![env.id, env.name, env.base_url, env.created_at],
        )?;
        debug!("Inserted environment {} ({})", env.name, env.id);
        Ok(())
    }

    pub fn get_environment(&self, id: &str) -> Result<Option<Environment>> {
        let conn = self.conn.lock();
        let env = conn
            .query_row(
                "SELECT id, name, base_url, created_at FROM environments WHERE id = ?1",
                params![id],
                row_to_environment,
            )
            .optional()?;
        Ok(env)
    }

    pub fn environment_name_exists(&self, name: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM environments WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn list_environments(&self) -> Result<Vec<Environment>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, name, base_url, created_at FROM environments ORDER BY created_at, name",
        )?;
        let rows = stmt.query_map([], row_to_environment)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ========================================================================
    // Pages
    // ========================================================================

    pub fn insert_page(&self, page: &Page) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            &format!("INSERT INTO pages ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)", PAGE_COLUMNS),
            params![
                page.id,
                page.environment_id,
                page.path,
                page.name,
                page.parent_id,
                page.navigable,
                page.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_page(&self, id: &str) -> Result<Option<Page>> {
        let conn = self.conn.lock();
        let page = conn
            .query_row(
                &format!("SELECT {} FROM pages WHERE id = ?1", PAGE_COLUMNS),
                params![id],
                row_to_page,
            )
            .optional()?;
        Ok(page)
    }

    /// Pages of an environment in insertion order, which is crawl depth order
    pub fn list_pages(&self, environment_id: &str) -> Result<Vec<Page>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM pages WHERE environment_id = ?1 ORDER BY created_at, rowid",
            PAGE_COLUMNS
        ))?;
        let rows = stmt.query_map(params![environment_id], row_to_page)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Only the parent pointer of a page may change after creation
    pub fn set_page_parent(&self, id: &str, parent_id: Option<&str>) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE pages SET parent_id = ?1 WHERE id = ?2",
            params![parent_id, id],
        )?;
        Ok(())
    }
}
