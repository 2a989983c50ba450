//! Static catalog: landmarks, remediations, criteria and test cases

use super::{list_column, placeholders, text_column, to_json_list, Database};
use crate::types::{
    Catalog, Criterion, Landmark, Remediation, RemediationCategory, TestCaseDefinition,
};
use crate::Result;
use rusqlite::{params, params_from_iter, OptionalExtension, Row};
use std::collections::HashMap;
use tracing::info;

const TEST_CASE_COLUMNS: &str =
    "id, name, kind, rule_ids, selectors, remediation_ids, criteria_ids, selected";

fn row_to_test_case(row: &Row<'_>) -> rusqlite::Result<TestCaseDefinition> {
    Ok(TestCaseDefinition {
        id: row.get(0)?,
        name: row.get(1)?,
        kind: text_column(row, 2)?,
        rule_ids: list_column(row, 3)?,
        selectors: list_column(row, 4)?,
        remediation_ids: list_column(row, 5)?,
        criteria_ids: list_column(row, 6)?,
        selected: row.get(7)?,
    })
}

fn row_to_remediation(row: &Row<'_>) -> rusqlite::Result<Remediation> {
    Ok(Remediation {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        category_id: row.get(3)?,
        selectors: list_column(row, 4)?,
    })
}

impl Database {
    /// Replace the whole catalog in one transaction; entries absent from `catalog` are dropped
    pub fn import_catalog(&self, catalog: &Catalog) -> Result<()> {
        self.transaction(|tx| {
            tx.execute_batch(
                "DELETE FROM test_cases;
                 DELETE FROM criteria;
                 DELETE FROM remediations;
                 DELETE FROM remediation_categories;
                 DELETE FROM landmarks;",
            )?;
            for l in &catalog.landmarks {
                tx.execute(
                    "INSERT OR REPLACE INTO landmarks (id, name, selectors) VALUES (?1, ?2, ?3)",
                    params![l.id, l.name, to_json_list(&l.selectors)?],
                )?;
            }
            for c in &catalog.categories {
                tx.execute(
                    "INSERT OR REPLACE INTO remediation_categories (id, name, priority) VALUES (?1, ?2, ?3)",
                    params![c.id, c.name, c.priority],
                )?;
            }
            for r in &catalog.remediations {
                tx.execute(
                    "INSERT OR REPLACE INTO remediations (id, name, description, category_id, selectors)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![r.id, r.name, r.description, r.category_id, to_json_list(&r.selectors)?],
                )?;
            }
            for c in &catalog.criteria {
                tx.execute(
                    "INSERT OR REPLACE INTO criteria (id, name, remediation_ids) VALUES (?1, ?2, ?3)",
                    params![c.id, c.name, to_json_list(&c.remediation_ids)?],
                )?;
            }
            for t in &catalog.test_cases {
                tx.execute(
                    &format!(
                        "INSERT OR REPLACE INTO test_cases ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                        TEST_CASE_COLUMNS
                    ),
                    params![
                        t.id,
                        t.name,
                        t.kind.as_str(),
                        to_json_list(&t.rule_ids)?,
                        to_json_list(&t.selectors)?,
                        to_json_list(&t.remediation_ids)?,
                        to_json_list(&t.criteria_ids)?,
                        t.selected,
                    ],
                )?;
            }
            Ok(())
        })?;

        info!(
            "Imported catalog: {} landmarks, {} remediations, {} test cases",
            catalog.landmarks.len(),
            catalog.remediations.len(),
            catalog.test_cases.len()
        );
        Ok(())
    }

    pub fn list_landmarks(&self) -> Result<Vec<Landmark>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id, name, selectors FROM landmarks ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok(Landmark {
                id: row.get(0)?,
                name: row.get(1)?,
                selectors: list_column(row, 2)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Catalog test cases currently selected for new runs
    pub fn list_selected_test_cases(&self) -> Result<Vec<TestCaseDefinition>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM test_cases WHERE selected = 1 ORDER BY id",
            TEST_CASE_COLUMNS
        ))?;
        let rows = stmt.query_map([], row_to_test_case)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn get_test_cases(&self, ids: &[String]) -> Result<Vec<TestCaseDefinition>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM test_cases WHERE id IN ({})",
            TEST_CASE_COLUMNS,
            placeholders(ids.len())
        ))?;
        let rows = stmt.query_map(params_from_iter(ids.iter()), row_to_test_case)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn get_remediation(&self, id: &str) -> Result<Option<Remediation>> {
        let conn = self.conn.lock();
        let remediation = conn
            .query_row(
                "SELECT id, name, description, category_id, selectors FROM remediations WHERE id = ?1",
                params![id],
                row_to_remediation,
            )
            .optional()?;
        Ok(remediation)
    }

    pub fn get_remediations(&self, ids: &[String]) -> Result<Vec<Remediation>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT id, name, description, category_id, selectors FROM remediations WHERE id IN ({}) ORDER BY id",
            placeholders(ids.len())
        ))?;
        let rows = stmt.query_map(params_from_iter(ids.iter()), row_to_remediation)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn get_criteria(&self, ids: &[String]) -> Result<Vec<Criterion>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT id, name, remediation_ids FROM criteria WHERE id IN ({}) ORDER BY id",
            placeholders(ids.len())
        ))?;
        let rows = stmt.query_map(params_from_iter(ids.iter()), |row| {
            Ok(Criterion {
                id: row.get(0)?,
                name: row.get(1)?,
                remediation_ids: list_column(row, 2)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Category priority keyed by category id
    pub fn category_priorities(&self) -> Result<HashMap<String, i64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id, priority FROM remediation_categories")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        Ok(rows.collect::<rusqlite::Result<HashMap<_, _>>>()?)
    }

    pub fn list_categories(&self) -> Result<Vec<RemediationCategory>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT id, name, priority FROM remediation_categories ORDER BY priority DESC")?;
        let rows = stmt.query_map([], |row| {
            Ok(RemediationCategory {
                id: row.get(0)?,
                name: row.get(1)?,
                priority: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TestCaseKind;

    fn catalog() -> Catalog {
        Catalog {
            landmarks: vec![Landmark {
                id: "LANDMARK_NAV".into(),
                name: "Navigation".into(),
                selectors: vec!["nav".into(), "role=navigation".into()],
            }],
            categories: vec![RemediationCategory {
                id: "cat-high".into(),
                name: "High".into(),
                priority: 10,
            }],
            remediations: vec![Remediation {
                id: "rem-alt".into(),
                name: "Add alt text".into(),
                description: String::new(),
                category_id: "cat-high".into(),
                selectors: vec!["img".into()],
            }],
            criteria: vec![Criterion {
                id: "1.1.1".into(),
                name: "Non-text content".into(),
                remediation_ids: vec!["rem-alt".into()],
            }],
            test_cases: vec![
                TestCaseDefinition {
                    id: "tc-alt".into(),
                    name: "Images have alt text".into(),
                    kind: TestCaseKind::Automatic,
                    rule_ids: vec!["image-alt".into()],
                    selectors: vec!["img".into()],
                    remediation_ids: vec![],
                    criteria_ids: vec!["1.1.1".into()],
                    selected: true,
                },
                TestCaseDefinition {
                    id: "tc-off".into(),
                    name: "Unselected".into(),
                    kind: TestCaseKind::Manual,
                    rule_ids: vec![],
                    selectors: vec![],
                    remediation_ids: vec![],
                    criteria_ids: vec![],
                    selected: false,
                },
            ],
        }
    }

    #[test]
    fn import_is_repeatable() {
        let db = Database::open_memory().unwrap();
        db.import_catalog(&catalog()).unwrap();
        db.import_catalog(&catalog()).unwrap();

        assert_eq!(db.list_landmarks().unwrap().len(), 1);
        let selected = db.list_selected_test_cases().unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].rule_ids, vec!["image-alt".to_string()]);

        let criteria = db.get_criteria(&["1.1.1".into()]).unwrap();
        assert_eq!(criteria[0].remediation_ids, vec!["rem-alt".to_string()]);
        assert_eq!(db.category_priorities().unwrap()["cat-high"], 10);
        assert!(db.get_remediation("rem-alt").unwrap().is_some());
    }

    #[test]
    fn reimport_drops_entries_missing_from_the_new_catalog() {
        let db = Database::open_memory().unwrap();
        db.import_catalog(&catalog()).unwrap();

        let mut next = catalog();
        next.landmarks.clear();
        next.remediations.clear();
        next.criteria.clear();
        next.test_cases = vec![TestCaseDefinition {
            id: "tc-new".into(),
            name: "Headings are nested".into(),
            kind: TestCaseKind::Automatic,
            rule_ids: vec!["heading-order".into()],
            selectors: vec![],
            remediation_ids: vec![],
            criteria_ids: vec![],
            selected: true,
        }];
        db.import_catalog(&next).unwrap();

        let selected: Vec<String> = db
            .list_selected_test_cases()
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(selected, vec!["tc-new".to_string()]);
        assert!(db.list_landmarks().unwrap().is_empty());
        assert!(db.get_remediation("rem-alt").unwrap().is_none());
        assert!(db.get_criteria(&["1.1.1".into()]).unwrap().is_empty());
        assert!(db.get_test_cases(&["tc-off".into()]).unwrap().is_empty());
    }
}
