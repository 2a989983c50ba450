//! Catalog Commands

use anyhow::{Context, Result};
use clap::Subcommand;
use lumen_common::{Catalog, TestCaseDefinition};
use lumen_engine::Lumen;
use serde::Serialize;
use std::path::PathBuf;

use crate::output::{print_list, print_success, OutputFormat, TableDisplay};

#[derive(Subcommand)]
pub enum CatalogCommands {
    /// Replace the catalog with the contents of a YAML or JSON file
    Import {
        /// Catalog file
        path: PathBuf,
    },

    /// List selected test cases
    Cases,

    /// List landmarks
    Landmarks,
}

#[derive(Serialize)]
pub struct TestCaseDisplay {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub rules: Vec<String>,
    pub selectors: Vec<String>,
}

impl From<TestCaseDefinition> for TestCaseDisplay {
    fn from(tc: TestCaseDefinition) -> Self {
        Self {
            id: tc.id,
            name: tc.name,
            kind: tc.kind.to_string(),
            rules: tc.rule_ids,
            selectors: tc.selectors,
        }
    }
}

impl TableDisplay for TestCaseDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["ID", "Name", "Kind", "Rules", "Selectors"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.id.clone(),
            self.name.clone(),
            self.kind.clone(),
            self.rules.join(", "),
            self.selectors.join(", "),
        ]
    }
}

#[derive(Serialize)]
pub struct LandmarkDisplay {
    pub id: String,
    pub name: String,
    pub selectors: Vec<String>,
}

impl TableDisplay for LandmarkDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["ID", "Name", "Matches"]
    }

    fn row(&self) -> Vec<String> {
        vec![self.id.clone(), self.name.clone(), self.selectors.join(", ")]
    }
}

/// Parse a catalog file; JSON is accepted as YAML
pub fn read_catalog(path: &std::path::Path) -> Result<Catalog> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&content).with_context(|| format!("parsing {}", path.display()))
}

pub fn execute(cmd: CatalogCommands, lumen: &Lumen, format: OutputFormat) -> Result<()> {
    match cmd {
        CatalogCommands::Import { path } => {
            let catalog = read_catalog(&path)?;
            lumen.import_catalog(&catalog)?;
            print_success(&format!(
                "Imported {} test cases, {} landmarks, {} remediations",
                catalog.test_cases.len(),
                catalog.landmarks.len(),
                catalog.remediations.len()
            ));
        }

        CatalogCommands::Cases => {
            let cases: Vec<TestCaseDisplay> = lumen
                .db()
                .list_selected_test_cases()?
                .into_iter()
                .map(TestCaseDisplay::from)
                .collect();
            print_list(&cases, format);
        }

        CatalogCommands::Landmarks => {
            let landmarks: Vec<LandmarkDisplay> = lumen
                .db()
                .list_landmarks()?
                .into_iter()
                .map(|l| LandmarkDisplay {
                    id: l.id,
                    name: l.name,
                    selectors: l.selectors,
                })
                .collect();
            print_list(&landmarks, format);
        }
    }

    Ok(())
}
