//! Target Review Commands

use anyhow::Result;
use clap::Subcommand;
use lumen_common::{Target, TestStatus};
use lumen_engine::{Lumen, TargetUpdate};
use serde::Serialize;

use crate::output::{
    colored_run_status, colored_test_status, print_list, print_success, short_id, OutputFormat,
    TableDisplay,
};

#[derive(Subcommand)]
pub enum TargetCommands {
    /// List a test's targets
    List {
        /// Test ID
        run_id: String,

        /// Only targets on this page
        #[arg(long)]
        page: Option<String>,

        /// Only targets still awaiting a decision
        #[arg(long)]
        pending: bool,
    },

    /// Record a reviewer decision
    Update {
        /// Target ID
        id: String,

        /// New status (PASS, FAIL, NOT_APPLICABLE, MANUAL, ...)
        #[arg(short, long)]
        status: Option<String>,

        /// Reviewer notes
        #[arg(short, long)]
        notes: Option<String>,

        /// Remediation ID
        #[arg(short, long)]
        remediation: Option<String>,

        /// Apply to every occurrence of the same element issue in the test
        #[arg(long)]
        all: bool,
    },
}

#[derive(Serialize)]
pub struct TargetDisplay {
    pub id: String,
    pub page_id: String,
    pub rule_id: String,
    pub status: TestStatus,
    pub selector: String,
    pub remediation_id: Option<String>,
    pub landmark_id: Option<String>,
    pub parent_landmark_id: Option<String>,
    pub occurrences: i64,
}

impl From<Target> for TargetDisplay {
    fn from(t: Target) -> Self {
        Self {
            id: t.id,
            page_id: t.page_id,
            rule_id: t.rule_id,
            status: t.status,
            selector: t.selector,
            remediation_id: t.remediation_id,
            landmark_id: t.landmark_id,
            parent_landmark_id: t.parent_landmark_id,
            occurrences: t.status_occurrences,
        }
    }
}

impl TableDisplay for TargetDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["ID", "Page", "Rule", "Status", "Selector", "Remediation", "Landmark", "Same"]
    }

    fn row(&self) -> Vec<String> {
        let landmark = match (&self.landmark_id, &self.parent_landmark_id) {
            (Some(l), _) => l.clone(),
            (None, Some(parent)) => format!("in {}", short_id(parent)),
            (None, None) => "-".to_string(),
        };
        vec![
            self.id.clone(),
            short_id(&self.page_id).to_string(),
            self.rule_id.clone(),
            colored_test_status(self.status),
            self.selector.clone(),
            self.remediation_id.clone().unwrap_or_else(|| "-".to_string()),
            landmark,
            self.occurrences.to_string(),
        ]
    }
}

pub fn execute(cmd: TargetCommands, lumen: &Lumen, format: OutputFormat) -> Result<()> {
    match cmd {
        TargetCommands::List {
            run_id,
            page,
            pending,
        } => {
            lumen.db().require_run(&run_id)?;
            let targets = match page {
                Some(page_id) => lumen.db().list_targets_for_page(&run_id, &page_id)?,
                None => lumen.db().list_targets(&run_id)?,
            };
            let displays: Vec<TargetDisplay> = targets
                .into_iter()
                .filter(|t| !pending || t.status.needs_review())
                .map(TargetDisplay::from)
                .collect();
            print_list(&displays, format);
        }

        TargetCommands::Update {
            id,
            status,
            notes,
            remediation,
            all,
        } => {
            let outcome = lumen.update_target(
                &id,
                TargetUpdate {
                    status,
                    notes,
                    remediation_id: remediation,
                    propagate: all,
                },
            )?;
            print_success(&format!(
                "Updated {} target(s); test is {}",
                outcome.targets.len(),
                colored_run_status(outcome.run_status)
            ));
            let displays: Vec<TargetDisplay> =
                outcome.targets.into_iter().map(TargetDisplay::from).collect();
            print_list(&displays, format);
        }
    }

    Ok(())
}
