//! Page test executor
//!
//! Drives one run through its pages strictly in stored order on a single
//! browser surface. Each page step races the page timeout; a page that
//! errors or times out is marked ERROR and the run moves on.

use crate::aggregator::{aggregate, RemediationIndex, ScanResult};
use crate::browser::{BrowserSurface, SurfaceFactory};
use crate::events::{EventBus, Outcome, RunEvent};
use crate::landmark::LandmarkClassifier;
use crate::lifecycle::Lifecycle;
use crate::occurrence;
use crate::scripts::{self, CaptureRequest, CaptureResult, ScriptBundle};
use lumen_common::{
    new_id, now, Database, Error, Page, PageRunStatus, PageTestCase, Result, RunStatus, Target,
    TargetSource, TestCaseDefinition, TestCaseKind, TestStatus,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Rule id recorded on targets captured for manual test cases
pub const MANUAL_RULE_ID: &str = "manual";

/// Selector recorded when the capture script cannot describe an element
const ROOT_SELECTOR: &str = "html";

#[derive(Clone)]
pub struct PageExecutor {
    db: Database,
    surfaces: Arc<dyn SurfaceFactory>,
    scripts: ScriptBundle,
    landmarks: LandmarkClassifier,
    lifecycle: Lifecycle,
    events: EventBus,
    page_timeout: Duration,
}

/// Per-run context shared by every page step
struct RunContext {
    run_id: String,
    base_url: String,
    definitions: HashMap<String, TestCaseDefinition>,
    remediations: RemediationIndex,
}

impl PageExecutor {
    pub fn new(
        db: Database,
        surfaces: Arc<dyn SurfaceFactory>,
        scripts: ScriptBundle,
        landmarks: LandmarkClassifier,
        lifecycle: Lifecycle,
        events: EventBus,
        page_timeout: Duration,
    ) -> Self {
        Self {
            db,
            surfaces,
            scripts,
            landmarks,
            lifecycle,
            events,
            page_timeout,
        }
    }

    /// Execute every page of `run_id`, then settle the run's terminal status
    pub async fn run(&self, run_id: &str) -> Result<RunStatus> {
        let run = self.db.require_run(run_id)?;
        let env = self
            .db
            .get_environment(&run.environment_id)?
            .ok_or_else(|| Error::not_found("environment", &run.environment_id))?;

        let mut page_ids = Vec::new();
        let mut seen = HashSet::new();
        for link in self.db.list_run_pages(run_id)? {
            if seen.insert(link.page_id.clone()) {
                page_ids.push(link.page_id);
            }
        }

        let ctx = self.context(run_id, &env.base_url)?;
        info!("Executing run {} over {} pages", run_id, page_ids.len());

        let mut surface: Option<Arc<dyn BrowserSurface>> = None;
        let mut errored = 0;
        for page_id in &page_ids {
            let outcome = self.page(&ctx, page_id, &mut surface).await;
            if let Err(message) = outcome {
                errored += 1;
                self.publish_page(run_id, page_id, Outcome::Error, Some(message));
            } else {
                self.publish_page(run_id, page_id, Outcome::Success, None);
            }
        }

        if let Some(surface) = surface.take() {
            if let Err(e) = surface.close().await {
                debug!("Surface close: {}", e);
            }
        }

        let status = self.lifecycle.finish(run_id, page_ids.len(), errored)?;
        self.events.publish(RunEvent::Run {
            run_id: run_id.to_string(),
            outcome: if status == RunStatus::Failed {
                Outcome::Error
            } else {
                Outcome::Success
            },
            status,
        });
        Ok(status)
    }

    fn context(&self, run_id: &str, base_url: &str) -> Result<RunContext> {
        let mut test_case_ids = HashSet::new();
        let total = self.db.count_cases(run_id)?;
        let mut offset = 0;
        while offset < total {
            let batch = self.db.list_cases_page(run_id, offset, 1000)?;
            if batch.is_empty() {
                break;
            }
            offset += batch.len();
            test_case_ids.extend(batch.into_iter().map(|c| c.test_case_id));
        }

        let ids: Vec<String> = test_case_ids.into_iter().collect();
        let definitions = self.db.get_test_cases(&ids)?;
        let remediations = RemediationIndex::load(&self.db, &definitions)?;
        Ok(RunContext {
            run_id: run_id.to_string(),
            base_url: base_url.to_string(),
            definitions: definitions.into_iter().map(|d| (d.id.clone(), d)).collect(),
            remediations,
        })
    }

    /// One guarded page step; `Err` carries the reason the page was marked ERROR
    async fn page(
        &self,
        ctx: &RunContext,
        page_id: &str,
        surface: &mut Option<Arc<dyn BrowserSurface>>,
    ) -> std::result::Result<(), String> {
        let run_id = ctx.run_id.as_str();
        let started = now();
        let marked = self
            .db
            .mark_run_page_started(run_id, page_id, started)
            .and_then(|_| self.db.mark_cases_started(run_id, page_id, started));
        if let Err(e) = marked {
            return Err(self.page_failed(run_id, page_id, e.to_string()));
        }

        let page = match self.db.get_page(page_id) {
            Ok(Some(page)) => page,
            Ok(None) => return Err(self.page_failed(run_id, page_id, "page no longer exists".into())),
            Err(e) => return Err(self.page_failed(run_id, page_id, e.to_string())),
        };

        let current = match surface.clone() {
            Some(s) => s,
            None => match self.surfaces.create().await {
                Ok(s) => {
                    *surface = Some(s.clone());
                    s
                }
                Err(e) => {
                    return Err(self.page_failed(run_id, page_id, format!("no browser surface: {}", e)));
                }
            },
        };

        let step = self.page_step(ctx, &page, current.as_ref());
        match tokio::time::timeout(self.page_timeout, step).await {
            Ok(Ok(())) => {
                if let Err(e) =
                    self.db
                        .mark_run_page_finished(run_id, page_id, PageRunStatus::Success, now())
                {
                    return Err(self.page_failed(run_id, page_id, e.to_string()));
                }
                info!("Page {} done", page.path);
                Ok(())
            }
            Ok(Err(e)) => {
                if matches!(e, Error::Browser(_)) {
                    self.discard(surface).await;
                }
                Err(self.page_failed(run_id, page_id, e.to_string()))
            }
            Err(_) => {
                // The surface may still be busy with the abandoned page
                self.discard(surface).await;
                let message = format!("timed out after {}s", self.page_timeout.as_secs());
                Err(self.page_failed(run_id, page_id, message))
            }
        }
    }

    async fn discard(&self, surface: &mut Option<Arc<dyn BrowserSurface>>) {
        if let Some(old) = surface.take() {
            if let Err(e) = old.close().await {
                debug!("Discarded surface close: {}", e);
            }
        }
    }

    /// Mark the page and its still-running test cases ERROR; returns the message
    fn page_failed(&self, run_id: &str, page_id: &str, message: String) -> String {
        warn!("Page {} of run {} errored: {}", page_id, run_id, message);
        let at = now();
        if let Err(e) = self.db.fail_in_progress_cases(run_id, page_id, at) {
            warn!("Could not fail test cases of page {}: {}", page_id, e);
        }
        if let Err(e) = self
            .db
            .mark_run_page_finished(run_id, page_id, PageRunStatus::Error, at)
        {
            warn!("Could not mark page {} errored: {}", page_id, e);
        }
        message
    }

    fn publish_page(&self, run_id: &str, page_id: &str, outcome: Outcome, message: Option<String>) {
        self.events.publish(RunEvent::Page {
            run_id: run_id.to_string(),
            page_id: page_id.to_string(),
            outcome,
            message,
        });
    }

    async fn page_step(&self, ctx: &RunContext, page: &Page, surface: &dyn BrowserSurface) -> Result<()> {
        let run_id = ctx.run_id.as_str();
        surface.navigate(&page.full_url(&ctx.base_url)).await?;
        for script in self.scripts.injections() {
            surface.run(script).await?;
        }

        let cases = self.db.list_cases_for_page(run_id, &page.id)?;
        let mut manual = Vec::new();
        let mut automatic = Vec::new();
        for case in cases {
            let Some(definition) = ctx.definitions.get(&case.test_case_id) else {
                debug!("Test case {} missing from catalog", case.test_case_id);
                continue;
            };
            match (case.status, definition.kind) {
                (TestStatus::Manual, _) => manual.push((case, definition.clone())),
                (TestStatus::InProgress, TestCaseKind::Automatic) => {
                    automatic.push((case, definition.clone()))
                }
                _ => {}
            }
        }

        let (manual_targets, scan) = tokio::join!(
            capture_manual(surface, &manual),
            scan_page(surface, self.scripts.scan(), !automatic.is_empty()),
        );
        let mut targets = manual_targets?;
        let outcome = aggregate(&scan?, &automatic, &ctx.remediations);
        targets.extend(outcome.targets);

        let inserted = self.db.insert_targets(&targets)?;
        self.db.finish_cases(&outcome.statuses, now())?;
        debug!(
            "Page {}: {} targets ({} new), {} automatic cases settled",
            page.path,
            targets.len(),
            inserted,
            outcome.statuses.len()
        );

        self.landmarks
            .classify_page(&self.db, surface, run_id, &page.id)
            .await?;

        let keys: Vec<String> = targets.iter().map(|t| t.occurrence_key.clone()).collect();
        occurrence::refresh(&self.db, run_id, &keys)?;
        Ok(())
    }
}

async fn scan_page(surface: &dyn BrowserSurface, script: &str, needed: bool) -> Result<ScanResult> {
    if !needed {
        return Ok(ScanResult::default());
    }
    let value = surface.run(script).await?;
    serde_json::from_value(value).map_err(|e| Error::Scanner(format!("unexpected scan result: {}", e)))
}

/// Resolve each manual case's selectors and build one MANUAL target per distinct element
async fn capture_manual(
    surface: &dyn BrowserSurface,
    cases: &[(PageTestCase, TestCaseDefinition)],
) -> Result<Vec<Target>> {
    if cases.is_empty() {
        return Ok(Vec::new());
    }

    let requests: Vec<CaptureRequest> = cases
        .iter()
        .map(|(case, definition)| CaptureRequest {
            case_id: case.id.clone(),
            selectors: definition.selectors.clone(),
        })
        .collect();
    let value = surface.run(&scripts::capture_script(&requests)?).await?;
    let results: Vec<CaptureResult> = serde_json::from_value(value)?;

    let by_id: HashMap<&str, &PageTestCase> = cases.iter().map(|(c, _)| (c.id.as_str(), c)).collect();
    let mut targets = Vec::new();
    for result in results {
        let Some(case) = by_id.get(result.case_id.as_str()) else {
            continue;
        };
        let mut seen = HashSet::new();
        for element in result.targets {
            if !seen.insert(element.markup.clone()) {
                continue;
            }
            targets.push(Target {
                id: new_id(),
                run_id: case.run_id.clone(),
                page_id: case.page_id.clone(),
                page_test_case_id: case.id.clone(),
                source: TargetSource::Manual,
                status: TestStatus::Manual,
                rule_id: MANUAL_RULE_ID.to_string(),
                selector: element.selector.unwrap_or_else(|| ROOT_SELECTOR.to_string()),
                occurrence_key: Target::occurrence_key(&case.test_case_id, &element.markup),
                html: element.markup,
                failure_summary: None,
                notes: None,
                remediation_id: None,
                landmark_id: None,
                parent_landmark_id: None,
                status_occurrences: 1,
                remediation_occurrences: 1,
                created_at: now(),
            });
        }
    }
    Ok(targets)
}
