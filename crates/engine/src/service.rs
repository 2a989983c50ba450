//! Engine facade
//!
//! Entry points used by the CLI and by any other presentation layer:
//! environments, crawling, catalog import, test creation, execution,
//! close/reopen and target review.

use crate::archive::Archiver;
use crate::browser::{PlaywrightFactory, SurfaceFactory};
use crate::config::LumenConfig;
use crate::crawler::{Crawler, Fetcher, HttpFetcher};
use crate::events::{EventBus, Outcome, RunEvent};
use crate::executor::PageExecutor;
use crate::landmark::{LandmarkCatalog, LandmarkClassifier};
use crate::lifecycle::Lifecycle;
use crate::occurrence;
use crate::scripts::ScriptBundle;
use crate::tree;
use lumen_common::{
    new_id, now, Catalog, Database, Environment, Error, Page, PageRole, PageRunStatus,
    PageTestCase, Result, RunPage, RunStatus, Target, TargetReview, TestCaseKind, TestRun,
    TestStatus, Validator,
};
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;
use url::Url;

const MAX_NAME_LEN: usize = 200;
const MAX_NOTES_LEN: usize = 10_000;

/// Input for a new environment test
#[derive(Debug, Clone, Default)]
pub struct NewTest {
    pub environment_id: String,
    pub name: String,
    pub structured_page_ids: Vec<String>,
    pub random_count: usize,
    pub notes: Option<String>,
}

/// A reviewer decision on one target
#[derive(Debug, Clone, Default)]
pub struct TargetUpdate {
    /// Status text such as `PASS` or `FAIL`
    pub status: Option<String>,
    pub notes: Option<String>,
    pub remediation_id: Option<String>,
    /// Apply the decision to every occurrence of the same element issue
    pub propagate: bool,
}

#[derive(Debug, Clone)]
pub struct TargetUpdateOutcome {
    pub targets: Vec<Target>,
    pub run_status: RunStatus,
}

#[derive(Clone)]
pub struct Lumen {
    config: LumenConfig,
    db: Database,
    surfaces: Arc<dyn SurfaceFactory>,
    fetcher: Arc<dyn Fetcher>,
    scanner: Option<ScriptBundle>,
    landmarks: Arc<RwLock<Option<Arc<LandmarkCatalog>>>>,
    lifecycle: Lifecycle,
    events: EventBus,
}

impl Lumen {
    /// Open the store named by `config` with the Playwright surface and HTTP fetcher
    pub fn open(config: LumenConfig) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.store_path)?;
        let db = Database::open(config.db_path())?;
        let surfaces = Arc::new(PlaywrightFactory::new(config.browser.clone()));
        let fetcher = Arc::new(HttpFetcher::new(&config.crawler)?);
        Ok(Self::with_parts(config, db, surfaces, fetcher))
    }

    pub fn with_parts(
        config: LumenConfig,
        db: Database,
        surfaces: Arc<dyn SurfaceFactory>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        let archiver = Archiver::new(db.clone(), config.archive_dir(), config.archive.page_size);
        Self {
            lifecycle: Lifecycle::new(db.clone(), archiver),
            config,
            db,
            surfaces,
            fetcher,
            scanner: None,
            landmarks: Arc::new(RwLock::new(None)),
            events: EventBus::default(),
        }
    }

    /// Use `bundle` instead of reading `scanner.script_path`
    pub fn with_scanner(mut self, bundle: ScriptBundle) -> Self {
        self.scanner = Some(bundle);
        self
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn config(&self) -> &LumenConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    // ========================================================================
    // Site
    // ========================================================================

    pub fn add_environment(&self, name: &str, base_url: &str) -> Result<Environment> {
        let name = name.trim();
        let mut v = Validator::new();
        v.check(!name.is_empty(), "name", "must not be empty")
            .check(name.len() <= MAX_NAME_LEN, "name", "too long");
        match Url::parse(base_url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") && url.host_str().is_some() => {}
            _ => {
                v.push("base_url", "must be an http(s) URL with a host");
            }
        }
        if !name.is_empty() && self.db.environment_name_exists(name)? {
            v.push("name", "already exists");
        }
        v.finish()?;

        let env = Environment {
            id: new_id(),
            name: name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            created_at: now(),
        };
        self.db.insert_environment(&env)?;
        info!("Added environment {} ({})", env.name, env.base_url);
        Ok(env)
    }

    pub fn require_environment(&self, id: &str) -> Result<Environment> {
        self.db
            .get_environment(id)?
            .ok_or_else(|| Error::not_found("environment", id))
    }

    /// Discover page URLs under `seed`
    pub async fn crawl(&self, seed: &str) -> Result<Vec<String>> {
        Crawler::new(self.config.crawler.clone(), self.fetcher.clone(), self.surfaces.clone())
            .crawl(seed)
            .await
    }

    /// Crawl the environment's base URL and merge the result into its page tree
    pub async fn crawl_environment(&self, environment_id: &str) -> Result<Vec<Page>> {
        let env = self.require_environment(environment_id)?;
        let urls = self.crawl(&env.base_url).await?;
        self.merge_crawl(environment_id, &urls)
    }

    pub fn merge_crawl(&self, environment_id: &str, urls: &[String]) -> Result<Vec<Page>> {
        let env = self.require_environment(environment_id)?;
        tree::merge_crawl(&self.db, &env, urls)
    }

    // ========================================================================
    // Catalog
    // ========================================================================

    pub fn import_catalog(&self, catalog: &Catalog) -> Result<()> {
        let mut v = Validator::new();
        let mut ids = HashSet::new();
        for tc in &catalog.test_cases {
            if !ids.insert(tc.id.as_str()) {
                v.push("test_cases", format!("duplicate id {}", tc.id));
            }
            if tc.kind == TestCaseKind::Automatic && tc.rule_ids.is_empty() {
                v.push("test_cases", format!("{} is automatic but lists no rule_ids", tc.id));
            }
        }
        let categories: HashSet<&str> = catalog.categories.iter().map(|c| c.id.as_str()).collect();
        for r in &catalog.remediations {
            if !categories.contains(r.category_id.as_str()) {
                v.push(
                    "remediations",
                    format!("{} references unknown category {}", r.id, r.category_id),
                );
            }
        }
        v.finish()?;

        self.db.import_catalog(catalog)?;
        // Next run rebuilds the landmark lookup
        *self.landmarks.write() = None;
        Ok(())
    }

    fn landmark_catalog(&self) -> Result<Arc<LandmarkCatalog>> {
        if let Some(catalog) = self.landmarks.read().as_ref() {
            return Ok(catalog.clone());
        }
        let catalog = Arc::new(LandmarkCatalog::load(&self.db)?);
        *self.landmarks.write() = Some(catalog.clone());
        Ok(catalog)
    }

    // ========================================================================
    // Environment tests
    // ========================================================================

    /// Create a run over structured plus randomly sampled pages
    pub fn create_test(&self, req: NewTest) -> Result<TestRun> {
        let name = req.name.trim();
        let mut v = Validator::new();
        v.check(!name.is_empty(), "name", "must not be empty")
            .check(name.len() <= MAX_NAME_LEN, "name", "too long")
            .check(
                req.notes.as_ref().map_or(true, |n| n.len() <= MAX_NOTES_LEN),
                "notes",
                "too long",
            );

        let env = self.db.get_environment(&req.environment_id)?;
        let pages = match &env {
            Some(env) => self.db.list_pages(&env.id)?,
            None => {
                v.push("environment_id", "unknown environment");
                Vec::new()
            }
        };

        let mut structured: Vec<&Page> = Vec::new();
        let mut chosen = HashSet::new();
        for id in &req.structured_page_ids {
            match pages.iter().find(|p| &p.id == id) {
                Some(page) if !page.navigable => {
                    v.push("structured_page_ids", format!("{} is not navigable", id));
                }
                Some(page) => {
                    if chosen.insert(page.id.as_str()) {
                        structured.push(page);
                    } else {
                        v.push("structured_page_ids", format!("{} listed twice", id));
                    }
                }
                None => {
                    v.push("structured_page_ids", format!("{} is not a page of this environment", id));
                }
            }
        }

        let pool: Vec<&Page> = pages
            .iter()
            .filter(|p| p.navigable && !chosen.contains(p.id.as_str()))
            .collect();
        if req.random_count > pool.len() {
            v.push(
                "random_count",
                format!("only {} pages are available for sampling", pool.len()),
            );
        }
        if env.is_some() && structured.is_empty() && req.random_count == 0 {
            v.push("structured_page_ids", "a test needs at least one page");
        }

        let definitions = self.db.list_selected_test_cases()?;
        if definitions.is_empty() {
            v.push("test_cases", "no test cases are selected in the catalog");
        }
        v.finish()?;

        let random: Vec<&Page> = pool
            .choose_multiple(&mut rand::thread_rng(), req.random_count)
            .copied()
            .collect();

        let run = TestRun {
            id: new_id(),
            environment_id: req.environment_id.clone(),
            name: name.to_string(),
            status: RunStatus::Opened,
            notes: req.notes.clone(),
            started_at: None,
            ended_at: None,
            created_at: now(),
        };

        let links: Vec<RunPage> = structured
            .iter()
            .map(|p| (p, PageRole::Structured))
            .chain(random.iter().map(|p| (p, PageRole::Random)))
            .enumerate()
            .map(|(position, (page, role))| RunPage {
                run_id: run.id.clone(),
                page_id: page.id.clone(),
                role,
                position: position as i64,
                status: PageRunStatus::Pending,
                started_at: None,
                ended_at: None,
            })
            .collect();

        let cases: Vec<PageTestCase> = links
            .iter()
            .flat_map(|link| {
                definitions.iter().map(|d| PageTestCase {
                    id: new_id(),
                    run_id: run.id.clone(),
                    page_id: link.page_id.clone(),
                    test_case_id: d.id.clone(),
                    status: match d.kind {
                        TestCaseKind::Automatic => TestStatus::InProgress,
                        TestCaseKind::Manual => TestStatus::Manual,
                    },
                    started_at: None,
                    ended_at: None,
                })
            })
            .collect();

        self.db.create_run(&run, &links, &cases)?;
        Ok(run)
    }

    /// Move the run to IN_PROGRESS and execute it in the background
    pub fn start_test(&self, run_id: &str) -> Result<JoinHandle<Result<RunStatus>>> {
        let scripts = match &self.scanner {
            Some(bundle) => bundle.clone(),
            None => ScriptBundle::load(&self.config.scanner)?,
        };
        let classifier = LandmarkClassifier::new(self.landmark_catalog()?);
        self.lifecycle.start(run_id)?;

        let executor = PageExecutor::new(
            self.db.clone(),
            self.surfaces.clone(),
            scripts,
            classifier,
            self.lifecycle.clone(),
            self.events.clone(),
            self.config.page_timeout(),
        );
        let lifecycle = self.lifecycle.clone();
        let events = self.events.clone();
        let run_id = run_id.to_string();
        Ok(tokio::spawn(async move {
            let result = executor.run(&run_id).await;
            if let Err(e) = &result {
                if let Err(settle) = lifecycle.abort(&run_id, &e.to_string()) {
                    tracing::error!("Run {} could not be marked failed: {}", run_id, settle);
                }
                events.publish(RunEvent::Run {
                    run_id: run_id.clone(),
                    outcome: Outcome::Error,
                    status: RunStatus::Failed,
                });
            }
            result
        }))
    }

    pub fn close_test(&self, run_id: &str) -> Result<TestRun> {
        self.lifecycle.close(run_id)
    }

    pub fn reopen_test(&self, run_id: &str) -> Result<TestRun> {
        self.lifecycle.reopen(run_id)
    }

    pub fn is_archived(&self, run_id: &str) -> Result<bool> {
        self.lifecycle.archiver().is_archived(run_id)
    }

    // ========================================================================
    // Review
    // ========================================================================

    /// Apply a reviewer decision and re-evaluate the run
    pub fn update_target(&self, target_id: &str, update: TargetUpdate) -> Result<TargetUpdateOutcome> {
        let mut v = Validator::new();
        let status = match update.status.as_deref() {
            None => None,
            Some(text) => match text.trim().to_ascii_uppercase().parse::<TestStatus>() {
                Ok(TestStatus::InProgress) => {
                    v.push("status", "IN_PROGRESS is reserved for execution");
                    None
                }
                Ok(status) => Some(status),
                Err(e) => {
                    v.push("status", e);
                    None
                }
            },
        };
        if let Some(notes) = &update.notes {
            v.check(notes.len() <= MAX_NOTES_LEN, "notes", "too long");
        }
        if let Some(id) = &update.remediation_id {
            if self.db.get_remediation(id)?.is_none() {
                v.push("remediation_id", format!("unknown remediation {}", id));
            }
        }
        v.check(
            update.status.is_some() || update.notes.is_some() || update.remediation_id.is_some(),
            "update",
            "nothing to change",
        );
        v.finish()?;

        let target = self
            .db
            .get_target(target_id)?
            .ok_or_else(|| Error::not_found("target", target_id))?;

        let ids: Vec<String> = if update.propagate {
            self.db
                .list_occurrences(&target.run_id, &[target.occurrence_key.clone()])?
                .into_iter()
                .map(|t| t.id)
                .collect()
        } else {
            vec![target.id.clone()]
        };

        let review = TargetReview {
            status,
            notes: update.notes,
            remediation_id: update.remediation_id,
        };
        self.db.review_targets(&ids, &review)?;
        occurrence::refresh(&self.db, &target.run_id, &[target.occurrence_key.clone()])?;
        let run_status = self.lifecycle.on_target_updated(&target.run_id)?;

        let mut targets = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Some(t) = self.db.get_target(id)? {
                targets.push(t);
            }
        }
        info!(
            "Reviewed {} target(s) of run {}; run is {}",
            targets.len(),
            target.run_id,
            run_status
        );
        Ok(TargetUpdateOutcome { targets, run_status })
    }
}
