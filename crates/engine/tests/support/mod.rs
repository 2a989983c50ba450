//! Scripted browser, fetcher and store shared by the engine integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use lumen_common::*;
use lumen_engine::scripts::ScriptKind;
use lumen_engine::{BrowserSurface, Fetcher, Lumen, LumenConfig, ScriptBundle, SurfaceFactory};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use url::Url;

pub const BASE_URL: &str = "https://example.com";

/// How one path behaves when loaded in a fake surface
#[derive(Debug, Clone, Default)]
pub struct FakePage {
    /// Value returned by the scan script
    pub scan: Value,
    /// CSS selector -> elements (unique selector, markup) returned by the capture script
    pub elements: HashMap<String, Vec<(String, String)>>,
    pub links: Vec<String>,
    /// Navigation never completes
    pub hang: bool,
}

impl FakePage {
    pub fn scanning(scan: Value) -> Self {
        Self {
            scan,
            ..Default::default()
        }
    }

    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Default)]
pub struct FakeSite {
    pages: HashMap<String, FakePage>,
}

impl FakeSite {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(mut self, path: &str, page: FakePage) -> Self {
        self.pages.insert(path.to_string(), page);
        self
    }
}

pub struct FakeSurface {
    site: Arc<FakeSite>,
    current: Mutex<Option<FakePage>>,
}

#[async_trait]
impl BrowserSurface for FakeSurface {
    async fn navigate(&self, url: &str) -> Result<()> {
        let parsed = Url::parse(url).map_err(|e| Error::Browser(e.to_string()))?;
        let Some(page) = self.site.pages.get(parsed.path()).cloned() else {
            return Err(Error::Browser(format!("404 {}", url)));
        };
        if page.hang {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        *self.current.lock() = Some(page);
        Ok(())
    }

    async fn run(&self, script: &str) -> Result<Value> {
        let page = self
            .current
            .lock()
            .clone()
            .ok_or_else(|| Error::Browser("nothing loaded".into()))?;
        let value = match ScriptKind::of(script) {
            ScriptKind::Helpers | ScriptKind::Scanner => Value::Null,
            ScriptKind::Scan if page.scan.is_null() => scan(vec![], vec![], vec![]),
            ScriptKind::Scan => page.scan.clone(),
            ScriptKind::Anchors => json!(page.links),
            ScriptKind::Selectors => {
                let selectors: Vec<String> = embedded(script, "const selectors = ")?;
                json!(selectors.into_iter().map(Some).collect::<Vec<_>>())
            }
            ScriptKind::Capture => {
                let requests: Vec<Value> = embedded(script, "const requests = ")?;
                let results: Vec<Value> = requests
                    .iter()
                    .map(|req| {
                        let mut targets = Vec::new();
                        for sel in req["selectors"].as_array().into_iter().flatten() {
                            let found = sel.as_str().and_then(|s| page.elements.get(s));
                            match found {
                                Some(elements) => targets.extend(
                                    elements
                                        .iter()
                                        .map(|(s, m)| json!({ "selector": s, "markup": m })),
                                ),
                                None => targets.push(json!({ "selector": "html", "markup": "<html>" })),
                            }
                        }
                        json!({ "case_id": req["case_id"], "targets": targets })
                    })
                    .collect();
                json!(results)
            }
        };
        Ok(value)
    }

    async fn capture(&self) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }
}

/// JSON literal assigned on the line starting with `prefix`
fn embedded<T: serde::de::DeserializeOwned>(script: &str, prefix: &str) -> Result<T> {
    let line = script
        .lines()
        .find_map(|l| l.strip_prefix(prefix))
        .ok_or_else(|| Error::Scanner(format!("no {} in script", prefix.trim())))?;
    Ok(serde_json::from_str(line.trim_end().trim_end_matches(';'))?)
}

pub struct FakeFactory {
    site: Mutex<Arc<FakeSite>>,
    pub created: AtomicUsize,
}

impl FakeFactory {
    pub fn new(site: FakeSite) -> Self {
        Self {
            site: Mutex::new(Arc::new(site)),
            created: AtomicUsize::new(0),
        }
    }

    /// Surfaces created from now on load pages from `site`
    pub fn serve(&self, site: FakeSite) {
        *self.site.lock() = Arc::new(site);
    }
}

#[async_trait]
impl SurfaceFactory for FakeFactory {
    async fn create(&self) -> Result<Arc<dyn BrowserSurface>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeSurface {
            site: self.site.lock().clone(),
            current: Mutex::new(None),
        }))
    }
}

#[derive(Debug, Default)]
pub struct MapFetcher {
    bodies: HashMap<String, String>,
}

impl MapFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn body(mut self, url: &str, body: &str) -> Self {
        self.bodies.insert(url.to_string(), body.to_string());
        self
    }
}

#[async_trait]
impl Fetcher for MapFetcher {
    async fn fetch(&self, url: &str) -> Result<Option<String>> {
        Ok(self.bodies.get(url).cloned())
    }
}

// ============================================================================
// Catalog and scan builders
// ============================================================================

pub fn automatic(id: &str, rule_ids: &[&str], remediation_ids: &[&str]) -> TestCaseDefinition {
    TestCaseDefinition {
        id: id.into(),
        name: id.into(),
        kind: TestCaseKind::Automatic,
        rule_ids: rule_ids.iter().map(|s| s.to_string()).collect(),
        selectors: Vec::new(),
        remediation_ids: remediation_ids.iter().map(|s| s.to_string()).collect(),
        criteria_ids: Vec::new(),
        selected: true,
    }
}

pub fn manual(id: &str, selectors: &[&str]) -> TestCaseDefinition {
    TestCaseDefinition {
        id: id.into(),
        name: id.into(),
        kind: TestCaseKind::Manual,
        rule_ids: Vec::new(),
        selectors: selectors.iter().map(|s| s.to_string()).collect(),
        remediation_ids: Vec::new(),
        criteria_ids: Vec::new(),
        selected: true,
    }
}

/// Landmarks, one remediation category and the given test cases
pub fn catalog(test_cases: Vec<TestCaseDefinition>) -> Catalog {
    Catalog {
        landmarks: vec![
            Landmark {
                id: "LANDMARK_NAV".into(),
                name: "Navigation".into(),
                selectors: vec!["nav".into(), "role=navigation".into()],
            },
            Landmark {
                id: "LANDMARK_MAIN".into(),
                name: "Main".into(),
                selectors: vec!["main".into(), "role=main".into()],
            },
        ],
        categories: vec![RemediationCategory {
            id: "cat-content".into(),
            name: "Content".into(),
            priority: 1,
        }],
        remediations: vec![Remediation {
            id: "rem-alt".into(),
            name: "Describe images".into(),
            description: "Give informative images a text alternative".into(),
            category_id: "cat-content".into(),
            selectors: vec!["img".into()],
        }],
        criteria: Vec::new(),
        test_cases,
    }
}

/// Automatic-only catalog: image alternatives and link names
pub fn default_catalog() -> Catalog {
    catalog(vec![
        automatic("tc-alt", &["image-alt"], &["rem-alt"]),
        automatic("tc-links", &["link-name"], &[]),
    ])
}

/// A scan rule whose nodes are the given full selectors
pub fn rule(rule_id: &str, selectors: &[&str]) -> Value {
    let nodes: Vec<Value> = selectors
        .iter()
        .map(|sel| {
            json!({
                "selector": [sel],
                "markup": markup_for(sel),
                "failure_summary": format!("Fix {}", rule_id),
            })
        })
        .collect();
    json!({ "rule_id": rule_id, "nodes": nodes })
}

/// Markup standing in for the element at the end of `selector`
pub fn markup_for(selector: &str) -> String {
    let last = selector.rsplit('>').next().unwrap_or(selector).trim();
    let tag = last.split(|c| matches!(c, '[' | ':' | '.')).next().unwrap_or("div");
    format!("<{} data-at=\"{}\">", tag, selector)
}

pub fn scan(violations: Vec<Value>, incomplete: Vec<Value>, passes: Vec<Value>) -> Value {
    json!({
        "violations": violations,
        "incomplete": incomplete,
        "inapplicable": [],
        "passes": passes,
    })
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub lumen: Lumen,
    pub env: Environment,
    /// Scheme, host and port of the environment base URL
    pub origin: String,
    pub surfaces: Arc<FakeFactory>,
    pub dir: TempDir,
}

impl Harness {
    pub fn new(site: FakeSite) -> Self {
        Self::with_catalog(site, default_catalog())
    }

    pub fn with_catalog(site: FakeSite, catalog: Catalog) -> Self {
        Self::build(site, MapFetcher::new(), catalog)
    }

    pub fn build(site: FakeSite, fetcher: MapFetcher, catalog: Catalog) -> Self {
        Self::build_at(site, fetcher, catalog, BASE_URL)
    }

    pub fn build_at(site: FakeSite, fetcher: MapFetcher, catalog: Catalog, base_url: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = LumenConfig::default();
        config.store_path = dir.path().to_path_buf();
        config.executor.page_timeout_secs = 1;
        config.crawler.timeout_secs = 5;

        let db = Database::open(config.db_path()).unwrap();
        let surfaces = Arc::new(FakeFactory::new(site));
        let lumen = Lumen::with_parts(config, db, surfaces.clone(), Arc::new(fetcher))
            .with_scanner(ScriptBundle::from_source("/* scanner */", &[]).unwrap());
        lumen.import_catalog(&catalog).unwrap();
        let env = lumen.add_environment("shop", base_url).unwrap();
        let origin = Url::parse(base_url).unwrap().origin().ascii_serialization();

        Self {
            lumen,
            env,
            origin,
            surfaces,
            dir,
        }
    }

    /// Merge `paths` into the page tree and return the created pages by path
    pub fn pages(&self, paths: &[&str]) -> HashMap<String, Page> {
        let urls: Vec<String> = paths.iter().map(|p| format!("{}{}", self.origin, p)).collect();
        self.lumen.merge_crawl(&self.env.id, &urls).unwrap();
        self.lumen
            .db()
            .list_pages(&self.env.id)
            .unwrap()
            .into_iter()
            .map(|p| (p.path.clone(), p))
            .collect()
    }

    /// Create a run over `paths` as structured pages, in that order
    pub fn create_run(&self, paths: &[&str]) -> TestRun {
        let pages = self.pages(paths);
        let ids = paths.iter().map(|p| pages[*p].id.clone()).collect();
        self.lumen
            .create_test(lumen_engine::NewTest {
                environment_id: self.env.id.clone(),
                name: "release check".into(),
                structured_page_ids: ids,
                random_count: 0,
                notes: None,
            })
            .unwrap()
    }

    /// Create and execute a run, returning its terminal status
    pub async fn execute(&self, paths: &[&str]) -> (TestRun, RunStatus) {
        let run = self.create_run(paths);
        let status = self
            .lumen
            .start_test(&run.id)
            .unwrap()
            .await
            .unwrap()
            .unwrap();
        (run, status)
    }

    pub fn cases_by_page(&self, run_id: &str, page_path: &str) -> Vec<PageTestCase> {
        let pages = self.pages(&[]);
        self.lumen
            .db()
            .list_cases_for_page(run_id, &pages[page_path].id)
            .unwrap()
    }
}
