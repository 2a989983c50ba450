//! Landmark classification
//!
//! Each target on a page is either a landmark itself (its last selector
//! segment or its markup matches the catalog) or, failing that, a child of
//! the closest ancestor segment that is a landmark captured on the same page.

use crate::browser::BrowserSurface;
use crate::scripts;
use lumen_common::{Database, Landmark, Result, Target, TargetSource};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

static ROLE_IN_SEGMENT: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r#"\[role\s*=\s*["']?([^"'\]]+)["']?\]"#).ok());
static ROLE_IN_MARKUP: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r#"(?i)\brole\s*=\s*["']([^"']+)["']"#).ok());
static TAG_IN_MARKUP: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^\s*<([a-zA-Z][a-zA-Z0-9-]*)").ok());

/// Read-only lookup from tag names and roles to landmark ids
#[derive(Debug, Clone, Default)]
pub struct LandmarkCatalog {
    by_tag: HashMap<String, String>,
    by_role: HashMap<String, String>,
}

impl LandmarkCatalog {
    /// Build from catalog entries whose selectors are `tag` or `role=value`
    pub fn new(landmarks: &[Landmark]) -> Self {
        let mut catalog = Self::default();
        for landmark in landmarks {
            for selector in &landmark.selectors {
                let selector = selector.trim().to_ascii_lowercase();
                let role = selector
                    .strip_prefix("role=")
                    .map(|r| r.trim_matches(|c| c == '"' || c == '\'').to_string());
                if let Some(role) = role {
                    catalog
                        .by_role
                        .entry(role)
                        .or_insert_with(|| landmark.id.clone());
                } else if !selector.is_empty() {
                    catalog
                        .by_tag
                        .entry(selector)
                        .or_insert_with(|| landmark.id.clone());
                }
            }
        }
        catalog
    }

    pub fn load(db: &Database) -> Result<Self> {
        Ok(Self::new(&db.list_landmarks()?))
    }

    pub fn is_empty(&self) -> bool {
        self.by_tag.is_empty() && self.by_role.is_empty()
    }

    /// Landmark for one selector segment such as `nav` or `div[role="banner"]:nth-of-type(2)`
    pub fn match_segment(&self, segment: &str) -> Option<&str> {
        let role = ROLE_IN_SEGMENT
            .as_ref()
            .and_then(|re| re.captures(segment))
            .map(|c| c[1].trim().to_ascii_lowercase());
        self.lookup(&segment_tag(segment), role.as_deref())
    }

    /// Landmark for a markup snippet, by its `role` attribute or its tag
    pub fn match_markup(&self, html: &str) -> Option<&str> {
        let role = ROLE_IN_MARKUP
            .as_ref()
            .and_then(|re| re.captures(html))
            .map(|c| c[1].trim().to_ascii_lowercase());
        let tag = TAG_IN_MARKUP
            .as_ref()
            .and_then(|re| re.captures(html))
            .map(|c| c[1].to_ascii_lowercase())
            .unwrap_or_default();
        self.lookup(&tag, role.as_deref())
    }

    fn lookup(&self, tag: &str, role: Option<&str>) -> Option<&str> {
        role.and_then(|r| self.by_role.get(r))
            .or_else(|| self.by_tag.get(tag))
            .map(String::as_str)
    }
}

/// Tag name of a selector segment, lowercased
fn segment_tag(segment: &str) -> String {
    segment
        .split(|c| matches!(c, '[' | '.' | '#' | ':'))
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Split a selector on child and descendant combinators
pub fn segments(selector: &str) -> Vec<&str> {
    selector
        .split(|c: char| c == '>' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .collect()
}

/// A target as seen by the classifier
#[derive(Debug, Clone)]
pub struct Candidate {
    pub id: String,
    pub selector: String,
    pub html: String,
}

/// Column values to write for one page
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Classification {
    pub landmarks: Vec<(String, Option<String>)>,
    pub parents: Vec<(String, Option<String>)>,
}

/// Classify a page's targets against `catalog`
pub fn classify(candidates: &[Candidate], catalog: &LandmarkCatalog) -> Classification {
    let mut landmark_ids: Vec<Option<String>> = Vec::with_capacity(candidates.len());
    let mut by_selector: HashMap<String, &str> = HashMap::new();

    for candidate in candidates {
        let segs = segments(&candidate.selector);
        let landmark = segs
            .last()
            .and_then(|last| catalog.match_segment(last))
            .or_else(|| catalog.match_markup(&candidate.html))
            .map(str::to_string);
        if landmark.is_some() {
            by_selector
                .entry(segs.join(" > "))
                .or_insert(candidate.id.as_str());
        }
        landmark_ids.push(landmark);
    }

    let mut parents = Vec::with_capacity(candidates.len());
    for (candidate, landmark) in candidates.iter().zip(&landmark_ids) {
        if landmark.is_some() {
            parents.push((candidate.id.clone(), None));
            continue;
        }
        let segs = segments(&candidate.selector);
        let ancestors = &segs[..segs.len().saturating_sub(1)];
        let parent = ancestors
            .iter()
            .rposition(|seg| catalog.match_segment(seg).is_some())
            .and_then(|i| by_selector.get(&ancestors[..=i].join(" > ")))
            .filter(|id| **id != candidate.id)
            .map(|id| id.to_string());
        parents.push((candidate.id.clone(), parent));
    }

    Classification {
        landmarks: candidates
            .iter()
            .map(|c| c.id.clone())
            .zip(landmark_ids)
            .collect(),
        parents,
    }
}

/// Classifier bound to a catalog, applied page by page
#[derive(Debug, Clone)]
pub struct LandmarkClassifier {
    catalog: Arc<LandmarkCatalog>,
}

impl LandmarkClassifier {
    pub fn new(catalog: Arc<LandmarkCatalog>) -> Self {
        Self { catalog }
    }

    /// Classify every target captured for `page_id` in `run_id` and write both columns
    pub async fn classify_page(
        &self,
        db: &Database,
        surface: &dyn BrowserSurface,
        run_id: &str,
        page_id: &str,
    ) -> Result<usize> {
        let targets = db.list_targets_for_page(run_id, page_id)?;
        if targets.is_empty() || self.catalog.is_empty() {
            return Ok(0);
        }

        let candidates = candidates(surface, targets).await?;
        let classification = classify(&candidates, &self.catalog);

        db.bulk_update_column("targets", "landmark_id", &classification.landmarks)?;
        db.bulk_update_column("targets", "parent_landmark_id", &classification.parents)?;

        let landmarks = classification
            .landmarks
            .iter()
            .filter(|(_, l)| l.is_some())
            .count();
        debug!(
            "Classified {} targets on page {} ({} landmarks)",
            candidates.len(),
            page_id,
            landmarks
        );
        Ok(candidates.len())
    }
}

/// Scanner selectors are recomputed against the live page; targets that no longer resolve are skipped
async fn candidates(surface: &dyn BrowserSurface, targets: Vec<Target>) -> Result<Vec<Candidate>> {
    let (automatic, manual): (Vec<Target>, Vec<Target>) = targets
        .into_iter()
        .partition(|t| t.source == TargetSource::Automatic);

    let mut out: Vec<Candidate> = manual
        .into_iter()
        .map(|t| Candidate {
            id: t.id,
            selector: t.selector,
            html: t.html,
        })
        .collect();

    if !automatic.is_empty() {
        let selectors: Vec<String> = automatic.iter().map(|t| t.selector.clone()).collect();
        let value = surface.run(&scripts::selectors_script(&selectors)?).await?;
        let fresh: Vec<Option<String>> = serde_json::from_value(value)?;
        for (target, selector) in automatic.into_iter().zip(fresh) {
            match selector {
                Some(selector) if !selector.is_empty() => out.push(Candidate {
                    id: target.id,
                    selector,
                    html: target.html,
                }),
                _ => debug!("Target {} no longer resolves, not classified", target.id),
            }
        }
    }
    Ok(out)
}
