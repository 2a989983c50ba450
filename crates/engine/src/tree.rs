//! Page tree merge
//!
//! Crawl output becomes `Page` rows. Every URL path is a navigable page;
//! missing ancestors are filled in as structural pages so the tree has no
//! gaps, and parents always point at the longest existing path prefix.

use crate::crawler::{bare_host, path_depth};
use lumen_common::{new_id, now, Database, Environment, Error, FieldError, Page, Result};
use std::collections::HashMap;
use tracing::{debug, info, warn};
use url::Url;

/// Merge `urls` into the environment's page tree, returning the pages created
pub fn merge_crawl(db: &Database, env: &Environment, urls: &[String]) -> Result<Vec<Page>> {
    let base = Url::parse(&env.base_url).map_err(|_| {
        Error::Validation(vec![FieldError::new("base_url", "not a valid URL")])
    })?;
    let domain = bare_host(&base);

    let mut ordered: Vec<&String> = urls.iter().collect();
    ordered.sort_by_key(|u| path_depth(u));

    let mut by_path: HashMap<String, Page> = db
        .list_pages(&env.id)?
        .into_iter()
        .map(|p| (p.path.clone(), p))
        .collect();
    let mut created = Vec::new();

    for raw in ordered {
        let Ok(url) = Url::parse(raw) else {
            warn!("Skipping unparseable URL {}", raw);
            continue;
        };
        if bare_host(&url) != domain {
            warn!("Skipping {} outside {}", raw, domain);
            continue;
        }

        let path = page_path(&url);
        let mut lineage = ancestors(&path);
        lineage.push(path.clone());

        for (i, step) in lineage.iter().enumerate() {
            if by_path.contains_key(step) {
                continue;
            }
            let navigable = i + 1 == lineage.len();
            let page = Page {
                id: new_id(),
                environment_id: env.id.clone(),
                path: step.clone(),
                name: page_name(step, &domain),
                parent_id: parent_of(step, &by_path),
                navigable,
                created_at: now(),
            };
            db.insert_page(&page)?;
            debug!("Added page {} (navigable={})", page.path, navigable);
            by_path.insert(step.clone(), page.clone());
            created.push(page);
        }
    }

    let relinked = backfill_parents(db, &mut by_path)?;
    info!(
        "Merged {} URLs into {}: {} pages created, {} parents backfilled",
        urls.len(),
        env.name,
        created.len(),
        relinked
    );
    Ok(created)
}

/// Point orphaned pages at their longest existing path prefix
fn backfill_parents(db: &Database, by_path: &mut HashMap<String, Page>) -> Result<usize> {
    let orphans: Vec<String> = by_path
        .values()
        .filter(|p| p.parent_id.is_none() && p.path != "/")
        .map(|p| p.path.clone())
        .collect();

    let mut relinked = 0;
    for path in orphans {
        let Some(parent_id) = parent_of(&path, by_path) else {
            continue;
        };
        if let Some(page) = by_path.get_mut(&path) {
            db.set_page_parent(&page.id, Some(&parent_id))?;
            page.parent_id = Some(parent_id);
            relinked += 1;
        }
    }
    Ok(relinked)
}

fn parent_of(path: &str, by_path: &HashMap<String, Page>) -> Option<String> {
    ancestors(path)
        .iter()
        .rev()
        .find_map(|a| by_path.get(a))
        .map(|p| p.id.clone())
}

/// Proper ancestor paths, root first: `/a/b/c` -> `/`, `/a`, `/a/b`
fn ancestors(path: &str) -> Vec<String> {
    if path == "/" {
        return Vec::new();
    }
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let mut out = vec!["/".to_string()];
    for i in 1..segments.len() {
        out.push(format!("/{}", segments[..i].join("/")));
    }
    out
}

fn page_path(url: &Url) -> String {
    let path = url.path().trim_end_matches('/');
    if path.is_empty() {
        "/".to_string()
    } else {
        path.to_string()
    }
}

fn page_name(path: &str, domain: &str) -> String {
    path.rsplit('/')
        .find(|s| !s.is_empty())
        .unwrap_or(domain)
        .to_string()
}
