//! Site discovery
//!
//! A sitemap is preferred: robots.txt `Sitemap:` lines, then a
//! `<link rel="sitemap">` hint on the seed page, then `/sitemap.xml`. Without
//! one, anchors are followed through a browser surface up to a depth budget,
//! all inside one wall-clock budget. A crawl never returns an empty list.

use crate::browser::{BrowserSurface, SurfaceFactory};
use crate::config::CrawlerConfig;
use crate::scripts;
use async_trait::async_trait;
use lumen_common::{Error, FieldError, Result};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

static ROBOTS_SITEMAP: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?im)^\s*sitemap\s*:\s*(\S+)").ok());
static LINK_TAG: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"(?is)<link\b[^>]*>").ok());
static REL_SITEMAP: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r#"(?i)\brel\s*=\s*["']?sitemap["']?"#).ok());
static HREF_ATTR: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r#"(?i)\bhref\s*=\s*["']([^"']+)["']"#).ok());
static LOC: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"(?is)<loc>\s*(.*?)\s*</loc>").ok());

/// Plain HTTP GET used for robots and sitemap documents
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Body of a successful response; `None` for any non-success status
    async fn fetch(&self, url: &str) -> Result<Option<String>>;
}

/// Fetcher backed by a shared reqwest client
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: &CrawlerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Option<String>> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Http(format!("{}: {}", url, e)))?;
        if !resp.status().is_success() {
            debug!("GET {} returned {}", url, resp.status());
            return Ok(None);
        }
        let body = resp
            .text()
            .await
            .map_err(|e| Error::Http(format!("{}: {}", url, e)))?;
        Ok(Some(body))
    }
}

/// Crawler over one seed at a time
pub struct Crawler {
    config: CrawlerConfig,
    fetcher: Arc<dyn Fetcher>,
    surfaces: Arc<dyn SurfaceFactory>,
}

impl Crawler {
    pub fn new(
        config: CrawlerConfig,
        fetcher: Arc<dyn Fetcher>,
        surfaces: Arc<dyn SurfaceFactory>,
    ) -> Self {
        Self {
            config,
            fetcher,
            surfaces,
        }
    }

    /// Discover same-domain page URLs under `seed`, shallowest first
    pub async fn crawl(&self, seed: &str) -> Result<Vec<String>> {
        let seed_url = parse_seed(seed)?;
        let seed_norm = normalize(&seed_url).unwrap_or_else(|| seed.to_string());
        let domain = bare_host(&seed_url);

        if let Some(sitemap) = self.find_sitemap(&seed_url).await {
            let urls = self.read_sitemap(&sitemap, &domain).await;
            if !urls.is_empty() {
                info!("Crawl of {} used sitemap {} ({} pages)", seed, sitemap, urls.len());
                return Ok(depth_sorted(urls));
            }
            warn!("Sitemap {} listed no pages on {}, following links", sitemap, domain);
        }

        let found = Arc::new(Mutex::new(vec![seed_norm.clone()]));
        let budget = Duration::from_secs(self.config.timeout_secs);
        let traversal = self.traverse(seed_norm.clone(), domain.clone(), found.clone());
        if tokio::time::timeout(budget, traversal).await.is_err() {
            warn!(
                "Crawl of {} exceeded {}s, keeping {} pages found so far",
                seed,
                budget.as_secs(),
                found.lock().len()
            );
        }

        let urls = found.lock().clone();
        info!("Crawl of {} followed links ({} pages)", seed, urls.len());
        Ok(depth_sorted(urls))
    }

    async fn find_sitemap(&self, seed: &Url) -> Option<String> {
        let mut candidates = Vec::new();

        if let Ok(robots) = seed.join("/robots.txt") {
            if let Some(body) = self.fetch_quietly(robots.as_str()).await {
                candidates.extend(robots_sitemaps(&body));
            }
        }
        if let Some(body) = self.fetch_quietly(seed.as_str()).await {
            candidates.extend(link_hint(&body).and_then(|href| seed.join(&href).ok()).map(String::from));
        }
        if let Ok(conventional) = seed.join("/sitemap.xml") {
            candidates.push(conventional.to_string());
        }

        for candidate in candidates {
            if self.fetch_quietly(&candidate).await.is_some() {
                debug!("Sitemap reachable at {}", candidate);
                return Some(candidate);
            }
        }
        None
    }

    /// `<loc>` entries of a sitemap, following one level of sitemap index
    async fn read_sitemap(&self, sitemap: &str, domain: &str) -> Vec<String> {
        let Some(body) = self.fetch_quietly(sitemap).await else {
            return Vec::new();
        };

        let mut locs = sitemap_locs(&body);
        if is_sitemap_index(&body) {
            let mut pages = Vec::new();
            for child in locs {
                if let Some(child_body) = self.fetch_quietly(&child).await {
                    pages.extend(sitemap_locs(&child_body));
                }
            }
            locs = pages;
        }

        let mut seen = HashSet::new();
        locs.into_iter()
            .filter_map(|loc| Url::parse(&loc).ok())
            .filter(|url| bare_host(url) == domain && !self.is_excluded(url))
            .filter_map(|url| normalize(&url))
            .filter(|url| seen.insert(url.clone()))
            .collect()
    }

    async fn fetch_quietly(&self, url: &str) -> Option<String> {
        match self.fetcher.fetch(url).await {
            Ok(body) => body,
            Err(e) => {
                debug!("Fetch failed: {}", e);
                None
            }
        }
    }

    /// Follow anchors from `seed`; every new URL is pushed to `found` as soon as it is seen
    async fn traverse(&self, seed: String, domain: String, found: Arc<Mutex<Vec<String>>>) {
        let mut surface = match self.surfaces.create().await {
            Ok(surface) => surface,
            Err(e) => {
                warn!("No browser surface for crawl: {}", e);
                return;
            }
        };

        let mut seen: HashSet<String> = HashSet::from([seed.clone()]);
        let mut frontier = VecDeque::from([(seed, 0usize)]);

        while let Some((url, depth)) = frontier.pop_front() {
            let hrefs = match visit(surface.as_ref(), &url).await {
                Ok(hrefs) => hrefs,
                Err(e) => {
                    warn!("Crawl could not load {}: {}", url, e);
                    let _ = surface.close().await;
                    match self.surfaces.create().await {
                        Ok(fresh) => surface = fresh,
                        Err(e) => {
                            warn!("Browser surface could not be recreated: {}", e);
                            return;
                        }
                    }
                    continue;
                }
            };

            if depth >= self.config.max_depth {
                continue;
            }
            for href in hrefs {
                let Ok(link) = Url::parse(&href) else { continue };
                if bare_host(&link) != domain || self.is_excluded(&link) {
                    continue;
                }
                let Some(norm) = normalize(&link) else { continue };
                if seen.insert(norm.clone()) {
                    found.lock().push(norm.clone());
                    if depth + 1 < self.config.max_depth {
                        frontier.push_back((norm, depth + 1));
                    }
                }
            }
        }

        let _ = surface.close().await;
    }

    fn is_excluded(&self, url: &Url) -> bool {
        let host = bare_host(url);
        let excluded_host = self
            .config
            .excluded_domains
            .iter()
            .any(|d| host == *d || host.ends_with(&format!(".{}", d)));
        if excluded_host {
            return true;
        }

        let last = url.path().rsplit('/').next().unwrap_or_default();
        match last.rsplit_once('.') {
            Some((_, ext)) => self
                .config
                .excluded_extensions
                .iter()
                .any(|e| e.eq_ignore_ascii_case(ext)),
            None => false,
        }
    }
}

async fn visit(surface: &dyn BrowserSurface, url: &str) -> Result<Vec<String>> {
    surface.navigate(url).await?;
    let value = surface.run(scripts::ANCHORS).await?;
    Ok(serde_json::from_value(value)?)
}

fn parse_seed(seed: &str) -> Result<Url> {
    let invalid = |message: &str| Error::Validation(vec![FieldError::new("seed", message)]);
    let url = Url::parse(seed.trim()).map_err(|_| invalid("not a valid URL"))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(invalid("must be an http(s) URL with a host"));
    }
    Ok(url)
}

/// Host without a leading `www.`, lowercased
pub fn bare_host(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
    host.strip_prefix("www.").map(str::to_string).unwrap_or(host)
}

/// Canonical form used for de-duplication: no `www.`, query, fragment or trailing slash
pub fn normalize(url: &Url) -> Option<String> {
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    let host = bare_host(url);
    if host.is_empty() {
        return None;
    }
    let port = url.port().map(|p| format!(":{}", p)).unwrap_or_default();
    let path = url.path().trim_end_matches('/');
    let path = if path.is_empty() { "/" } else { path };
    Some(format!("{}://{}{}{}", url.scheme(), host, port, path))
}

/// Number of non-empty path segments
pub fn path_depth(url: &str) -> usize {
    Url::parse(url)
        .map(|u| u.path().split('/').filter(|s| !s.is_empty()).count())
        .unwrap_or(usize::MAX)
}

/// Stable sort by path depth, shallow first
pub fn depth_sorted(mut urls: Vec<String>) -> Vec<String> {
    urls.sort_by_key(|u| path_depth(u));
    urls
}

fn robots_sitemaps(body: &str) -> Vec<String> {
    let Some(re) = ROBOTS_SITEMAP.as_ref() else {
        return Vec::new();
    };
    re.captures_iter(body).map(|c| c[1].to_string()).collect()
}

fn link_hint(html: &str) -> Option<String> {
    let (tags, rel, href) = (LINK_TAG.as_ref()?, REL_SITEMAP.as_ref()?, HREF_ATTR.as_ref()?);
    tags.find_iter(html)
        .map(|m| m.as_str())
        .filter(|tag| rel.is_match(tag))
        .find_map(|tag| href.captures(tag).map(|c| c[1].to_string()))
}

fn sitemap_locs(xml: &str) -> Vec<String> {
    let Some(re) = LOC.as_ref() else {
        return Vec::new();
    };
    re.captures_iter(xml)
        .map(|c| xml_unescape(&c[1]))
        .filter(|loc| !loc.is_empty())
        .collect()
}

fn is_sitemap_index(xml: &str) -> bool {
    xml.contains("<sitemapindex")
}

fn xml_unescape(text: &str) -> String {
    text.trim()
        .trim_start_matches("<![CDATA[")
        .trim_end_matches("]]>")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
