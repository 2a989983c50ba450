//! Engine configuration

use lumen_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration, loaded from `config.toml`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LumenConfig {
    /// Store directory path
    pub store_path: PathBuf,

    /// Site discovery configuration
    pub crawler: CrawlerConfig,

    /// Page execution configuration
    pub executor: ExecutorConfig,

    /// Browser surface configuration
    pub browser: BrowserConfig,

    /// Accessibility scanner configuration
    pub scanner: ScannerConfig,

    /// Snapshot archival configuration
    pub archive: ArchiveConfig,
}

impl Default for LumenConfig {
    fn default() -> Self {
        Self {
            store_path: lumen_common::default_store_path(),
            crawler: CrawlerConfig::default(),
            executor: ExecutorConfig::default(),
            browser: BrowserConfig::default(),
            scanner: ScannerConfig::default(),
            archive: ArchiveConfig::default(),
        }
    }
}

/// Crawler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlerConfig {
    /// Maximum link depth followed from the seed
    pub max_depth: usize,

    /// Wall-clock budget for the whole traversal
    pub timeout_secs: u64,

    /// Per-request timeout for robots and sitemap fetches
    pub request_timeout_secs: u64,

    /// Third-party hosts never traversed
    pub excluded_domains: Vec<String>,

    /// Resource extensions that are not documents
    pub excluded_extensions: Vec<String>,

    pub user_agent: String,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            max_depth: 3,
            timeout_secs: 60,
            request_timeout_secs: 10,
            excluded_domains: [
                "facebook.com",
                "twitter.com",
                "x.com",
                "instagram.com",
                "linkedin.com",
                "youtube.com",
                "google.com",
                "googletagmanager.com",
                "doubleclick.net",
                "pinterest.com",
                "tiktok.com",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            excluded_extensions: [
                "pdf", "jpg", "jpeg", "png", "gif", "svg", "webp", "ico", "css", "js", "json",
                "xml", "zip", "gz", "mp3", "mp4", "avi", "mov", "doc", "docx", "xls", "xlsx",
                "ppt", "pptx", "woff", "woff2", "ttf",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            user_agent: format!("lumen/{}", lumen_common::VERSION),
        }
    }
}

/// Page executor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Budget for one page step: load, inject, scan, classify
    pub page_timeout_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self { page_timeout_secs: 30 }
    }
}

/// Browser configuration for the Playwright surface
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    /// Node.js binary used to host the Playwright driver
    pub node_binary: String,

    /// `NODE_PATH` pointing at a `node_modules` that contains playwright
    pub node_path: Option<PathBuf>,

    /// chromium, firefox or webkit
    pub browser: String,

    pub headless: bool,
    pub viewport_width: u32,
    pub viewport_height: u32,

    /// Navigation timeout passed to Playwright itself
    pub navigation_timeout_ms: u64,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            node_binary: "node".to_string(),
            node_path: None,
            browser: "chromium".to_string(),
            headless: true,
            viewport_width: 1280,
            viewport_height: 720,
            navigation_timeout_ms: 25_000,
        }
    }
}

/// Scanner configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Path to the axe-core bundle injected into every page
    pub script_path: Option<PathBuf>,

    /// Restrict the scan to rules carrying these tags
    pub rule_tags: Vec<String>,
}

/// Archive configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Directory for run snapshots; defaults under the store
    pub dir: Option<PathBuf>,

    /// Rows fetched per query while building a snapshot
    pub page_size: usize,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            dir: None,
            page_size: 1000,
        }
    }
}

impl LumenConfig {
    /// Load configuration from file
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.executor.page_timeout_secs == 0 {
            return Err(Error::InvalidConfig("executor.page_timeout_secs must be positive".into()));
        }
        if self.crawler.timeout_secs == 0 {
            return Err(Error::InvalidConfig("crawler.timeout_secs must be positive".into()));
        }
        if self.archive.page_size == 0 {
            return Err(Error::InvalidConfig("archive.page_size must be positive".into()));
        }
        if !matches!(self.browser.browser.as_str(), "chromium" | "firefox" | "webkit") {
            return Err(Error::InvalidConfig(format!(
                "unsupported browser: {}",
                self.browser.browser
            )));
        }
        Ok(())
    }

    /// Get the database path
    pub fn db_path(&self) -> PathBuf {
        self.store_path.join("state.db")
    }

    /// Get the snapshot directory
    pub fn archive_dir(&self) -> PathBuf {
        self.archive
            .dir
            .clone()
            .unwrap_or_else(|| self.store_path.join("archive"))
    }

    pub fn page_timeout(&self) -> Duration {
        Duration::from_secs(self.executor.page_timeout_secs)
    }

    pub fn crawl_timeout(&self) -> Duration {
        Duration::from_secs(self.crawler.timeout_secs)
    }
}
