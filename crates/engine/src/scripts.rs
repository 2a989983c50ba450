//! Scripts injected into and evaluated by the browser surface
//!
//! Every script starts with a `// lumen:<kind>` tag line so surfaces can
//! tell them apart in logs.

use crate::config::ScannerConfig;
use lumen_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Serializes an element without its children so snippets stay small and comparable
pub const CLEAN_HTML_HELPER: &str = r#"// lumen:helpers
window.__lumen = window.__lumen || {};
window.__lumen.cleanHtml = function (el) {
  if (!el || !el.cloneNode) return '';
  return el.cloneNode(false).outerHTML;
};
"#;

/// Builds a full `tag[role="x"]:nth-of-type(n)` path from `html` down to an element
pub const UNIQUE_SELECTOR_HELPER: &str = r#"// lumen:helpers
window.__lumen = window.__lumen || {};
window.__lumen.uniqueSelector = function (el) {
  if (!el || el.nodeType !== 1) return null;
  const parts = [];
  let node = el;
  while (node && node.nodeType === 1) {
    const tag = node.tagName.toLowerCase();
    let part = tag;
    const role = node.getAttribute('role');
    if (role) part += '[role="' + role.replace(/"/g, '\\"') + '"]';
    const parent = node.parentElement;
    if (parent) {
      const same = Array.prototype.filter.call(parent.children, (c) => c.tagName === node.tagName);
      if (same.length > 1) part += ':nth-of-type(' + (same.indexOf(node) + 1) + ')';
    }
    parts.unshift(part);
    if (tag === 'html') break;
    node = parent;
  }
  return parts.join(' > ');
};
"#;

const SCAN_TEMPLATE: &str = r#"// lumen:scan
const tags = __TAGS__;
const options = { resultTypes: ['violations', 'incomplete', 'inapplicable', 'passes'] };
if (tags.length) options.runOnly = { type: 'tag', values: tags };
const raw = await axe.run(document, options);
const resolve = (sel) => {
  try { return document.querySelector(sel); } catch (e) { return null; }
};
const bucket = (rules) => (rules || []).map((rule) => ({
  rule_id: rule.id,
  nodes: (rule.nodes || []).map((node) => {
    const selector = [];
    (node.target || []).forEach((t) => (Array.isArray(t) ? selector.push(...t) : selector.push(t)));
    const el = selector.length ? resolve(selector[selector.length - 1]) : null;
    return {
      selector,
      markup: el ? window.__lumen.cleanHtml(el) : (node.html || ''),
      failure_summary: node.failureSummary || null,
    };
  }),
}));
return {
  violations: bucket(raw.violations),
  incomplete: bucket(raw.incomplete),
  inapplicable: bucket(raw.inapplicable),
  passes: bucket(raw.passes),
};
"#;

const CAPTURE_TEMPLATE: &str = r#"// lumen:capture
const requests = __REQUESTS__;
return requests.map((req) => {
  const seen = new Set();
  const targets = [];
  const push = (el) => {
    const markup = window.__lumen.cleanHtml(el);
    if (seen.has(markup)) return;
    seen.add(markup);
    targets.push({ selector: window.__lumen.uniqueSelector(el), markup });
  };
  for (const sel of req.selectors) {
    let found = [];
    try { found = Array.from(document.querySelectorAll(sel)); } catch (e) { found = []; }
    if (found.length) found.forEach(push);
    else push(document.documentElement);
  }
  if (!req.selectors.length) push(document.documentElement);
  return { case_id: req.case_id, targets };
});
"#;

const SELECTORS_TEMPLATE: &str = r#"// lumen:selectors
const selectors = __SELECTORS__;
return selectors.map((sel) => {
  let el = null;
  try { el = document.querySelector(sel); } catch (e) { el = null; }
  return el ? window.__lumen.uniqueSelector(el) : null;
});
"#;

/// Absolute hrefs of every anchor on the page
pub const ANCHORS: &str = r#"// lumen:anchors
return Array.from(document.querySelectorAll('a[href]'))
  .map((a) => a.href)
  .filter((href) => typeof href === 'string' && href.length > 0);
"#;

/// What a script is for, read from its tag line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptKind {
    Helpers,
    Scanner,
    Scan,
    Capture,
    Selectors,
    Anchors,
}

impl ScriptKind {
    pub fn of(script: &str) -> Self {
        let tag = script
            .lines()
            .next()
            .and_then(|line| line.strip_prefix("// lumen:"))
            .map(str::trim);
        match tag {
            Some("helpers") => Self::Helpers,
            Some("scan") => Self::Scan,
            Some("capture") => Self::Capture,
            Some("selectors") => Self::Selectors,
            Some("anchors") => Self::Anchors,
            _ => Self::Scanner,
        }
    }
}

/// One manual test case's selectors to resolve against the live page
#[derive(Debug, Clone, Serialize)]
pub struct CaptureRequest {
    pub case_id: String,
    pub selectors: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CapturedElement {
    #[serde(default)]
    pub selector: Option<String>,
    pub markup: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptureResult {
    pub case_id: String,
    #[serde(default)]
    pub targets: Vec<CapturedElement>,
}

pub fn capture_script(requests: &[CaptureRequest]) -> Result<String> {
    Ok(CAPTURE_TEMPLATE.replace("__REQUESTS__", &serde_json::to_string(requests)?))
}

pub fn selectors_script(selectors: &[String]) -> Result<String> {
    Ok(SELECTORS_TEMPLATE.replace("__SELECTORS__", &serde_json::to_string(selectors)?))
}

/// The scanning engine source plus the helpers injected alongside it
#[derive(Debug, Clone)]
pub struct ScriptBundle {
    scanner: Arc<str>,
    scan: Arc<str>,
}

impl ScriptBundle {
    /// Read the scanner bundle named by the configuration
    pub fn load(config: &ScannerConfig) -> Result<Self> {
        let path = config.script_path.as_ref().ok_or_else(|| {
            Error::InvalidConfig("scanner.script_path is not set".to_string())
        })?;
        let source = std::fs::read_to_string(path).map_err(|e| {
            Error::InvalidConfig(format!("cannot read scanner bundle {}: {}", path.display(), e))
        })?;
        Self::from_source(source, &config.rule_tags)
    }

    pub fn from_source(source: impl Into<String>, rule_tags: &[String]) -> Result<Self> {
        let scan = SCAN_TEMPLATE.replace("__TAGS__", &serde_json::to_string(rule_tags)?);
        Ok(Self {
            scanner: Arc::from(source.into()),
            scan: Arc::from(scan),
        })
    }

    /// Scripts run once per page before scanning, in order
    pub fn injections(&self) -> [&str; 3] {
        [CLEAN_HTML_HELPER, UNIQUE_SELECTOR_HELPER, &self.scanner]
    }

    pub fn scan(&self) -> &str {
        &self.scan
    }
}
