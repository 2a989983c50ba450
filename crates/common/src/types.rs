//! Core types for Lumen

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Generate a fresh resource id
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Current time as epoch seconds
pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    _ => Err(format!("unknown {}: {}", stringify!($name), s)),
                }
            }
        }
    };
}

// ============================================================================
// Site structure
// ============================================================================

/// A site under test
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    pub id: String,
    pub name: String,
    pub base_url: String,
    pub created_at: i64,
}

/// A node in an environment's page tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub id: String,
    pub environment_id: String,
    pub path: String,
    pub name: String,
    pub parent_id: Option<String>,
    /// Structural-only pages exist to complete the tree and are never loaded
    pub navigable: bool,
    pub created_at: i64,
}

impl Page {
    /// Absolute URL of the page: the base URL's origin plus the stored path
    ///
    /// Stored paths are full URL paths, so any path on the base URL is replaced
    /// rather than prefixed.
    pub fn full_url(&self, base_url: &str) -> String {
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        match url::Url::parse(base_url) {
            Ok(mut url) => {
                url.set_path(&path);
                url.set_query(None);
                url.set_fragment(None);
                url.to_string()
            }
            Err(_) => format!("{}{}", base_url.trim_end_matches('/'), path),
        }
    }
}

// ============================================================================
// Runs
// ============================================================================

/// Environment test lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Opened,
    InProgress,
    TestCompleted,
    TestFailed,
    Completed,
    Failed,
    Closed,
}

impl Default for RunStatus {
    fn default() -> Self {
        Self::Opened
    }
}

text_enum!(RunStatus {
    Opened => "OPENED",
    InProgress => "IN_PROGRESS",
    TestCompleted => "TEST_COMPLETED",
    TestFailed => "TEST_FAILED",
    Completed => "COMPLETED",
    Failed => "FAILED",
    Closed => "CLOSED",
});

/// A named, time-boxed execution over a subset of an environment's pages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestRun {
    pub id: String,
    pub environment_id: String,
    pub name: String,
    pub status: RunStatus,
    pub notes: Option<String>,
    pub started_at: Option<i64>,
    pub ended_at: Option<i64>,
    pub created_at: i64,
}

/// Why a page belongs to a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageRole {
    Structured,
    Random,
}

text_enum!(PageRole {
    Structured => "structured",
    Random => "random",
});

/// Per-page execution state within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageRunStatus {
    Pending,
    InProgress,
    Success,
    Error,
}

impl Default for PageRunStatus {
    fn default() -> Self {
        Self::Pending
    }
}

text_enum!(PageRunStatus {
    Pending => "pending",
    InProgress => "in_progress",
    Success => "success",
    Error => "error",
});

/// Scoped join row between a run and one of its pages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunPage {
    pub run_id: String,
    pub page_id: String,
    pub role: PageRole,
    pub position: i64,
    pub status: PageRunStatus,
    pub started_at: Option<i64>,
    pub ended_at: Option<i64>,
}

// ============================================================================
// Results
// ============================================================================

/// Status shared by page test cases and targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestStatus {
    Pass,
    Fail,
    Error,
    NotApplicable,
    Incomplete,
    InProgress,
    Manual,
}

text_enum!(TestStatus {
    Pass => "PASS",
    Fail => "FAIL",
    Error => "ERROR",
    NotApplicable => "NOT_APPLICABLE",
    Incomplete => "INCOMPLETE",
    InProgress => "IN_PROGRESS",
    Manual => "MANUAL",
});

impl TestStatus {
    /// Statuses that still need a reviewer decision
    pub fn needs_review(&self) -> bool {
        matches!(self, Self::Manual | Self::Incomplete | Self::Error)
    }
}

/// Whether a test case is answered by the scanner or by a reviewer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestCaseKind {
    Automatic,
    Manual,
}

text_enum!(TestCaseKind {
    Automatic => "automatic",
    Manual => "manual",
});

/// A catalog test case
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCaseDefinition {
    pub id: String,
    pub name: String,
    pub kind: TestCaseKind,
    /// Scanner rule ids this case covers
    #[serde(default)]
    pub rule_ids: Vec<String>,
    /// Selectors resolved for manual capture and used to rank remediations
    #[serde(default)]
    pub selectors: Vec<String>,
    #[serde(default)]
    pub remediation_ids: Vec<String>,
    #[serde(default)]
    pub criteria_ids: Vec<String>,
    #[serde(default = "default_selected")]
    pub selected: bool,
}

fn default_selected() -> bool {
    true
}

/// One catalog test case evaluated on one page within one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageTestCase {
    pub id: String,
    pub run_id: String,
    pub page_id: String,
    pub test_case_id: String,
    pub status: TestStatus,
    pub started_at: Option<i64>,
    pub ended_at: Option<i64>,
}

/// Where a target was captured from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetSource {
    Automatic,
    Manual,
}

text_enum!(TargetSource {
    Automatic => "automatic",
    Manual => "manual",
});

/// One concrete DOM element recorded for a page test case
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub id: String,
    pub run_id: String,
    pub page_id: String,
    pub page_test_case_id: String,
    pub source: TargetSource,
    pub status: TestStatus,
    pub rule_id: String,
    pub selector: String,
    pub html: String,
    pub failure_summary: Option<String>,
    pub notes: Option<String>,
    pub remediation_id: Option<String>,
    pub landmark_id: Option<String>,
    pub parent_landmark_id: Option<String>,
    /// Targets sharing this key are occurrences of the same element issue
    pub occurrence_key: String,
    pub status_occurrences: i64,
    pub remediation_occurrences: i64,
    pub created_at: i64,
}

impl Target {
    /// Group key for the occurrence relation: same catalog test case, same markup
    pub fn occurrence_key(test_case_id: &str, html: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(test_case_id.as_bytes());
        hasher.update(b"\n");
        hasher.update(html.trim().as_bytes());
        hex::encode(hasher.finalize())
    }
}

// ============================================================================
// Catalog
// ============================================================================

/// A named page region type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Landmark {
    pub id: String,
    pub name: String,
    /// Tag names (`nav`) and role matchers (`role=navigation`)
    pub selectors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemediationCategory {
    pub id: String,
    pub name: String,
    /// Higher ranks win when several remediations apply
    pub priority: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Remediation {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub category_id: String,
    #[serde(default)]
    pub selectors: Vec<String>,
}

/// A standard success criterion linking test cases to remediations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Criterion {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub remediation_ids: Vec<String>,
}

/// Static reference data imported as a whole
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub landmarks: Vec<Landmark>,
    #[serde(default)]
    pub categories: Vec<RemediationCategory>,
    #[serde(default)]
    pub remediations: Vec<Remediation>,
    #[serde(default)]
    pub criteria: Vec<Criterion>,
    #[serde(default)]
    pub test_cases: Vec<TestCaseDefinition>,
}
