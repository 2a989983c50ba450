//! Scan result aggregation
//!
//! Turns one page's raw scanner buckets into a final status per automatic
//! test case plus the targets recorded for it.

use lumen_common::{
    new_id, now, Criterion, Database, PageTestCase, Remediation, Result, Target, TargetSource,
    TestCaseDefinition, TestStatus,
};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Raw scanner output for one page
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanResult {
    pub violations: Vec<RuleResult>,
    pub incomplete: Vec<RuleResult>,
    pub inapplicable: Vec<RuleResult>,
    pub passes: Vec<RuleResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleResult {
    pub rule_id: String,
    #[serde(default)]
    pub nodes: Vec<ScanNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanNode {
    /// Frame path to the element; the last entry addresses it in its own document
    #[serde(default)]
    pub selector: Vec<String>,
    #[serde(default)]
    pub markup: String,
    #[serde(default)]
    pub failure_summary: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bucket {
    Incomplete,
    Inapplicable,
    Passes,
    Violations,
}

/// Merge order; a later bucket overwrites an earlier one, so FAIL wins
const BUCKET_ORDER: [(Bucket, TestStatus); 4] = [
    (Bucket::Incomplete, TestStatus::Incomplete),
    (Bucket::Inapplicable, TestStatus::NotApplicable),
    (Bucket::Passes, TestStatus::Pass),
    (Bucket::Violations, TestStatus::Fail),
];

impl ScanResult {
    fn bucket(&self, bucket: Bucket) -> &[RuleResult] {
        match bucket {
            Bucket::Incomplete => &self.incomplete,
            Bucket::Inapplicable => &self.inapplicable,
            Bucket::Passes => &self.passes,
            Bucket::Violations => &self.violations,
        }
    }
}

/// Catalog slice needed to pick remediations
#[derive(Debug, Clone, Default)]
pub struct RemediationIndex {
    remediations: HashMap<String, Remediation>,
    criteria: HashMap<String, Criterion>,
    priorities: HashMap<String, i64>,
}

impl RemediationIndex {
    pub fn new(
        remediations: Vec<Remediation>,
        criteria: Vec<Criterion>,
        priorities: HashMap<String, i64>,
    ) -> Self {
        Self {
            remediations: remediations.into_iter().map(|r| (r.id.clone(), r)).collect(),
            criteria: criteria.into_iter().map(|c| (c.id.clone(), c)).collect(),
            priorities,
        }
    }

    /// Load everything reachable from `definitions`
    pub fn load(db: &Database, definitions: &[TestCaseDefinition]) -> Result<Self> {
        let criteria_ids: Vec<String> = definitions
            .iter()
            .flat_map(|d| d.criteria_ids.iter().cloned())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let criteria = db.get_criteria(&criteria_ids)?;

        let remediation_ids: Vec<String> = definitions
            .iter()
            .flat_map(|d| d.remediation_ids.iter().cloned())
            .chain(criteria.iter().flat_map(|c| c.remediation_ids.iter().cloned()))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let remediations = db.get_remediations(&remediation_ids)?;

        Ok(Self::new(remediations, criteria, db.category_priorities()?))
    }

    fn priority(&self, remediation: &Remediation) -> i64 {
        self.priorities
            .get(&remediation.category_id)
            .copied()
            .unwrap_or_default()
    }

    /// Best remediation for a failing test case
    ///
    /// Direct assignments are used when present. Otherwise remediations reached
    /// through the case's criteria are considered, narrowed to those sharing a
    /// selector with the case when any do. Highest category priority wins.
    pub fn choose(&self, definition: &TestCaseDefinition) -> Option<String> {
        let direct: Vec<&Remediation> = definition
            .remediation_ids
            .iter()
            .filter_map(|id| self.remediations.get(id))
            .collect();

        let mut candidates = if !direct.is_empty() {
            direct
        } else {
            let mut seen = HashSet::new();
            let via_criteria: Vec<&Remediation> = definition
                .criteria_ids
                .iter()
                .filter_map(|id| self.criteria.get(id))
                .flat_map(|c| c.remediation_ids.iter())
                .filter(|id| seen.insert(id.as_str()))
                .filter_map(|id| self.remediations.get(id))
                .collect();
            let matching: Vec<&Remediation> = via_criteria
                .iter()
                .copied()
                .filter(|r| r.selectors.iter().any(|s| definition.selectors.contains(s)))
                .collect();
            if matching.is_empty() {
                via_criteria
            } else {
                matching
            }
        };

        candidates.sort_by_key(|r| Reverse(self.priority(r)));
        candidates.first().map(|r| r.id.clone())
    }
}

/// Aggregated outcome for one page
#[derive(Debug, Clone, Default)]
pub struct PageOutcome {
    /// Final status per page test case id
    pub statuses: Vec<(String, TestStatus)>,
    pub targets: Vec<Target>,
}

/// Merge `scan` into the page's automatic test cases
pub fn aggregate(
    scan: &ScanResult,
    cases: &[(PageTestCase, TestCaseDefinition)],
    remediations: &RemediationIndex,
) -> PageOutcome {
    let mut statuses: Vec<TestStatus> = vec![TestStatus::Incomplete; cases.len()];
    let mut targets: Vec<Target> = Vec::new();
    let mut slots: HashMap<(usize, String, String), usize> = HashMap::new();

    for (bucket, label) in BUCKET_ORDER {
        for rule in scan.bucket(bucket) {
            for (i, (case, definition)) in cases.iter().enumerate() {
                if !definition.rule_ids.iter().any(|r| *r == rule.rule_id) {
                    continue;
                }
                statuses[i] = label;

                for node in &rule.nodes {
                    let Some(selector) = node.selector.last() else {
                        debug!("Skipping {} node without selector", rule.rule_id);
                        continue;
                    };
                    let target = new_target(case, &rule.rule_id, selector, node, label);
                    // One row per (case, rule, selector); the later bucket wins
                    match slots.get(&(i, rule.rule_id.clone(), selector.clone())) {
                        Some(&slot) => targets[slot] = target,
                        None => {
                            slots.insert((i, rule.rule_id.clone(), selector.clone()), targets.len());
                            targets.push(target);
                        }
                    }
                }
            }
        }
    }

    for (i, (case, definition)) in cases.iter().enumerate() {
        if statuses[i] != TestStatus::Fail {
            continue;
        }
        let Some(remediation_id) = remediations.choose(definition) else {
            continue;
        };
        for target in targets
            .iter_mut()
            .filter(|t| t.page_test_case_id == case.id && t.status == TestStatus::Fail)
        {
            target.remediation_id = Some(remediation_id.clone());
        }
    }

    PageOutcome {
        statuses: cases
            .iter()
            .zip(statuses)
            .map(|((case, _), status)| (case.id.clone(), status))
            .collect(),
        targets,
    }
}

fn new_target(
    case: &PageTestCase,
    rule_id: &str,
    selector: &str,
    node: &ScanNode,
    status: TestStatus,
) -> Target {
    Target {
        id: new_id(),
        run_id: case.run_id.clone(),
        page_id: case.page_id.clone(),
        page_test_case_id: case.id.clone(),
        source: TargetSource::Automatic,
        status,
        rule_id: rule_id.to_string(),
        selector: selector.to_string(),
        html: node.markup.clone(),
        failure_summary: node.failure_summary.clone(),
        notes: None,
        remediation_id: None,
        landmark_id: None,
        parent_landmark_id: None,
        occurrence_key: Target::occurrence_key(&case.test_case_id, &node.markup),
        status_occurrences: 1,
        remediation_occurrences: 1,
        created_at: now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_common::TestCaseKind;

    fn case(test_case_id: &str, rules: &[&str]) -> (PageTestCase, TestCaseDefinition) {
        (
            PageTestCase {
                id: format!("ptc-{}", test_case_id),
                run_id: "run".into(),
                page_id: "page".into(),
                test_case_id: test_case_id.into(),
                status: TestStatus::InProgress,
                started_at: None,
                ended_at: None,
            },
            TestCaseDefinition {
                id: test_case_id.into(),
                name: test_case_id.into(),
                kind: TestCaseKind::Automatic,
                rule_ids: rules.iter().map(|r| r.to_string()).collect(),
                selectors: vec!["img".into()],
                remediation_ids: vec![],
                criteria_ids: vec![],
                selected: true,
            },
        )
    }

    fn rule(id: &str, selectors: &[&str]) -> RuleResult {
        RuleResult {
            rule_id: id.into(),
            nodes: selectors
                .iter()
                .map(|s| ScanNode {
                    selector: vec![s.to_string()],
                    markup: format!("<img class=\"{}\">", s),
                    failure_summary: Some("Fix this".into()),
                })
                .collect(),
        }
    }

    fn remediation(id: &str, category: &str, selectors: &[&str]) -> Remediation {
        Remediation {
            id: id.into(),
            name: id.into(),
            description: String::new(),
            category_id: category.into(),
            selectors: selectors.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn violation_beats_pass_for_same_rule() {
        let scan = ScanResult {
            passes: vec![rule("image-alt", &["img.a"])],
            violations: vec![rule("image-alt", &["img.a"])],
            ..Default::default()
        };
        let cases = vec![case("tc-alt", &["image-alt"])];
        let outcome = aggregate(&scan, &cases, &RemediationIndex::default());

        assert_eq!(outcome.statuses, vec![("ptc-tc-alt".to_string(), TestStatus::Fail)]);
        assert_eq!(outcome.targets.len(), 1);
        assert_eq!(outcome.targets[0].status, TestStatus::Fail);
    }

    #[test]
    fn untouched_cases_stay_incomplete() {
        let scan = ScanResult {
            inapplicable: vec![RuleResult {
                rule_id: "video-caption".into(),
                nodes: vec![],
            }],
            ..Default::default()
        };
        let cases = vec![case("tc-video", &["video-caption"]), case("tc-other", &["label"])];
        let outcome = aggregate(&scan, &cases, &RemediationIndex::default());

        assert_eq!(outcome.statuses[0].1, TestStatus::NotApplicable);
        assert_eq!(outcome.statuses[1].1, TestStatus::Incomplete);
        assert!(outcome.targets.is_empty());
    }

    #[test]
    fn one_target_per_node_with_bucket_status() {
        let scan = ScanResult {
            incomplete: vec![rule("color-contrast", &["p.x"])],
            passes: vec![rule("image-alt", &["img.ok"])],
            violations: vec![rule("image-alt", &["img.bad", "img.worse"])],
            ..Default::default()
        };
        let cases = vec![case("tc-alt", &["image-alt"]), case("tc-contrast", &["color-contrast"])];
        let outcome = aggregate(&scan, &cases, &RemediationIndex::default());

        let by_selector: HashMap<_, _> = outcome
            .targets
            .iter()
            .map(|t| (t.selector.as_str(), t.status))
            .collect();
        assert_eq!(by_selector["img.ok"], TestStatus::Pass);
        assert_eq!(by_selector["img.bad"], TestStatus::Fail);
        assert_eq!(by_selector["p.x"], TestStatus::Incomplete);
        assert_eq!(outcome.statuses[1].1, TestStatus::Incomplete);
    }

    #[test]
    fn direct_remediation_is_stamped_on_fail_targets() {
        let scan = ScanResult {
            passes: vec![rule("image-alt", &["img.ok"])],
            violations: vec![rule("image-alt", &["img.bad"])],
            ..Default::default()
        };
        let (ptc, mut def) = case("tc-alt", &["image-alt"]);
        def.remediation_ids = vec!["low".into(), "high".into()];
        let index = RemediationIndex::new(
            vec![remediation("low", "minor", &[]), remediation("high", "critical", &[])],
            vec![],
            HashMap::from([("minor".to_string(), 1), ("critical".to_string(), 9)]),
        );

        let outcome = aggregate(&scan, &[(ptc, def)], &index);
        for target in &outcome.targets {
            match target.status {
                TestStatus::Fail => assert_eq!(target.remediation_id.as_deref(), Some("high")),
                _ => assert_eq!(target.remediation_id, None),
            }
        }
    }

    #[test]
    fn criteria_remediations_prefer_selector_overlap() {
        let (_, mut def) = case("tc-alt", &["image-alt"]);
        def.criteria_ids = vec!["1.1.1".into()];
        let index = RemediationIndex::new(
            vec![
                remediation("generic", "critical", &["div"]),
                remediation("images", "minor", &["img"]),
            ],
            vec![Criterion {
                id: "1.1.1".into(),
                name: "Non-text content".into(),
                remediation_ids: vec!["generic".into(), "images".into()],
            }],
            HashMap::from([("minor".to_string(), 1), ("critical".to_string(), 9)]),
        );
        assert_eq!(index.choose(&def).as_deref(), Some("images"));

        def.selectors = vec!["table".into()];
        assert_eq!(index.choose(&def).as_deref(), Some("generic"));
    }
}
