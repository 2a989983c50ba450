//! Occurrence counters
//!
//! Targets sharing an occurrence key are the same element issue seen in
//! several places. Their counters are always recomputed from the group's
//! current rows, never incremented.

use lumen_common::{Database, Result, Target};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// `(id, same status, same remediation)` for every member of one group
pub fn counters(group: &[Target]) -> Vec<(String, i64, i64)> {
    let mut by_status: HashMap<_, i64> = HashMap::new();
    let mut by_remediation: HashMap<Option<&str>, i64> = HashMap::new();
    for target in group {
        *by_status.entry(target.status).or_default() += 1;
        *by_remediation
            .entry(target.remediation_id.as_deref())
            .or_default() += 1;
    }

    group
        .iter()
        .map(|t| {
            (
                t.id.clone(),
                by_status[&t.status],
                by_remediation[&t.remediation_id.as_deref()],
            )
        })
        .collect()
}

/// Recompute and store counters for the listed groups of a run
pub fn refresh(db: &Database, run_id: &str, keys: &[String]) -> Result<usize> {
    let keys: Vec<String> = keys
        .iter()
        .cloned()
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    let members = db.list_occurrences(run_id, &keys)?;

    let mut groups: HashMap<&str, Vec<Target>> = HashMap::new();
    for target in &members {
        groups
            .entry(target.occurrence_key.as_str())
            .or_default()
            .push(target.clone());
    }

    let mut updates = Vec::with_capacity(members.len());
    for group in groups.values() {
        updates.extend(counters(group));
    }
    // Only rows whose values changed are written
    let current: HashMap<&str, (i64, i64)> = members
        .iter()
        .map(|t| (t.id.as_str(), (t.status_occurrences, t.remediation_occurrences)))
        .collect();
    updates.retain(|(id, s, r)| current.get(id.as_str()) != Some(&(*s, *r)));

    db.write_occurrence_counters(&updates)?;
    debug!(
        "Refreshed occurrence counters for {} groups ({} rows changed)",
        groups.len(),
        updates.len()
    );
    Ok(updates.len())
}
