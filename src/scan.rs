//! C2: scan discovery and scan-tree combination (spec.md §4.2).

use std::collections::{BTreeMap, BTreeSet, HashMap};

use futures_util::future::join_all;
use regex::Regex;
use tracing::warn;

use crate::cache::CacheClient;
use crate::config::InstanceDef;
use crate::model::Value;
use crate::oidmap::{map_oid, resolve_scan_pattern, transform_oids, TransformMode};
use crate::tree::{merge_dependency, IndexTree};

/// Exclude filters grouped by the variable they target, parsed from
/// `exclude_regexp` request entries of the form `var=regex` (spec.md §4.2
/// step 2).
pub fn parse_excludes(exclude_regexp: &[String]) -> HashMap<String, Vec<Regex>> {
    let mut by_var: HashMap<String, Vec<Regex>> = HashMap::new();
    for entry in exclude_regexp {
        if let Some((var, pattern)) = entry.split_once('=') {
            match Regex::new(pattern) {
                Ok(re) => by_var.entry(var.to_string()).or_default().push(re),
                Err(e) => warn!(var, pattern, error = %e, "invalid exclude_regexp pattern"),
            }
        } else {
            warn!(entry, "malformed exclude_regexp entry, expected var=regex");
        }
    }
    by_var
}

/// Per-host result of one scan: the "row exists" tree and the raw-string
/// tree used later by `<val var="...">` lookups, plus which OIDs were
/// excluded.
pub struct ScanOutcome {
    pub blank: IndexTree,
    pub scan_vals: IndexTree,
    pub excluded: BTreeSet<String>,
}

/// Issue one cache scan (spec.md §4.2 step 3) and fold the result into a
/// per-host blank tree and scan_vals tree, applying exclude filters.
///
/// `exclude-only` scans contribute only to the excluded-OID set and emit no
/// rows, per spec.md §9's resolution of the `use_target_matches` ambiguity.
pub async fn do_scan(
    cache: &dyn CacheClient,
    nodes: &[String],
    scan_id: &str,
    oid: &str,
    var: &str,
    exclude_only: bool,
    excludes: &HashMap<String, Vec<Regex>>,
) -> BTreeMap<String, ScanOutcome> {
    let pattern = resolve_scan_pattern(oid, var);
    let map = map_oid(&pattern);
    let oid_base = map.oid_base();

    let rows = match cache.get(nodes, &oid_base).await {
        Ok(rows) => rows,
        Err(e) => {
            warn!(scan_id, oid_base, error = %e, "scan cache request failed");
            BTreeMap::new()
        }
    };

    let var_excludes = excludes.get(var);

    let mut out = BTreeMap::new();
    for host in nodes {
        let host_rows = rows.get(host).cloned().unwrap_or_default();
        let mut excluded = BTreeSet::new();
        let mut kept: Vec<(String, Option<Value>, Option<i64>)> = Vec::new();

        for (oid, sample) in &host_rows {
            let value = sample.value_as_value();
            let is_excluded = var_excludes
                .map(|res| {
                    value
                        .as_str_lossy()
                        .map(|s| res.iter().any(|re| re.is_match(&s)))
                        .unwrap_or(false)
                })
                .unwrap_or(false);
            if is_excluded {
                excluded.insert(oid.clone());
                continue;
            }
            if !exclude_only {
                kept.push((oid.clone(), Some(value), sample.time));
            }
        }

        let blank = transform_oids(&kept, &map, TransformMode::Blank);
        let scan_vals = transform_oids(&kept, &map, TransformMode::Scan);
        out.insert(
            host.clone(),
            ScanOutcome {
                blank,
                scan_vals,
                excluded,
            },
        );
    }
    out
}

/// Fan out one cache call per scan concurrently (spec.md §4.2, §5 "multiple
/// cache calls proceed concurrently; the barrier is crossed only when all
/// have completed").
pub async fn do_scans(
    cache: &dyn CacheClient,
    nodes: &[String],
    instance: &InstanceDef,
    excludes: &HashMap<String, Vec<Regex>>,
) -> HashMap<String, BTreeMap<String, ScanOutcome>> {
    let futures = instance.scans.iter().map(|scan| {
        do_scan(
            cache,
            nodes,
            &scan.id,
            &scan.oid,
            &scan.var,
            scan.exclude_only,
            excludes,
        )
    });
    let results = join_all(futures).await;

    let mut by_scan: HashMap<String, BTreeMap<String, ScanOutcome>> = HashMap::new();
    for (scan, outcome) in instance.scans.iter().zip(results) {
        by_scan.insert(scan.id.clone(), outcome);
    }
    by_scan
}

/// Combine every scan's tree into one per host (spec.md §4.2 "digest_scans").
///
/// With exactly one scan, its tree is the combined tree outright. With more
/// than one, the scan with the longest legend is the main scan; each
/// shallower legend position is looked up by scan id and its keys are
/// unioned in — additive only, never removing a key (spec.md §9's
/// resolution of `_combine_scans` into a genuine recursive union).
pub fn digest_scans(
    nodes: &[String],
    instance: &InstanceDef,
    by_scan: &HashMap<String, BTreeMap<String, ScanOutcome>>,
) -> HashMap<String, IndexTree> {
    let mut combined = HashMap::new();

    for host in nodes {
        let mut present: Vec<(&str, &IndexTree)> = Vec::new();
        for scan in &instance.scans {
            if let Some(outcome) = by_scan.get(&scan.id).and_then(|m| m.get(host)) {
                present.push((scan.id.as_str(), &outcome.blank));
            }
        }
        if present.is_empty() {
            combined.insert(host.clone(), IndexTree::empty(Vec::new()));
            continue;
        }

        let (main_id, main_tree) = present
            .iter()
            .max_by_key(|(_, t)| t.legend.len())
            .copied()
            .expect("present is non-empty");
        let mut result = main_tree.clone();

        if main_tree.legend.len() > 1 {
            for pos in 0..main_tree.legend.len() - 1 {
                let dep_id = &main_tree.legend[pos];
                if dep_id == main_id {
                    continue;
                }
                if let Some(dep_tree) = present
                    .iter()
                    .find(|(id, _)| *id == dep_id.as_str())
                    .map(|(_, t)| *t)
                {
                    merge_dependency(&mut result.root, &dep_tree.root);
                }
            }
        }
        combined.insert(host.clone(), result);
    }
    combined
}

/// Shared exclude set per host, across all scans (spec.md §3 `scan_exclude`).
pub fn combine_excludes(
    nodes: &[String],
    by_scan: &HashMap<String, BTreeMap<String, ScanOutcome>>,
) -> HashMap<String, BTreeSet<String>> {
    let mut out: HashMap<String, BTreeSet<String>> = HashMap::new();
    for host in nodes {
        let mut set = BTreeSet::new();
        for scans in by_scan.values() {
            if let Some(outcome) = scans.get(host) {
                set.extend(outcome.excluded.iter().cloned());
            }
        }
        out.insert(host.clone(), set);
    }
    out
}

/// Per-host `scan_id -> scan_vals tree`, for `<val var="...">` lookups
/// (spec.md §4.3).
pub fn scan_vals_by_host(
    nodes: &[String],
    instance: &InstanceDef,
    by_scan: &HashMap<String, BTreeMap<String, ScanOutcome>>,
) -> HashMap<String, HashMap<String, IndexTree>> {
    let mut out = HashMap::new();
    for host in nodes {
        let mut per_scan = HashMap::new();
        for scan in &instance.scans {
            if let Some(outcome) = by_scan.get(&scan.id).and_then(|m| m.get(host)) {
                per_scan.insert(scan.id.clone(), outcome.scan_vals.clone());
            }
        }
        out.insert(host.clone(), per_scan);
    }
    out
}
