//! C3: value fetch, trim, and digestion into row records (spec.md §4.3).

use std::collections::{BTreeMap, HashMap};

use futures_util::future::join_all;
use tracing::{error, warn};

use crate::cache::CacheClient;
use crate::config::{InstanceDef, ValDef};
use crate::error::PipelineError;
use crate::model::{RowRecord, Value};
use crate::oidmap::{map_oid, transform_oids, TransformMode};
use crate::tree::{trim, IndexTree, Node};

/// Host-variable fetch (spec.md §4.3): one cache call against `vars.*`,
/// stripping the `vars.` prefix from each returned OID.
pub async fn do_hostvars(
    cache: &dyn CacheClient,
    nodes: &[String],
) -> HashMap<String, BTreeMap<String, Value>> {
    let rows = match cache.get(nodes, "vars.*").await {
        Ok(rows) => rows,
        Err(e) => {
            warn!(error = %e, "hostvar cache request failed");
            BTreeMap::new()
        }
    };

    let mut out = HashMap::new();
    for host in nodes {
        let mut vars = BTreeMap::new();
        if let Some(host_rows) = rows.get(host) {
            for (oid, sample) in host_rows {
                if let Some(name) = oid.strip_prefix("vars.") {
                    vars.insert(name.to_string(), sample.value_as_value());
                }
            }
        }
        out.insert(host.clone(), vars);
    }
    out
}

/// Per-value trees for every val that carries an `oid` or a `var`, keyed
/// `val_id -> host -> tree` (spec.md §4.3 "Per-value fetches").
///
/// `var=="node"` vals and scan-reference vals need no cache call and are
/// resolved synchronously; `oid`-bearing vals fan out one `get`/`get_rate`
/// per host, all concurrently, crossing the barrier only once every call
/// has completed (spec.md §5).
pub async fn do_vals(
    cache: &dyn CacheClient,
    nodes: &[String],
    instance: &InstanceDef,
    period: u32,
    combined_scan: &HashMap<String, IndexTree>,
    scan_vals: &HashMap<String, HashMap<String, IndexTree>>,
) -> HashMap<String, HashMap<String, IndexTree>> {
    let mut out: HashMap<String, HashMap<String, IndexTree>> = HashMap::new();
    let mut fetches = Vec::new();

    for val in &instance.vals {
        match (&val.oid, &val.var) {
            (None, Some(var)) if var == "node" => {
                for host in nodes {
                    out.entry(val.id.clone()).or_default().insert(
                        host.clone(),
                        IndexTree {
                            legend: Vec::new(),
                            root: Node::Leaf {
                                value: Some(Value::from_str(host.clone())),
                                time: None,
                            },
                        },
                    );
                }
            }
            (None, Some(scan_id)) => {
                let mut resolved = false;
                for host in nodes {
                    if let Some(tree) = scan_vals.get(host).and_then(|m| m.get(scan_id)) {
                        out.entry(val.id.clone())
                            .or_default()
                            .insert(host.clone(), tree.clone());
                        resolved = true;
                    }
                }
                if !resolved {
                    let e = PipelineError::UnknownScanReference {
                        val_id: val.id.clone(),
                        var: scan_id.clone(),
                    };
                    error!(%e, "skipping val");
                }
            }
            (None, None) => {
                let e = PipelineError::ValMissingSource {
                    val_id: val.id.clone(),
                };
                error!(%e, "skipping val");
            }
            (Some(_), _) => {
                for host in nodes {
                    fetches.push(fetch_val_host(cache, host, val, period, combined_scan.get(host)));
                }
            }
        }
    }

    for (val_id, host, tree) in join_all(fetches).await {
        out.entry(val_id).or_default().insert(host, tree);
    }
    out
}

async fn fetch_val_host(
    cache: &dyn CacheClient,
    host: &str,
    val: &ValDef,
    period: u32,
    scan_tree: Option<&IndexTree>,
) -> (String, String, IndexTree) {
    let oid = val
        .oid
        .as_deref()
        .expect("caller only queues oid-bearing vals");
    let map = map_oid(oid);
    let oid_base = map.oid_base();
    let hosts = [host.to_string()];

    let rows = if val.is_rate {
        cache.get_rate(&hosts, period, &oid_base).await
    } else {
        cache.get(&hosts, &oid_base).await
    };
    let rows = match rows {
        Ok(r) => r,
        Err(e) => {
            warn!(val_id = %val.id, host, error = %e, "val cache request failed");
            BTreeMap::new()
        }
    };

    // Row-level data absent: an OID missing either value or time is
    // silently dropped (spec.md §7).
    let kept: Vec<(String, Option<Value>, Option<i64>)> = rows
        .get(host)
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .filter_map(|(oid, sample)| {
            if sample.value.is_some() && sample.time.is_some() {
                let time = sample.time;
                Some((oid, Some(sample.value_as_value()), time))
            } else {
                None
            }
        })
        .collect();

    let value_tree = transform_oids(&kept, &map, TransformMode::Default);
    let trimmed_root = match scan_tree {
        Some(scan_tree) => trim(&value_tree.root, &scan_tree.root),
        None => value_tree.root,
    };
    (
        val.id.clone(),
        host.to_string(),
        IndexTree {
            legend: value_tree.legend,
            root: trimmed_root,
        },
    )
}

/// The skeleton's accumulating leaf: one row in progress, keyed by val id.
#[derive(Debug, Default, Clone)]
struct RowAccumulator {
    time: Option<i64>,
    fields: BTreeMap<String, Value>,
}

/// A deep copy of the combined scan tree's shape, with blank leaves turned
/// into row accumulators (spec.md §4.3 "digest_vals").
#[derive(Debug, Clone)]
enum Skeleton {
    Interior(BTreeMap<String, Skeleton>),
    Leaf(RowAccumulator),
}

fn build_skeleton(node: &Node) -> Skeleton {
    match node {
        Node::Interior(map) => {
            Skeleton::Interior(map.iter().map(|(k, v)| (k.clone(), build_skeleton(v))).collect())
        }
        Node::Leaf { .. } => Skeleton::Leaf(RowAccumulator::default()),
    }
}

/// Walk `value_node` and `skeleton` in lockstep, assigning `val_id`'s value
/// into every skeleton leaf it reaches. When `value_node` bottoms out at a
/// leaf while the skeleton still has depth remaining, the same leaf is
/// propagated to every remaining skeleton position beneath it (spec.md
/// §4.3, "If the value tree is flat ... propagate the same value to every
/// remaining leaf beneath that point").
fn assign_val(skeleton: &mut Skeleton, value_node: &Node, val_id: &str) {
    match (skeleton, value_node) {
        (Skeleton::Interior(skel_map), Node::Interior(val_map)) => {
            for (k, child_val) in val_map {
                if let Some(child_skel) = skel_map.get_mut(k) {
                    assign_val(child_skel, child_val, val_id);
                }
            }
        }
        (Skeleton::Interior(skel_map), leaf @ Node::Leaf { .. }) => {
            for child_skel in skel_map.values_mut() {
                assign_val(child_skel, leaf, val_id);
            }
        }
        (Skeleton::Leaf(acc), Node::Leaf { value: Some(v), time }) => {
            acc.fields.insert(val_id.to_string(), v.clone());
            if acc.time.is_none() {
                if let Some(t) = time {
                    acc.time = Some(*t);
                }
            }
        }
        (Skeleton::Leaf(_), Node::Leaf { value: None, .. }) => {}
        // A value tree with more depth than the skeleton has left (or
        // structurally mismatched) simply has nowhere to land.
        (Skeleton::Leaf(_), Node::Interior(_)) => {}
    }
}

fn flatten_skeleton(skeleton: &Skeleton, now: i64, out: &mut Vec<RowRecord>) {
    match skeleton {
        Skeleton::Interior(map) => {
            for child in map.values() {
                flatten_skeleton(child, now, out);
            }
        }
        Skeleton::Leaf(acc) => {
            out.push(RowRecord {
                time: acc.time.unwrap_or(now),
                fields: acc.fields.clone(),
            });
        }
    }
}

/// Digest one host's combined scan tree plus every val's tree for that host
/// into an ordered array of row records. `now` is the request wall-clock,
/// used when no val contributed a sample time for a row (spec.md §3 "Row
/// record").
pub fn digest_vals(
    host: &str,
    combined_scan: &IndexTree,
    val_trees: &HashMap<String, HashMap<String, IndexTree>>,
    now: i64,
) -> Vec<RowRecord> {
    let mut skeleton = build_skeleton(&combined_scan.root);
    for (val_id, by_host) in val_trees {
        if let Some(tree) = by_host.get(host) {
            assign_val(&mut skeleton, &tree.root, val_id);
        }
    }
    let mut rows = Vec::new();
    flatten_skeleton(&skeleton, now, &mut rows);
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::mock::MockCacheClient;
    use crate::config::ScanDef;

    fn sample(v: impl Into<serde_json::Value>, t: i64) -> crate::model::CacheSample {
        crate::model::CacheSample {
            value: Some(v.into()),
            time: Some(t),
        }
    }

    fn val(id: &str, var: Option<&str>, oid: Option<&str>, is_rate: bool) -> ValDef {
        ValDef {
            id: id.to_string(),
            var: var.map(str::to_string),
            oid: oid.map(str::to_string),
            is_rate,
            fctns: Vec::new(),
        }
    }

    #[tokio::test]
    async fn node_identity_val_is_the_host_name() {
        let mock = MockCacheClient::new();
        let nodes = vec!["h1".to_string(), "h2".to_string()];
        let instance = InstanceDef {
            scans: vec![],
            vals: vec![val("device", Some("node"), None, false)],
            inputs: vec![],
        };
        let combined = HashMap::new();
        let scan_vals = HashMap::new();

        let trees = do_vals(&mock, &nodes, &instance, 60, &combined, &scan_vals).await;
        let tree = trees.get("device").unwrap().get("h1").unwrap();
        assert_eq!(
            tree.root,
            Node::Leaf {
                value: Some(Value::from_str("h1")),
                time: None
            }
        );
    }

    #[tokio::test]
    async fn oid_val_is_trimmed_against_scan_tree() {
        let mock = MockCacheClient::new();
        let mut rows = BTreeMap::new();
        rows.insert(
            "h".to_string(),
            BTreeMap::from([
                ("1.2.1".to_string(), sample(100, 1000)),
                ("1.2.2".to_string(), sample(200, 1000)),
            ]),
        );
        mock.set("1.2", rows);

        let nodes = vec!["h".to_string()];
        let instance = InstanceDef {
            scans: vec![ScanDef {
                id: "s".to_string(),
                oid: "1.2.*".to_string(),
                var: "s".to_string(),
                exclude_only: false,
            }],
            vals: vec![val("v", None, Some("1.2.s"), false)],
            inputs: vec![],
        };

        let mut scan_tree = IndexTree::empty(vec!["s".to_string()]);
        scan_tree.insert(&["1".to_string()], Node::blank_leaf());
        // key "2" is deliberately absent: the value arriving for it must be
        // trimmed away.
        let mut combined = HashMap::new();
        combined.insert("h".to_string(), scan_tree);
        let scan_vals = HashMap::new();

        let trees = do_vals(&mock, &nodes, &instance, 60, &combined, &scan_vals).await;
        let tree = trees.get("v").unwrap().get("h").unwrap();
        let top = tree.root.as_interior().unwrap();
        assert_eq!(top.len(), 1);
        assert!(top.contains_key("1"));
    }

    #[tokio::test]
    async fn unknown_scan_reference_is_skipped() {
        let mock = MockCacheClient::new();
        let nodes = vec!["h".to_string()];
        let instance = InstanceDef {
            scans: vec![],
            vals: vec![val("v", Some("missing_scan"), None, false)],
            inputs: vec![],
        };
        let combined = HashMap::new();
        let scan_vals = HashMap::new();

        let trees = do_vals(&mock, &nodes, &instance, 60, &combined, &scan_vals).await;
        assert!(trees.get("v").is_none());
    }

    #[test]
    fn digest_vals_assigns_matching_leaves_and_stamps_time() {
        let mut combined = IndexTree::empty(vec!["name".to_string()]);
        combined.insert(&["eth0".to_string()], Node::blank_leaf());
        combined.insert(&["eth1".to_string()], Node::blank_leaf());

        let mut v_tree = IndexTree::empty(vec!["name".to_string()]);
        v_tree.insert(
            &["eth0".to_string()],
            Node::Leaf {
                value: Some(Value::Number(100.0)),
                time: Some(1000),
            },
        );
        v_tree.insert(
            &["eth1".to_string()],
            Node::Leaf {
                value: Some(Value::Number(200.0)),
                time: Some(1000),
            },
        );

        let mut val_trees = HashMap::new();
        let mut by_host = HashMap::new();
        by_host.insert("h".to_string(), v_tree);
        val_trees.insert("v".to_string(), by_host);

        let rows = digest_vals("h", &combined, &val_trees, 9999);
        assert_eq!(rows.len(), 2);
        for row in &rows {
            assert_eq!(row.time, 1000);
            assert!(row.fields.contains_key("v"));
        }
    }

    #[test]
    fn digest_vals_falls_back_to_wall_clock_when_no_val_sets_time() {
        let mut combined = IndexTree::empty(vec!["name".to_string()]);
        combined.insert(&["eth0".to_string()], Node::blank_leaf());

        let val_trees = HashMap::new();
        let rows = digest_vals("h", &combined, &val_trees, 9999);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].time, 9999);
        assert!(rows[0].fields.is_empty());
    }

    #[test]
    fn digest_vals_propagates_flat_value_to_every_remaining_leaf() {
        let mut combined = IndexTree::empty(vec!["a".to_string(), "b".to_string()]);
        combined.insert(&["1".to_string(), "x".to_string()], Node::blank_leaf());
        combined.insert(&["1".to_string(), "y".to_string()], Node::blank_leaf());

        // "device" val's tree is flat (var="node"): a single leaf, no
        // interior nesting, even though the skeleton has two more levels.
        let flat = IndexTree {
            legend: Vec::new(),
            root: Node::Leaf {
                value: Some(Value::from_str("h")),
                time: None,
            },
        };
        let mut val_trees = HashMap::new();
        let mut by_host = HashMap::new();
        by_host.insert("h".to_string(), flat);
        val_trees.insert("device".to_string(), by_host);

        let rows = digest_vals("h", &combined, &val_trees, 42);
        assert_eq!(rows.len(), 2);
        for row in &rows {
            assert_eq!(row.fields.get("device"), Some(&Value::from_str("h")));
            assert_eq!(row.time, 42);
        }
    }
}
