//! C6: request orchestrator — the five-stage pipeline (spec.md §4.6, §5).
//!
//! `entry → do_scans → digest_scans → do_vals → digest_vals → do_functions
//! → final`, with an explicit barrier between stages: digestion and
//! trimming assume the previous stage's buffer is final, so stages run
//! strictly in sequence (spec.md §9, "do not parallelise stages"). Only
//! the cache calls inside `do_scans`/`do_vals` suspend; everything else
//! runs to completion without yielding.

use std::collections::{BTreeMap, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::cache::CacheClient;
use crate::config::InstanceDef;
use crate::function::{self, FunctionContext};
use crate::model::{RowRecord, Value};
use crate::scan::{combine_excludes, digest_scans, do_scans, parse_excludes, scan_vals_by_host};
use crate::tree::IndexTree;
use crate::value::{digest_vals, do_hostvars, do_vals};

/// Request parameters common to every composite method (spec.md §6
/// "Inbound RPC methods"). Per-composite `<input>` parameters are
/// validated by the caller before `run` is invoked (spec.md §7
/// "Configuration errors").
pub struct CompositeRequest {
    pub nodes: Vec<String>,
    pub period: u32,
    pub exclude_regexp: Vec<String>,
}

impl CompositeRequest {
    /// `period` defaults to 60 when absent (spec.md §4.6, §8).
    pub const DEFAULT_PERIOD: u32 = 60;
}

/// Run one composite instance's pipeline for a request. Every host in
/// `request.nodes` is present in the returned map, with an empty array if
/// no scan produced data for it (spec.md §4.6 "Result shape").
pub async fn run(
    cache: &dyn CacheClient,
    instance: &InstanceDef,
    request: &CompositeRequest,
) -> HashMap<String, Vec<RowRecord>> {
    let excludes = parse_excludes(&request.exclude_regexp);

    let by_scan = do_scans(cache, &request.nodes, instance, &excludes).await;

    let combined_scan = digest_scans(&request.nodes, instance, &by_scan);
    let scan_vals = scan_vals_by_host(&request.nodes, instance, &by_scan);
    let scan_exclude = combine_excludes(&request.nodes, &by_scan);
    for (host, excluded) in &scan_exclude {
        if !excluded.is_empty() {
            debug!(host, excluded = excluded.len(), "scan exclude filters applied");
        }
    }

    // do_vals's two sub-fan-outs (host variables, per-value fetches) run
    // concurrently (spec.md §4.3).
    let (hostvars, val_trees) = tokio::join!(
        do_hostvars(cache, &request.nodes),
        do_vals(
            cache,
            &request.nodes,
            instance,
            request.period,
            &combined_scan,
            &scan_vals,
        )
    );

    let now = wall_clock_seconds();
    let empty_tree = IndexTree::empty(Vec::new());
    let empty_hostvars = BTreeMap::new();

    let mut final_rows = HashMap::new();
    for host in &request.nodes {
        let scan_tree = combined_scan.get(host).unwrap_or(&empty_tree);
        let mut rows = digest_vals(host, scan_tree, &val_trees, now);
        apply_functions(
            instance,
            host,
            hostvars.get(host).unwrap_or(&empty_hostvars),
            &mut rows,
        );
        final_rows.insert(host.clone(), rows);
    }
    final_rows
}

/// Apply each val's function chain, in document order, to its current
/// value on every row (spec.md §4.4, §5 "ordered per (host, row, val_id) in
/// document order").
fn apply_functions(
    instance: &InstanceDef,
    host: &str,
    hostvars: &BTreeMap<String, Value>,
    rows: &mut [RowRecord],
) {
    for row in rows.iter_mut() {
        for val in &instance.vals {
            if val.fctns.is_empty() {
                continue;
            }
            let Some(current) = row.fields.get(&val.id).cloned() else {
                continue;
            };
            let result = {
                let ctx = FunctionContext {
                    row: &row.fields,
                    hostvars,
                    host,
                    val_id: &val.id,
                };
                function::apply_chain(current, &val.fctns, &ctx)
            };
            row.fields.insert(val.id.clone(), result);
        }
    }
}

fn wall_clock_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
