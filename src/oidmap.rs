//! C1: OID pattern parsing and the OID-to-tree transform (spec.md §4.1).

use once_cell::sync::Lazy;
use regex::Regex;

use crate::model::Value;
use crate::tree::{IndexTree, Node};

static IDENT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_-]*$").unwrap());

/// A parsed OID pattern: its dotted tokens, the position of each named
/// variable token, and the trunk (last fixed token before the first
/// variable).
#[derive(Debug, Clone, PartialEq)]
pub struct OidMap {
    pub split_oid: Vec<String>,
    /// Variable name -> token position, in pattern order.
    pub vars: Vec<(String, usize)>,
    pub trunk: usize,
}

impl OidMap {
    /// The fixed OID prefix used as the cache scan/fetch key: the first
    /// `trunk + 1` dotted tokens.
    pub fn oid_base(&self) -> String {
        self.split_oid[..=self.trunk].join(".")
    }

    /// The ordered list of variable names — the legend a tree built from
    /// this map will carry.
    pub fn legend(&self) -> Vec<String> {
        self.vars.iter().map(|(name, _)| name.clone()).collect()
    }
}

/// Parse a dotted OID pattern into an [`OidMap`].
///
/// A scan's raw config `oid` (e.g. `1.3.6.1.2.1.31.1.1.1.18.*`) uses a
/// literal `*` for its single variable position; callers substitute the
/// scan's `var` name for that token before calling this (see
/// `resolve_scan_pattern`) so the identifier grammar below can find it.
/// A value's `oid` already spells out variable names directly in the
/// pattern (e.g. `...31.1.1.1.6.name`), so it's passed through unchanged.
pub fn map_oid(pattern: &str) -> OidMap {
    let split_oid: Vec<String> = pattern.split('.').map(|s| s.to_string()).collect();
    let mut vars = Vec::new();
    for (i, tok) in split_oid.iter().enumerate() {
        if IDENT_RE.is_match(tok) {
            vars.push((tok.clone(), i));
        }
    }
    let trunk = match vars.first() {
        Some((_, idx)) if *idx > 0 => idx - 1,
        Some(_) => 0,
        None => split_oid.len().saturating_sub(1),
    };
    OidMap {
        split_oid,
        vars,
        trunk,
    }
}

/// Replace the literal `*` wildcard token in a scan's config `oid` with its
/// `var` name, producing a pattern `map_oid` can parse.
pub fn resolve_scan_pattern(oid: &str, var: &str) -> String {
    oid.split('.')
        .map(|tok| if tok == "*" { var } else { tok })
        .collect::<Vec<_>>()
        .join(".")
}

/// What a leaf holds after folding a set of OIDs into a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformMode {
    /// Every leaf becomes an empty placeholder — used for the scan's
    /// "row exists" tree.
    Blank,
    /// Leaf carries the raw value, time dropped (scan stamps one time per
    /// row later) — used for `scan_vals`.
    Scan,
    /// Leaf carries the original `{value, time}` pair — used for values.
    Default,
}

/// Fold `rows` (fully-qualified OID -> sample) into a nested tree keyed by
/// the values taken by each of `map`'s variable positions, in pattern
/// order. Deterministic and order-independent in the input list, since
/// each row's path is computed independently and inserted into a sorted
/// map.
pub fn transform_oids(
    rows: &[(String, Option<Value>, Option<i64>)],
    map: &OidMap,
    mode: TransformMode,
) -> IndexTree {
    let legend = map.legend();
    let mut tree = IndexTree::empty(legend);
    for (oid, value, time) in rows {
        let tokens: Vec<&str> = oid.split('.').collect();
        let keys: Vec<String> = map
            .vars
            .iter()
            .filter_map(|(_, idx)| tokens.get(*idx).map(|s| s.to_string()))
            .collect();
        if keys.len() != map.vars.len() {
            // OID shorter than the pattern expects at a variable position;
            // not a well-formed member of this OID's namespace. Skip it.
            continue;
        }
        let leaf = match mode {
            TransformMode::Blank => Node::blank_leaf(),
            TransformMode::Scan => Node::Leaf {
                value: value.clone(),
                time: None,
            },
            TransformMode::Default => Node::Leaf {
                value: value.clone(),
                time: *time,
            },
        };
        tree.insert(&keys, leaf);
    }
    tree
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_oid_finds_trunk_before_variable() {
        let m = map_oid("1.3.6.1.2.1.31.1.1.1.18.name");
        assert_eq!(m.trunk, 9);
        assert_eq!(m.vars, vec![("name".to_string(), 10)]);
        assert_eq!(m.oid_base(), "1.3.6.1.2.1.31.1.1.1.18");
    }

    #[test]
    fn map_oid_with_no_variable_is_scalar() {
        let m = map_oid("1.3.6.1.2.1.1.3.0");
        assert!(m.vars.is_empty());
        assert_eq!(m.trunk, 7);
    }

    #[test]
    fn map_oid_variable_at_position_zero() {
        let m = map_oid("name");
        assert_eq!(m.trunk, 0);
        assert_eq!(m.vars, vec![("name".to_string(), 0)]);
    }

    #[test]
    fn resolve_scan_pattern_substitutes_wildcard() {
        assert_eq!(
            resolve_scan_pattern("1.3.6.1.2.1.31.1.1.1.18.*", "name"),
            "1.3.6.1.2.1.31.1.1.1.18.name"
        );
    }

    #[test]
    fn transform_oids_is_order_independent() {
        let map = map_oid("1.2.3.name");
        let rows_a = vec![
            ("1.2.3.1".to_string(), Some(Value::from_str("eth0")), Some(100)),
            ("1.2.3.2".to_string(), Some(Value::from_str("eth1")), Some(100)),
        ];
        let mut rows_b = rows_a.clone();
        rows_b.reverse();

        let tree_a = transform_oids(&rows_a, &map, TransformMode::Default);
        let tree_b = transform_oids(&rows_b, &map, TransformMode::Default);
        assert_eq!(tree_a, tree_b);
    }

    #[test]
    fn transform_oids_blank_mode_drops_value_and_time() {
        let map = map_oid("1.2.3.name");
        let rows = vec![("1.2.3.1".to_string(), Some(Value::from_str("eth0")), Some(100))];
        let tree = transform_oids(&rows, &map, TransformMode::Blank);
        let leaf = tree.root.as_interior().unwrap().get("1").unwrap();
        assert_eq!(leaf, &Node::blank_leaf());
    }
}
