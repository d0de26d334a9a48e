//! The index-preserving nested tree (spec.md §3 "Nested index tree
//! invariants", §9 design note).
//!
//! The source conflates interior nodes and leaves (both are plain maps); a
//! leaf there is just a map that happens to hold `value`/`time` keys. That
//! makes "never trim `value`/`time`" an ad-hoc rule. Here a leaf is its own
//! variant, so trimming a value tree against a scan tree is a structural
//! walk with no special-cased keys at all.

use std::collections::BTreeMap;

use crate::model::Value;

/// `Interior(children)` is a branch keyed by the value taken by one index
/// variable; `Leaf` terminates a path. A "blank" leaf (`value: None, time:
/// None`) is the scan-phase placeholder for "this row exists, no data yet."
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Interior(BTreeMap<String, Node>),
    Leaf {
        value: Option<Value>,
        time: Option<i64>,
    },
}

impl Node {
    pub fn blank_leaf() -> Node {
        Node::Leaf {
            value: None,
            time: None,
        }
    }

    pub fn empty_interior() -> Node {
        Node::Interior(BTreeMap::new())
    }

    pub fn as_interior(&self) -> Option<&BTreeMap<String, Node>> {
        match self {
            Node::Interior(m) => Some(m),
            Node::Leaf { .. } => None,
        }
    }

    pub fn as_interior_mut(&mut self) -> Option<&mut BTreeMap<String, Node>> {
        match self {
            Node::Interior(m) => Some(m),
            Node::Leaf { .. } => None,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf { .. })
    }
}

/// A tree plus the ordered list of index-variable names that characterises
/// its depth (spec.md §3 "Legend").
#[derive(Debug, Clone, PartialEq)]
pub struct IndexTree {
    pub legend: Vec<String>,
    pub root: Node,
}

impl IndexTree {
    pub fn empty(legend: Vec<String>) -> Self {
        IndexTree {
            legend,
            root: Node::empty_interior(),
        }
    }

    /// Insert `leaf` at the path given by `keys`, creating interior nodes
    /// along the way. A path of zero keys replaces the root with the leaf
    /// directly (the degenerate scalar-OID case, legend empty).
    pub fn insert(&mut self, keys: &[String], leaf: Node) {
        if keys.is_empty() {
            self.root = leaf;
            return;
        }
        insert_at(&mut self.root, keys, leaf);
    }
}

fn insert_at(node: &mut Node, keys: &[String], leaf: Node) {
    if node.as_interior().is_none() {
        *node = Node::empty_interior();
    }
    let map = node.as_interior_mut().expect("just normalized to Interior");
    if keys.len() == 1 {
        map.insert(keys[0].clone(), leaf);
        return;
    }
    let child = map
        .entry(keys[0].clone())
        .or_insert_with(Node::empty_interior);
    insert_at(child, &keys[1..], leaf);
}

/// Recursive union of map keys: every key present in either side ends up in
/// the result; where both sides have a key, recurse. Leaves are never
/// reconciled against conflicting types — an already-present leaf (or an
/// already-present branch) wins, matching spec.md §4.2 "merges that meet at
/// leaves leave the existing leaf untouched."
pub fn union(dst: &mut Node, src: &Node) {
    match (dst, src) {
        (Node::Interior(dst_map), Node::Interior(src_map)) => {
            for (k, v) in src_map {
                match dst_map.get_mut(k) {
                    Some(existing) => union(existing, v),
                    None => {
                        dst_map.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        // Leaf vs leaf, or a type mismatch: additive-only means we never
        // overwrite what's already there.
        _ => {}
    }
}

/// Merge a shallower dependency scan's keys into the combined (deeper)
/// scan tree (spec.md §4.2 "merge its keys into the combined tree"). Unlike
/// [`union`], a key that doesn't exist yet in `dst` is inserted as an empty
/// interior rather than a verbatim copy of `src`'s leaf: a shallower scan
/// only contributes *key presence*, not a value, at a depth the combined
/// tree still has further dimensions below (spec.md §4.2 "shallower scans
/// contribute key presence only"; scenario 3, "any `a` key that exists in
/// `A` but not `B` is merged in as a branch without leaves").
pub fn merge_dependency(dst: &mut Node, src: &Node) {
    match (dst, src) {
        (Node::Interior(dst_map), Node::Interior(src_map)) => {
            for (k, v) in src_map {
                match dst_map.get_mut(k) {
                    Some(existing) => merge_dependency(existing, v),
                    None => {
                        dst_map.insert(k.clone(), presence_only(v));
                    }
                }
            }
        }
        _ => {}
    }
}

/// Strip a subtree down to key presence: every leaf becomes an empty
/// interior, every interior keeps its keys.
fn presence_only(src: &Node) -> Node {
    match src {
        Node::Leaf { .. } => Node::empty_interior(),
        Node::Interior(map) => Node::Interior(
            map.iter()
                .map(|(k, v)| (k.clone(), presence_only(v)))
                .collect(),
        ),
    }
}

/// Recursively delete any key present in `value` but absent from the
/// corresponding position in `scan` (spec.md §4.3 step 3, and the §9 open
/// question resolving `_trim_data` to a genuine recursive delete). Once
/// either side bottoms out at a leaf, the rest of the subtree beneath it is
/// kept as-is — there's nothing further to compare.
pub fn trim(value: &Node, scan: &Node) -> Node {
    match (value, scan) {
        (Node::Interior(value_map), Node::Interior(scan_map)) => {
            let mut out = BTreeMap::new();
            for (k, v) in value_map {
                if let Some(scan_child) = scan_map.get(k) {
                    out.insert(k.clone(), trim(v, scan_child));
                }
            }
            Node::Interior(out)
        }
        _ => value.clone(),
    }
}

/// Flatten a tree into an ordered list of `(keys, value, time)` leaves that
/// carry a `value`/`time` pair, walking in key order. Blank leaves (no
/// value yet) are skipped — used to read out scan-only trees is not needed
/// here; `digest_vals` walks skeleton + value trees in lockstep instead (see
/// `value.rs`).
pub fn flatten_defined(node: &Node) -> Vec<(Vec<String>, Value, Option<i64>)> {
    let mut out = Vec::new();
    flatten_into(node, &mut Vec::new(), &mut out);
    out
}

fn flatten_into(
    node: &Node,
    path: &mut Vec<String>,
    out: &mut Vec<(Vec<String>, Value, Option<i64>)>,
) {
    match node {
        Node::Interior(map) => {
            for (k, child) in map {
                path.push(k.clone());
                flatten_into(child, path, out);
                path.pop();
            }
        }
        Node::Leaf { value: Some(v), time } => {
            out.push((path.clone(), v.clone(), *time));
        }
        Node::Leaf { value: None, .. } => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(v: &str) -> Node {
        Node::Leaf {
            value: Some(Value::from_str(v)),
            time: Some(1000),
        }
    }

    #[test]
    fn insert_builds_nested_path() {
        let mut t = IndexTree::empty(vec!["a".into(), "b".into()]);
        t.insert(&["1".into(), "2".into()], leaf("x"));
        t.insert(&["1".into(), "3".into()], leaf("y"));
        let top = t.root.as_interior().unwrap();
        assert_eq!(top.len(), 1);
        let inner = top.get("1").unwrap().as_interior().unwrap();
        assert_eq!(inner.len(), 2);
    }

    #[test]
    fn union_is_additive_and_idempotent() {
        let mut a = Node::empty_interior();
        insert_at(&mut a, &["1".into()], Node::blank_leaf());
        let b = a.clone();
        union(&mut a, &b);
        assert_eq!(a, b);

        let mut c = Node::empty_interior();
        insert_at(&mut c, &["2".into()], Node::blank_leaf());
        union(&mut a, &c);
        let merged = a.as_interior().unwrap();
        assert!(merged.contains_key("1"));
        assert!(merged.contains_key("2"));
    }

    #[test]
    fn union_preserves_existing_leaf_on_conflict() {
        let mut a = Node::empty_interior();
        insert_at(&mut a, &["1".into()], leaf("first"));
        let mut b = Node::empty_interior();
        insert_at(&mut b, &["1".into()], leaf("second"));
        union(&mut a, &b);
        assert_eq!(a.as_interior().unwrap().get("1").unwrap(), &leaf("first"));
    }

    #[test]
    fn trim_drops_keys_absent_from_scan() {
        let mut value_tree = Node::empty_interior();
        insert_at(&mut value_tree, &["1".into()], leaf("eth0"));
        insert_at(&mut value_tree, &["2".into()], leaf("eth1"));

        let mut scan_tree = Node::empty_interior();
        insert_at(&mut scan_tree, &["1".into()], Node::blank_leaf());

        let trimmed = trim(&value_tree, &scan_tree);
        let map = trimmed.as_interior().unwrap();
        assert_eq!(map.len(), 1);
        assert!(map.contains_key("1"));
    }

    #[test]
    fn flatten_skips_blank_leaves() {
        let mut t = Node::empty_interior();
        insert_at(&mut t, &["1".into()], leaf("x"));
        insert_at(&mut t, &["2".into()], Node::blank_leaf());
        let out = flatten_defined(&t);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, vec!["1".to_string()]);
    }
}
