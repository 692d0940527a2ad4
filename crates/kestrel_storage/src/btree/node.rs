//! Copy-on-write B-tree nodes.
//!
//! Nodes are shared between snapshots through `Arc`. Every mutation goes
//! through `Arc::make_mut`, which clones a node whenever another snapshot
//! can still reach it, so a published node is never written again. Branches
//! keep per-child key counts, which makes positional lookups O(log n).
//! All leaves sit at the same depth.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::value::ValueLocation;

pub(crate) const MAX_LEAF_ENTRIES: usize = 32;
pub(crate) const MAX_BRANCH_CHILDREN: usize = 32;
const MIN_FILL: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafEntry {
    pub key: Arc<[u8]>,
    pub value: ValueLocation,
}

#[derive(Debug, Clone)]
pub(crate) enum Node {
    Leaf(Vec<LeafEntry>),
    Branch(Branch),
}

#[derive(Debug, Clone)]
pub(crate) struct Branch {
    pub children: Vec<Arc<Node>>,
    /// First key of each child.
    pub keys: Vec<Arc<[u8]>>,
    /// Number of keys under each child.
    pub counts: Vec<u64>,
}

/// Compare a stored key against the concatenation `prefix ++ key` without
/// building it. Unsigned lexicographic; a strict prefix sorts first.
pub(crate) fn cmp_with_prefix(stored: &[u8], prefix: &[u8], key: &[u8]) -> Ordering {
    let p = prefix.len().min(stored.len());
    match stored[..p].cmp(&prefix[..p]) {
        Ordering::Equal => {}
        other => return other,
    }
    if stored.len() < prefix.len() {
        return Ordering::Less;
    }
    stored[prefix.len()..].cmp(key)
}

impl Node {
    pub fn len(&self) -> usize {
        match self {
            Node::Leaf(entries) => entries.len(),
            Node::Branch(b) => b.children.len(),
        }
    }

    pub fn key_count(&self) -> u64 {
        match self {
            Node::Leaf(entries) => entries.len() as u64,
            Node::Branch(b) => b.counts.iter().sum(),
        }
    }

    pub fn first_key(&self) -> Option<&Arc<[u8]>> {
        match self {
            Node::Leaf(entries) => entries.first().map(|e| &e.key),
            Node::Branch(b) => b.keys.first(),
        }
    }
}

impl Branch {
    pub fn from_children(children: Vec<Arc<Node>>) -> Self {
        let mut branch = Branch {
            keys: Vec::with_capacity(children.len()),
            counts: Vec::with_capacity(children.len()),
            children,
        };
        for child in &branch.children {
            branch.keys.push(child.first_key().cloned().unwrap_or_else(|| Arc::from(&[][..])));
            branch.counts.push(child.key_count());
        }
        branch
    }

    /// Child whose range may contain `prefix ++ key`.
    pub fn route(&self, prefix: &[u8], key: &[u8]) -> usize {
        self.keys
            .partition_point(|k| cmp_with_prefix(k, prefix, key) != Ordering::Greater)
            .saturating_sub(1)
    }

    pub fn offset_of(&self, child: usize) -> u64 {
        self.counts[..child].iter().sum()
    }

    /// Child holding the key at `index`, and the index relative to it.
    pub fn child_for_index(&self, mut index: u64) -> (usize, u64) {
        for (i, count) in self.counts.iter().enumerate() {
            if index < *count {
                return (i, index);
            }
            index -= count;
        }
        let last = self.children.len() - 1;
        (last, self.counts[last].saturating_sub(1))
    }

    /// Re-derive cached key/count of child `i`; removes it when empty.
    fn refresh(&mut self, i: usize) {
        let count = self.children[i].key_count();
        if count == 0 {
            self.children.remove(i);
            self.keys.remove(i);
            self.counts.remove(i);
            return;
        }
        self.counts[i] = count;
        if let Some(key) = self.children[i].first_key() {
            self.keys[i] = Arc::clone(key);
        }
    }

    fn insert_child(&mut self, at: usize, child: Arc<Node>) {
        self.keys
            .insert(at, child.first_key().cloned().unwrap_or_else(|| Arc::from(&[][..])));
        self.counts.insert(at, child.key_count());
        self.children.insert(at, child);
    }

    fn split_off_half(&mut self) -> Branch {
        let mid = self.children.len() / 2;
        Branch {
            children: self.children.split_off(mid),
            keys: self.keys.split_off(mid),
            counts: self.counts.split_off(mid),
        }
    }
}

pub(crate) struct Upsert {
    pub created: bool,
    /// Position of the key relative to the node that was updated.
    pub index: u64,
    pub split: Option<Arc<Node>>,
}

/// Insert or replace `key`. A returned split is the new right sibling.
pub(crate) fn upsert(node: &mut Arc<Node>, key: &[u8], value: ValueLocation) -> Upsert {
    match Arc::make_mut(node) {
        Node::Leaf(entries) => match entries.binary_search_by(|e| e.key[..].cmp(key)) {
            Ok(i) => {
                entries[i].value = value;
                Upsert {
                    created: false,
                    index: i as u64,
                    split: None,
                }
            }
            Err(i) => {
                entries.insert(
                    i,
                    LeafEntry {
                        key: Arc::from(key),
                        value,
                    },
                );
                let split = (entries.len() > MAX_LEAF_ENTRIES).then(|| {
                    let right = entries.split_off(entries.len() / 2);
                    Arc::new(Node::Leaf(right))
                });
                Upsert {
                    created: true,
                    index: i as u64,
                    split,
                }
            }
        },
        Node::Branch(b) => {
            let ci = b.route(&[], key);
            let base = b.offset_of(ci);
            let inner = upsert(&mut b.children[ci], key, value);
            b.refresh(ci);
            if let Some(right) = inner.split {
                b.insert_child(ci + 1, right);
            }
            let split = (b.children.len() > MAX_BRANCH_CHILDREN)
                .then(|| Arc::new(Node::Branch(b.split_off_half())));
            Upsert {
                created: inner.created,
                index: base + inner.index,
                split,
            }
        }
    }
}

/// Remove the keys at positions `from..to` relative to `node`.
///
/// Children that fall entirely inside the range are unlinked without being
/// visited; only the (at most two) partially covered children per level are
/// descended into.
pub(crate) fn erase(node: &mut Arc<Node>, from: u64, to: u64) {
    match Arc::make_mut(node) {
        Node::Leaf(entries) => {
            let end = (to as usize).min(entries.len());
            entries.drain((from as usize).min(end)..end);
        }
        Node::Branch(b) => {
            let mut offset = 0u64;
            let mut i = 0usize;
            while i < b.children.len() && offset < to {
                let start = offset;
                let end = offset + b.counts[i];
                offset = end;
                if end <= from {
                    i += 1;
                    continue;
                }
                if from <= start && end <= to {
                    b.children.remove(i);
                    b.keys.remove(i);
                    b.counts.remove(i);
                    continue;
                }
                erase(&mut b.children[i], from.max(start) - start, to.min(end) - start);
                let before = b.children.len();
                b.refresh(i);
                if b.children.len() == before {
                    i += 1;
                }
            }
            fix_underflow(b);
        }
    }
}

fn fix_underflow(b: &mut Branch) {
    let mut i = 0;
    while i < b.children.len() {
        if b.children.len() > 1 && b.children[i].len() < MIN_FILL {
            let j = if i + 1 < b.children.len() { i } else { i - 1 };
            if !merge_pair(b, j) {
                i += 1;
                continue;
            }
            i = j;
            continue;
        }
        i += 1;
    }
}

fn into_owned(node: Arc<Node>) -> Node {
    Arc::try_unwrap(node).unwrap_or_else(|shared| (*shared).clone())
}

/// Merge children `j` and `j + 1`, or redistribute them evenly when the
/// union does not fit one node. Returns `false` if nothing changed.
fn merge_pair(b: &mut Branch, j: usize) -> bool {
    let right = b.children.remove(j + 1);
    b.keys.remove(j + 1);
    b.counts.remove(j + 1);
    let left = std::mem::replace(&mut b.children[j], Arc::new(Node::Leaf(Vec::new())));
    let (merged, extra) = match (into_owned(left), into_owned(right)) {
        (Node::Leaf(mut l), Node::Leaf(r)) => {
            l.extend(r);
            if l.len() > MAX_LEAF_ENTRIES {
                let tail = l.split_off(l.len() / 2);
                (Node::Leaf(l), Some(Node::Leaf(tail)))
            } else {
                (Node::Leaf(l), None)
            }
        }
        (Node::Branch(mut l), Node::Branch(r)) => {
            l.children.extend(r.children);
            l.keys.extend(r.keys);
            l.counts.extend(r.counts);
            if l.children.len() > MAX_BRANCH_CHILDREN {
                let tail = l.split_off_half();
                (Node::Branch(l), Some(Node::Branch(tail)))
            } else {
                (Node::Branch(l), None)
            }
        }
        (l, r) => {
            // Depths differ; leave the pair as it was.
            b.children[j] = Arc::new(l);
            b.insert_child(j + 1, Arc::new(r));
            b.refresh(j);
            return false;
        }
    };
    let changed = extra.is_none();
    b.children[j] = Arc::new(merged);
    b.refresh(j);
    if let Some(extra) = extra {
        b.insert_child(j + 1, Arc::new(extra));
    }
    changed || b.children[j].len() >= MIN_FILL
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cmp_with_prefix_matches_concatenation() {
        let cases: &[(&[u8], &[u8], &[u8])] = &[
            (b"abc", b"ab", b"c"),
            (b"ab", b"ab", b"c"),
            (b"abd", b"ab", b"c"),
            (b"a", b"ab", b""),
            (b"b", b"ab", b""),
            (b"", b"", b""),
            (b"\xff", b"", b"\x00"),
        ];
        for (stored, prefix, key) in cases {
            let mut full = prefix.to_vec();
            full.extend_from_slice(key);
            assert_eq!(
                cmp_with_prefix(stored, prefix, key),
                stored[..].cmp(&full[..]),
                "stored={:?} prefix={:?} key={:?}",
                stored,
                prefix,
                key
            );
        }
    }

    #[test]
    fn test_child_for_index() {
        let leaf = |n: u8| {
            Arc::new(Node::Leaf(
                (0..n)
                    .map(|i| LeafEntry {
                        key: Arc::from(&[n, i][..]),
                        value: ValueLocation::EMPTY,
                    })
                    .collect(),
            ))
        };
        let b = Branch::from_children(vec![leaf(3), leaf(2), leaf(4)]);
        assert_eq!(b.child_for_index(0), (0, 0));
        assert_eq!(b.child_for_index(3), (1, 0));
        assert_eq!(b.child_for_index(5), (2, 0));
        assert_eq!(b.child_for_index(8), (2, 3));
        assert_eq!(b.offset_of(2), 5);
    }
}
