//! Persistent ordered map from key bytes to [`ValueLocation`].
//!
//! A [`BTreeRoot`] is one versioned snapshot. Cloning it is O(1); writes
//! through a clone copy only the root-to-leaf path they touch and share
//! everything else with the original. Keys are ordered byte-lexicographically
//! with a strict prefix sorting first.
//!
//! Cursors are explicit path stacks (`Vec<PathStep>`) so scans can be
//! suspended and resumed without recursion.

mod node;

use std::sync::Arc;

use kestrel_common::error::StorageError;
use kestrel_common::types::{FileId, TransactionId};

use crate::value::ValueLocation;

pub use node::LeafEntry;
use node::{cmp_with_prefix, Branch, Node, MAX_BRANCH_CHILDREN, MAX_LEAF_ENTRIES};

/// Outcome of a key lookup; the accompanying index is the key the cursor
/// was left on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindResult {
    Exact,
    /// Key absent; cursor on the greatest smaller key.
    Previous,
    /// Key absent and smaller than everything; cursor on the first key.
    Next,
    /// Tree empty.
    NotFound,
}

/// One level of a cursor path: a node and the child/entry index within it.
#[derive(Debug, Clone)]
pub struct PathStep {
    node: Arc<Node>,
    idx: usize,
}

impl PathStep {
    fn child(&self) -> Option<Arc<Node>> {
        match &*self.node {
            Node::Branch(b) => b.children.get(self.idx).cloned(),
            Node::Leaf(_) => None,
        }
    }
}

/// Entry under the cursor.
pub fn current_entry(stack: &[PathStep]) -> Option<&LeafEntry> {
    let step = stack.last()?;
    match &*step.node {
        Node::Leaf(entries) => entries.get(step.idx),
        Node::Branch(_) => None,
    }
}

fn descend(stack: &mut Vec<PathStep>, leftmost: bool) {
    while let Some(child) = stack.last().and_then(PathStep::child) {
        let idx = if leftmost {
            0
        } else {
            child.len().saturating_sub(1)
        };
        stack.push(PathStep { node: child, idx });
    }
}

/// Advance the cursor. Returns `false`, leaving it in place, at the end.
pub fn find_next_key(stack: &mut Vec<PathStep>) -> bool {
    let Some(level) = (0..stack.len())
        .rev()
        .find(|&l| stack[l].idx + 1 < stack[l].node.len())
    else {
        return false;
    };
    stack.truncate(level + 1);
    stack[level].idx += 1;
    descend(stack, true);
    true
}

/// Step the cursor back. Returns `false`, leaving it in place, at the start.
pub fn find_previous_key(stack: &mut Vec<PathStep>) -> bool {
    let Some(level) = (0..stack.len()).rev().find(|&l| stack[l].idx > 0) else {
        return false;
    };
    stack.truncate(level + 1);
    stack[level].idx -= 1;
    descend(stack, false);
    true
}

/// Versioned snapshot of the whole keyspace.
#[derive(Debug, Clone)]
pub struct BTreeRoot {
    root: Option<Arc<Node>>,
    pub transaction_id: TransactionId,
    pub commit_ulong: u64,
    /// Log position as of this snapshot's commit; recovery resumes here.
    pub trlog_file_id: FileId,
    pub trlog_offset: u64,
}

impl BTreeRoot {
    pub fn new(transaction_id: TransactionId) -> Self {
        Self {
            root: None,
            transaction_id,
            commit_ulong: 0,
            trlog_file_id: FileId::NONE,
            trlog_offset: 0,
        }
    }

    /// Private copy for the next writer.
    pub fn new_transaction_root(&self) -> BTreeRoot {
        let mut next = self.clone();
        next.transaction_id = self.transaction_id.next();
        next
    }

    /// Another handle on this snapshot: same transaction id, every node
    /// shared.
    pub fn clone_root(&self) -> BTreeRoot {
        self.clone()
    }

    /// True when both roots share the same tree (not merely equal contents).
    pub fn same_tree(&self, other: &BTreeRoot) -> bool {
        match (&self.root, &other.root) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }

    pub fn calc_key_count(&self) -> u64 {
        self.root.as_ref().map_or(0, |r| r.key_count())
    }

    /// Locate `prefix ++ key`, leaving `stack` on the resulting entry.
    pub fn find_key(
        &self,
        stack: &mut Vec<PathStep>,
        prefix: &[u8],
        key: &[u8],
    ) -> (FindResult, u64) {
        stack.clear();
        let Some(mut node) = self.root.clone() else {
            return (FindResult::NotFound, 0);
        };
        let mut base = 0u64;
        loop {
            let child = match &*node {
                Node::Branch(b) => {
                    let ci = b.route(prefix, key);
                    base += b.offset_of(ci);
                    stack.push(PathStep {
                        node: Arc::clone(&node),
                        idx: ci,
                    });
                    Arc::clone(&b.children[ci])
                }
                Node::Leaf(entries) => {
                    let found =
                        entries.binary_search_by(|e| cmp_with_prefix(&e.key, prefix, key));
                    let (result, idx) = match found {
                        Ok(i) => (FindResult::Exact, i),
                        Err(0) => (FindResult::Next, 0),
                        Err(i) => (FindResult::Previous, i - 1),
                    };
                    stack.push(PathStep {
                        node: Arc::clone(&node),
                        idx,
                    });
                    return (result, base + idx as u64);
                }
            };
            node = child;
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<ValueLocation> {
        let mut stack = Vec::new();
        match self.find_key(&mut stack, &[], key) {
            (FindResult::Exact, _) => current_entry(&stack).map(|e| e.value),
            _ => None,
        }
    }

    /// Insert or overwrite `key`. Returns whether it was created and its
    /// index after the operation.
    pub fn create_or_update(&mut self, key: &[u8], value: ValueLocation) -> (bool, u64) {
        let Some(root) = self.root.as_mut() else {
            self.root = Some(Arc::new(Node::Leaf(vec![LeafEntry {
                key: Arc::from(key),
                value,
            }])));
            return (true, 0);
        };
        let result = node::upsert(root, key, value);
        if let Some(right) = result.split {
            let left = Arc::clone(root);
            *root = Arc::new(Node::Branch(Branch::from_children(vec![left, right])));
        }
        (result.created, result.index)
    }

    /// Overwrite the value of `key` only if it still points at `expected`.
    pub fn replace_value_if(
        &mut self,
        key: &[u8],
        expected: &ValueLocation,
        value: ValueLocation,
    ) -> bool {
        if self.get(key).as_ref() != Some(expected) {
            return false;
        }
        self.create_or_update(key, value);
        true
    }

    /// Remove the keys at indexes `first..=last`.
    pub fn erase_range(&mut self, first: u64, last: u64) {
        if first > last {
            return;
        }
        let count = self.calc_key_count();
        if first >= count {
            return;
        }
        let Some(root) = self.root.as_mut() else {
            return;
        };
        node::erase(root, first, (last + 1).min(count));
        self.normalize_root();
    }

    fn normalize_root(&mut self) {
        while let Some(root) = self.root.take() {
            match &*root {
                _ if root.key_count() == 0 => return,
                Node::Branch(b) if b.children.len() == 1 => {
                    self.root = Some(Arc::clone(&b.children[0]));
                }
                _ => {
                    self.root = Some(root);
                    return;
                }
            }
        }
    }

    /// Position `stack` on the key at `index` (must be < key count).
    pub fn fill_stack_by_index(&self, stack: &mut Vec<PathStep>, mut index: u64) {
        stack.clear();
        let Some(mut node) = self.root.clone() else {
            return;
        };
        loop {
            let child = match &*node {
                Node::Leaf(entries) => {
                    let idx = (index as usize).min(entries.len().saturating_sub(1));
                    stack.push(PathStep {
                        node: Arc::clone(&node),
                        idx,
                    });
                    return;
                }
                Node::Branch(b) => {
                    let (ci, rel) = b.child_for_index(index);
                    index = rel;
                    stack.push(PathStep {
                        node: Arc::clone(&node),
                        idx: ci,
                    });
                    Arc::clone(&b.children[ci])
                }
            };
            node = child;
        }
    }

    /// Replace the tree with `count` entries from `next`, which must yield
    /// strictly ascending keys. A violation aborts the load with
    /// `UnsortedBulkLoad` and leaves the tree unchanged.
    pub fn build_tree<F>(&mut self, count: u64, mut next: F) -> Result<(), StorageError>
    where
        F: FnMut() -> Result<LeafEntry, StorageError>,
    {
        if count == 0 {
            self.root = None;
            return Ok(());
        }
        let mut level: Vec<Arc<Node>> = Vec::new();
        let mut previous: Option<Arc<[u8]>> = None;
        let mut position = 0u64;
        for size in even_chunks(count, MAX_LEAF_ENTRIES as u64) {
            let mut entries = Vec::with_capacity(size as usize);
            for _ in 0..size {
                let entry = next()?;
                if let Some(prev) = &previous {
                    if prev[..] >= entry.key[..] {
                        return Err(StorageError::UnsortedBulkLoad(position));
                    }
                }
                previous = Some(Arc::clone(&entry.key));
                entries.push(entry);
                position += 1;
            }
            level.push(Arc::new(Node::Leaf(entries)));
        }
        while level.len() > 1 {
            let mut upper = Vec::new();
            let mut children = level.into_iter();
            for size in even_chunks(children.len() as u64, MAX_BRANCH_CHILDREN as u64) {
                let group: Vec<Arc<Node>> = children.by_ref().take(size as usize).collect();
                upper.push(Arc::new(Node::Branch(Branch::from_children(group))));
            }
            level = upper;
        }
        self.root = level.pop();
        Ok(())
    }

    /// Ordered iteration over every entry.
    pub fn iter(&self) -> Iter {
        self.iter_range(0, u64::MAX)
    }

    /// At most `count` entries starting at index `first`.
    pub fn iter_range(&self, first: u64, count: u64) -> Iter {
        let mut stack = Vec::new();
        let remaining = self.calc_key_count().saturating_sub(first).min(count);
        if remaining > 0 {
            self.fill_stack_by_index(&mut stack, first);
        }
        Iter {
            stack,
            remaining,
            started: false,
        }
    }
}

/// Split `total` into the fewest chunks of at most `max`, sized as evenly
/// as possible.
fn even_chunks(total: u64, max: u64) -> impl Iterator<Item = u64> {
    let chunks = total.div_ceil(max).max(1);
    let base = total / chunks;
    let extra = total % chunks;
    (0..chunks).map(move |i| base + u64::from(i < extra))
}

pub struct Iter {
    stack: Vec<PathStep>,
    remaining: u64,
    started: bool,
}

impl Iterator for Iter {
    type Item = LeafEntry;

    fn next(&mut self) -> Option<LeafEntry> {
        if self.remaining == 0 {
            return None;
        }
        if self.started && !find_next_key(&mut self.stack) {
            self.remaining = 0;
            return None;
        }
        self.started = true;
        self.remaining -= 1;
        current_entry(&self.stack).cloned()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining as usize, Some(self.remaining as usize))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn loc(n: u32) -> ValueLocation {
        ValueLocation {
            file_id: FileId(1),
            offset: n,
            size: 1,
        }
    }

    fn key(n: u32) -> Vec<u8> {
        format!("k{:06}", n).into_bytes()
    }

    fn filled(n: u32) -> BTreeRoot {
        let mut root = BTreeRoot::new(TransactionId(1));
        for i in 0..n {
            root.create_or_update(&key(i), loc(i));
        }
        root
    }

    fn keys(root: &BTreeRoot) -> Vec<Vec<u8>> {
        root.iter().map(|e| e.key.to_vec()).collect()
    }

    #[test]
    fn test_insert_reports_created_and_index() {
        let mut root = BTreeRoot::new(TransactionId(1));
        assert_eq!(root.create_or_update(b"b", loc(1)), (true, 0));
        assert_eq!(root.create_or_update(b"a", loc(2)), (true, 0));
        assert_eq!(root.create_or_update(b"c", loc(3)), (true, 2));
        assert_eq!(root.create_or_update(b"b", loc(4)), (false, 1));
        assert_eq!(root.get(b"b"), Some(loc(4)));
        assert_eq!(root.calc_key_count(), 3);
    }

    #[test]
    fn test_find_key_results() {
        let root = filled(1000);
        let mut stack = Vec::new();
        assert_eq!(root.find_key(&mut stack, b"", &key(500)), (FindResult::Exact, 500));
        let mut between = key(500);
        between.push(0);
        assert_eq!(root.find_key(&mut stack, b"", &between), (FindResult::Previous, 500));
        assert_eq!(current_entry(&stack).unwrap().key[..], key(500)[..]);
        assert_eq!(root.find_key(&mut stack, b"", b"a"), (FindResult::Next, 0));
        assert_eq!(root.find_key(&mut stack, b"", b"z"), (FindResult::Previous, 999));
        assert_eq!(
            BTreeRoot::new(TransactionId(0)).find_key(&mut stack, b"", b"a").0,
            FindResult::NotFound
        );
    }

    #[test]
    fn test_find_key_with_prefix() {
        let root = filled(100);
        let mut stack = Vec::new();
        assert_eq!(root.find_key(&mut stack, b"k0000", b"42"), (FindResult::Exact, 42));
    }

    #[test]
    fn test_writes_do_not_touch_older_snapshot() {
        let committed = filled(500);
        let mut next = committed.new_transaction_root();
        assert_eq!(next.transaction_id, TransactionId(2));
        next.create_or_update(b"new", loc(9));
        next.erase_range(0, 99);
        assert_eq!(committed.calc_key_count(), 500);
        assert_eq!(committed.get(&key(0)), Some(loc(0)));
        assert_eq!(committed.get(b"new"), None);
        assert_eq!(next.calc_key_count(), 401);
    }

    #[test]
    fn test_erase_range_middle_and_all() {
        let mut root = filled(2000);
        root.erase_range(10, 1989);
        assert_eq!(root.calc_key_count(), 20);
        let expected: Vec<Vec<u8>> = (0..10).chain(1990..2000).map(key).collect();
        assert_eq!(keys(&root), expected);
        root.erase_range(0, 19);
        assert_eq!(root.calc_key_count(), 0);
        assert!(root.iter().next().is_none());
        root.create_or_update(b"again", loc(1));
        assert_eq!(root.calc_key_count(), 1);
    }

    #[test]
    fn test_cursor_walks_both_directions() {
        let root = filled(300);
        let mut stack = Vec::new();
        root.fill_stack_by_index(&mut stack, 0);
        let mut seen = 1;
        while find_next_key(&mut stack) {
            seen += 1;
        }
        assert_eq!(seen, 300);
        assert_eq!(current_entry(&stack).unwrap().key[..], key(299)[..]);
        let mut back = 1;
        while find_previous_key(&mut stack) {
            back += 1;
        }
        assert_eq!(back, 300);
        assert_eq!(current_entry(&stack).unwrap().key[..], key(0)[..]);
    }

    #[test]
    fn test_fill_stack_by_index_matches_iteration() {
        let root = filled(777);
        let all = keys(&root);
        let mut stack = Vec::new();
        for i in [0u64, 1, 31, 32, 33, 400, 776] {
            root.fill_stack_by_index(&mut stack, i);
            assert_eq!(current_entry(&stack).unwrap().key.to_vec(), all[i as usize]);
        }
    }

    #[test]
    fn test_iter_range_clamps() {
        let root = filled(100);
        let all = keys(&root);
        let slice: Vec<Vec<u8>> = root.iter_range(40, 25).map(|e| e.key.to_vec()).collect();
        assert_eq!(slice, all[40..65].to_vec());
        assert_eq!(root.iter_range(90, 50).count(), 10);
        assert_eq!(root.iter_range(100, 5).count(), 0);
    }

    #[test]
    fn test_build_tree_bulk_load() {
        let mut root = BTreeRoot::new(TransactionId(0));
        let mut i = 0;
        root.build_tree(5000, || {
            i += 1;
            Ok(LeafEntry {
                key: Arc::from(&key(i - 1)[..]),
                value: loc(i - 1),
            })
        })
        .unwrap();
        assert_eq!(root.calc_key_count(), 5000);
        assert_eq!(root.get(&key(4321)), Some(loc(4321)));
        root.create_or_update(b"k004321x", loc(1));
        assert_eq!(root.calc_key_count(), 5001);
    }

    #[test]
    fn test_build_tree_rejects_unsorted() {
        let mut root = filled(3);
        let mut input = vec![key(1), key(3), key(2)].into_iter();
        let err = root
            .build_tree(3, || {
                Ok(LeafEntry {
                    key: Arc::from(&input.next().unwrap()[..]),
                    value: loc(0),
                })
            })
            .unwrap_err();
        assert!(matches!(err, StorageError::UnsortedBulkLoad(2)));
        assert_eq!(root.calc_key_count(), 3);
    }

    #[test]
    fn test_replace_value_if() {
        let mut root = filled(10);
        assert!(!root.replace_value_if(&key(3), &loc(4), loc(100)));
        assert!(root.replace_value_if(&key(3), &loc(3), loc(100)));
        assert_eq!(root.get(&key(3)), Some(loc(100)));
        assert!(!root.replace_value_if(b"missing", &loc(0), loc(1)));
    }

    #[test]
    fn test_shorter_prefix_sorts_first() {
        let mut root = BTreeRoot::new(TransactionId(1));
        for k in [&b"ab"[..], b"a", b"abc", b"", b"b", b"a\x00"] {
            root.create_or_update(k, loc(0));
        }
        let expected: Vec<Vec<u8>> = vec![
            b"".to_vec(),
            b"a".to_vec(),
            b"a\x00".to_vec(),
            b"ab".to_vec(),
            b"abc".to_vec(),
            b"b".to_vec(),
        ];
        assert_eq!(keys(&root), expected);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Put(Vec<u8>),
        EraseRange(u16, u16),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => proptest::collection::vec(any::<u8>(), 0..6).prop_map(Op::Put),
            1 => (any::<u16>(), any::<u16>()).prop_map(|(a, b)| Op::EraseRange(a, b)),
        ]
    }

    proptest! {
        #[test]
        fn prop_matches_ordered_map(ops in proptest::collection::vec(op(), 1..400)) {
            let mut root = BTreeRoot::new(TransactionId(1));
            let mut model: BTreeMap<Vec<u8>, u32> = BTreeMap::new();
            for (n, op) in ops.into_iter().enumerate() {
                match op {
                    Op::Put(k) => {
                        root.create_or_update(&k, loc(n as u32));
                        model.insert(k, n as u32);
                    }
                    Op::EraseRange(a, b) => {
                        let len = model.len() as u64;
                        if len == 0 {
                            continue;
                        }
                        let (first, last) = (a as u64 % len, b as u64 % len);
                        let (first, last) = (first.min(last), first.max(last));
                        root.erase_range(first, last);
                        let doomed: Vec<Vec<u8>> = model
                            .keys()
                            .skip(first as usize)
                            .take((last - first + 1) as usize)
                            .cloned()
                            .collect();
                        for k in doomed {
                            model.remove(&k);
                        }
                    }
                }
            }
            prop_assert_eq!(root.calc_key_count(), model.len() as u64);
            let got: Vec<(Vec<u8>, u32)> = root.iter().map(|e| (e.key.to_vec(), e.value.offset)).collect();
            let want: Vec<(Vec<u8>, u32)> = model.into_iter().collect();
            prop_assert_eq!(got, want);
        }
    }
}
