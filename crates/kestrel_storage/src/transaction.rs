//! Transaction handles.
//!
//! A transaction reads one immutable snapshot. Keys are addressed relative
//! to an optional key prefix, and a cursor (`key_index`) is kept over the
//! keys that share it. Writing transactions own a private copy-on-write
//! root; every mutation is appended to the log before it is applied.
//!
//! Dropping a transaction without committing rolls it back.

use std::fmt;
use std::sync::Arc;

use kestrel_common::error::{KvResult, TxnError};
use kestrel_common::types::TransactionId;

use crate::btree::{self, BTreeRoot, FindResult, LeafEntry, PathStep};
use crate::db::DbInner;
use crate::trlog::key_range_indexes;
use crate::usage::UsageLease;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    ReadOnly,
    /// Reader that upgrades itself to the writer on first mutation.
    Read,
    Writing,
}

pub struct KvTransaction {
    db: Arc<DbInner>,
    base: Arc<BTreeRoot>,
    root: BTreeRoot,
    mode: Mode,
    /// `TransactionStart` has been logged.
    logged: bool,
    finished: bool,
    prefix: Vec<u8>,
    /// Absolute index of the first key with `prefix` and how many there are.
    prefix_range: Option<(u64, u64)>,
    /// Absolute cursor index.
    key_index: Option<u64>,
    stack: Vec<PathStep>,
    stack_index: Option<u64>,
    _lease: UsageLease,
}

impl KvTransaction {
    pub(crate) fn new(db: Arc<DbInner>, base: Arc<BTreeRoot>, lease: UsageLease, mode: Mode) -> Self {
        let root = match mode {
            Mode::Writing => base.new_transaction_root(),
            Mode::Read | Mode::ReadOnly => (*base).clone(),
        };
        Self {
            db,
            base,
            root,
            mode,
            logged: false,
            finished: false,
            prefix: Vec::new(),
            prefix_range: None,
            key_index: None,
            stack: Vec::new(),
            stack_index: None,
            _lease: lease,
        }
    }

    /// Mark finished without touching the write slot.
    pub(crate) fn defuse(mut self) {
        self.finished = true;
    }

    /// Take the private root of a writing transaction; the caller becomes
    /// responsible for releasing the write slot.
    pub(crate) fn into_private_root(mut self) -> BTreeRoot {
        self.finished = true;
        std::mem::replace(&mut self.root, BTreeRoot::new(TransactionId(0)))
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.root.transaction_id
    }

    pub fn is_writing(&self) -> bool {
        self.mode == Mode::Writing
    }

    pub fn is_read_only(&self) -> bool {
        self.mode == Mode::ReadOnly
    }

    // -- prefix & cursor ---------------------------------------------------

    pub fn set_key_prefix(&mut self, prefix: &[u8]) {
        self.prefix.clear();
        self.prefix.extend_from_slice(prefix);
        self.prefix_range = None;
        self.invalidate_current_key();
    }

    pub fn key_prefix(&self) -> &[u8] {
        &self.prefix
    }

    pub fn invalidate_current_key(&mut self) {
        self.key_index = None;
        self.stack_index = None;
    }

    fn lower_bound(&mut self, key: &[u8]) -> u64 {
        match self.root.find_key(&mut self.stack, &[], key) {
            (FindResult::Exact, i) => i,
            (FindResult::Previous, i) => i + 1,
            (FindResult::Next, _) | (FindResult::NotFound, _) => 0,
        }
    }

    fn prefix_range(&mut self) -> (u64, u64) {
        if let Some(range) = self.prefix_range {
            return range;
        }
        self.stack_index = None;
        let total = self.root.calc_key_count();
        let range = if self.prefix.is_empty() {
            (0, total)
        } else {
            let first = self.lower_bound(&self.prefix.clone());
            let end = match prefix_successor(&self.prefix) {
                Some(next) => self.lower_bound(&next),
                None => total,
            };
            (first, end.saturating_sub(first))
        };
        self.prefix_range = Some(range);
        range
    }

    /// Number of keys under the current prefix.
    pub fn count(&mut self) -> u64 {
        self.prefix_range().1
    }

    /// Cursor position relative to the prefix.
    pub fn key_index(&mut self) -> Option<u64> {
        let abs = self.key_index?;
        Some(abs - self.prefix_range().0)
    }

    pub fn set_key_index(&mut self, index: u64) -> bool {
        let (first, count) = self.prefix_range();
        if index >= count {
            self.invalidate_current_key();
            return false;
        }
        self.key_index = Some(first + index);
        true
    }

    /// Position the cursor on `key` (relative to the prefix) or its
    /// neighbour, never leaving the prefix.
    pub fn find_key(&mut self, key: &[u8]) -> FindResult {
        let (first, count) = self.prefix_range();
        let (result, index) = self.root.find_key(&mut self.stack, &self.prefix, key);
        self.stack_index = Some(index);
        let (result, index) = match result {
            FindResult::Exact => (FindResult::Exact, index),
            FindResult::Previous if index >= first => (FindResult::Previous, index),
            FindResult::Previous | FindResult::Next if count > 0 => (FindResult::Next, first),
            _ => (FindResult::NotFound, 0),
        };
        self.key_index = match result {
            FindResult::NotFound => None,
            _ => Some(index),
        };
        result
    }

    pub fn find_exact_key(&mut self, key: &[u8]) -> bool {
        self.find_key(key) == FindResult::Exact
    }

    pub fn find_first_key(&mut self) -> bool {
        self.set_key_index(0)
    }

    pub fn find_last_key(&mut self) -> bool {
        let count = self.count();
        count > 0 && self.set_key_index(count - 1)
    }

    pub fn find_next_key(&mut self) -> bool {
        let Some(abs) = self.key_index else {
            return false;
        };
        let (first, count) = self.prefix_range();
        if abs + 1 >= first + count {
            return false;
        }
        if self.stack_index == Some(abs) && btree::find_next_key(&mut self.stack) {
            self.stack_index = Some(abs + 1);
        }
        self.key_index = Some(abs + 1);
        true
    }

    pub fn find_previous_key(&mut self) -> bool {
        let Some(abs) = self.key_index else {
            return false;
        };
        if abs <= self.prefix_range().0 {
            return false;
        }
        if self.stack_index == Some(abs) && btree::find_previous_key(&mut self.stack) {
            self.stack_index = Some(abs - 1);
        }
        self.key_index = Some(abs - 1);
        true
    }

    fn current(&mut self) -> Option<&LeafEntry> {
        let abs = self.key_index?;
        if self.stack_index != Some(abs) {
            self.root.fill_stack_by_index(&mut self.stack, abs);
            self.stack_index = Some(abs);
        }
        btree::current_entry(&self.stack)
    }

    /// Current key without the prefix.
    pub fn key(&mut self) -> Option<Vec<u8>> {
        let skip = self.prefix.len();
        self.current().map(|e| e.key[skip..].to_vec())
    }

    pub fn value(&mut self) -> KvResult<Option<Vec<u8>>> {
        let Some(location) = self.current().map(|e| e.value) else {
            return Ok(None);
        };
        Ok(Some(self.db.read_value(&location)?))
    }

    pub fn value_size(&mut self) -> Option<usize> {
        self.current().map(|e| e.value.value_len())
    }

    /// Point lookup that leaves the cursor alone.
    pub fn get(&self, key: &[u8]) -> KvResult<Option<Vec<u8>>> {
        let full = self.full_key(key);
        match self.root.get(&full) {
            Some(location) => Ok(Some(self.db.read_value(&location)?)),
            None => Ok(None),
        }
    }

    /// Entries under the prefix in key order, keys relative to the prefix.
    pub fn iter(&mut self) -> TxnIter<'_> {
        let (first, count) = self.prefix_range();
        TxnIter {
            inner: self.root.iter_range(first, count),
            skip: self.prefix.len(),
            db: &self.db,
        }
    }

    // -- mutation ----------------------------------------------------------

    fn full_key(&self, key: &[u8]) -> Vec<u8> {
        let mut full = Vec::with_capacity(self.prefix.len() + key.len());
        full.extend_from_slice(&self.prefix);
        full.extend_from_slice(key);
        full
    }

    fn ensure_writable(&mut self) -> KvResult<()> {
        match self.mode {
            Mode::ReadOnly => return Err(TxnError::ReadOnly.into()),
            Mode::Read => {
                self.root = self.db.make_writable(&self.base)?;
                self.mode = Mode::Writing;
                self.prefix_range = None;
                self.stack_index = None;
            }
            Mode::Writing => {}
        }
        if !self.logged {
            self.db.log.lock().write_start_transaction()?;
            self.logged = true;
        }
        Ok(())
    }

    fn after_mutation(&mut self, cursor: Option<u64>) {
        self.prefix_range = None;
        self.stack_index = None;
        self.key_index = cursor;
    }

    /// Insert or overwrite `key`. Returns `true` if it was created. The
    /// cursor is left on the key.
    pub fn create_or_update(&mut self, key: &[u8], value: &[u8]) -> KvResult<bool> {
        self.ensure_writable()?;
        let location = self.db.log.lock().write_create_or_update(&self.prefix, key, value)?;
        let full = self.full_key(key);
        let (created, index) = self.root.create_or_update(&full, location);
        self.after_mutation(Some(index));
        Ok(created)
    }

    /// Erase the key under the cursor; `false` when there is none.
    pub fn erase_current(&mut self) -> KvResult<bool> {
        if self.mode == Mode::ReadOnly {
            return Err(TxnError::ReadOnly.into());
        }
        let Some(key) = self.current().map(|e| e.key.to_vec()) else {
            return Ok(false);
        };
        self.erase_full_key(&key)
    }

    /// Erase `key` if present.
    pub fn erase_one(&mut self, key: &[u8]) -> KvResult<bool> {
        if self.mode == Mode::ReadOnly {
            return Err(TxnError::ReadOnly.into());
        }
        let full = self.full_key(key);
        self.erase_full_key(&full)
    }

    fn erase_full_key(&mut self, full: &[u8]) -> KvResult<bool> {
        if self.root.get(full).is_none() {
            return Ok(false);
        }
        self.ensure_writable()?;
        self.db.log.lock().write_erase_one(full)?;
        if let (FindResult::Exact, index) = self.root.find_key(&mut self.stack, &[], full) {
            self.root.erase_range(index, index);
        }
        self.after_mutation(None);
        Ok(true)
    }

    /// Erase every key in `first..=last` (relative to the prefix).
    /// Returns the number of keys removed.
    pub fn erase_range(&mut self, first: &[u8], last: &[u8]) -> KvResult<u64> {
        if self.mode == Mode::ReadOnly {
            return Err(TxnError::ReadOnly.into());
        }
        let first = self.full_key(first);
        let last = self.full_key(last);
        let Some((from, to)) = key_range_indexes(&self.root, &mut self.stack, &first, &last) else {
            self.stack_index = None;
            return Ok(0);
        };
        self.ensure_writable()?;
        self.db.log.lock().write_erase_range(&first, &last)?;
        self.root.erase_range(from, to);
        self.after_mutation(None);
        Ok(to - from + 1)
    }

    /// Erase every key under the prefix.
    pub fn erase_all(&mut self) -> KvResult<u64> {
        if self.mode == Mode::ReadOnly {
            return Err(TxnError::ReadOnly.into());
        }
        let (first, count) = self.prefix_range();
        if count == 0 {
            return Ok(0);
        }
        self.root.fill_stack_by_index(&mut self.stack, first);
        let low = btree::current_entry(&self.stack).map(|e| e.key.to_vec());
        self.root.fill_stack_by_index(&mut self.stack, first + count - 1);
        let high = btree::current_entry(&self.stack).map(|e| e.key.to_vec());
        self.stack_index = None;
        let (Some(low), Some(high)) = (low, high) else {
            return Ok(0);
        };
        self.ensure_writable()?;
        self.db.log.lock().write_erase_range(&low, &high)?;
        self.root.erase_range(first, first + count - 1);
        self.after_mutation(None);
        Ok(count)
    }

    pub fn commit_ulong(&self) -> u64 {
        self.root.commit_ulong
    }

    /// Attach a caller-defined counter to the commit; it is logged as a
    /// delta against the previous commit and survives restarts.
    pub fn set_commit_ulong(&mut self, value: u64) -> KvResult<()> {
        if self.root.commit_ulong == value {
            return Ok(());
        }
        self.ensure_writable()?;
        self.root.commit_ulong = value;
        Ok(())
    }

    // -- completion --------------------------------------------------------

    /// Commit. For readers this just releases the snapshot.
    pub fn commit(mut self) -> KvResult<()> {
        self.finished = true;
        if self.mode != Mode::Writing {
            return Ok(());
        }
        let root = std::mem::replace(&mut self.root, BTreeRoot::new(TransactionId(0)));
        self.db.commit_writing(root, self.logged)
    }

    pub fn rollback(self) {
        drop(self);
    }
}

impl Drop for KvTransaction {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        if self.mode == Mode::Writing {
            self.db.rollback_writing(self.logged);
        }
    }
}

impl fmt::Debug for KvTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KvTransaction")
            .field("transaction_id", &self.root.transaction_id)
            .field("mode", &self.mode)
            .field("logged", &self.logged)
            .finish()
    }
}

/// Smallest key greater than every key starting with `prefix`, or `None`
/// if no such key exists.
fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut next = prefix.to_vec();
    while let Some(last) = next.pop() {
        if last < u8::MAX {
            next.push(last + 1);
            return Some(next);
        }
    }
    None
}

pub struct TxnIter<'t> {
    inner: btree::Iter,
    skip: usize,
    db: &'t DbInner,
}

impl Iterator for TxnIter<'_> {
    type Item = KvResult<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.inner.next()?;
        Some(
            self.db
                .read_value(&entry.value)
                .map(|value| (entry.key[self.skip..].to_vec(), value))
                .map_err(Into::into),
        )
    }
}
