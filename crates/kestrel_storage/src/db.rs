//! Database orchestrator.
//!
//! Owns the last committed snapshot, the single write slot with its FIFO
//! queue of waiting writers, the transaction log writer, and the
//! compaction scheduler. All shared state sits behind short critical
//! sections that never span file I/O, except the log writer lock, which
//! only the write-slot holder (and `close`) ever takes.
//!
//! Recovery on open:
//! 1. classify files by header (see [`FileCollection::open`]);
//! 2. link the log chain backwards from the newest log file;
//! 3. load the newest checkpoint that parses, discarding the rest;
//! 4. replay the log from the checkpoint's resume point to the chain end;
//! 5. write a fresh checkpoint if replay ran over more than one file or no
//!    checkpoint was usable while several files exist;
//! 6. run the fast cleanup and sweep every file marked unknown.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;

use kestrel_common::config::KvConfig;
use kestrel_common::error::{KvError, KvResult, StorageError, TxnError};
use kestrel_common::shutdown::{CancelToken, WakeSignal};
use kestrel_common::types::{FileCategory, FileId, Generation, TransactionId};

use crate::btree::BTreeRoot;
use crate::compactor::{CompactionReport, Compactor, CompactorScheduler};
use crate::compression::{self, CompressionStrategy};
use crate::file_collection::{FileCollection, FileInfo, KeyIndexInfo};
use crate::key_index::{load_key_index, write_key_index};
use crate::sub_db::{SubDb, SubDbRegistry};
use crate::transaction::{KvTransaction, Mode};
use crate::trlog::{TrLogReplayer, TrLogWriter};
use crate::usage::SnapshotUsageRegistry;
use crate::value::{self, ValueLocation};

pub(crate) struct WriteState {
    pub last_committed: Arc<BTreeRoot>,
    /// Transaction holding the write slot.
    pub writer: Option<TransactionId>,
    queue: VecDeque<oneshot::Sender<KvResult<KvTransaction>>>,
    closed: bool,
}

pub(crate) struct DbInner {
    pub config: KvConfig,
    pub files: Arc<FileCollection>,
    pub compression: Arc<dyn CompressionStrategy>,
    pub usage: Arc<SnapshotUsageRegistry>,
    pub state: Mutex<WriteState>,
    pub log: Mutex<TrLogWriter>,
    durable: AtomicBool,
    compaction: Mutex<()>,
    wake: WakeSignal,
    scheduler: Mutex<Option<CompactorScheduler>>,
    sub_dbs: SubDbRegistry,
}

/// Handle to an open store. Dropping it closes the store.
pub struct KeyValueDb {
    inner: Arc<DbInner>,
}

/// Pending grant of the write slot.
///
/// Resolves, in request order, once every earlier writer has finished.
/// Await it from async code or call [`WriteGrant::wait`] from a plain
/// thread.
pub struct WriteGrant {
    rx: oneshot::Receiver<KvResult<KvTransaction>>,
}

impl WriteGrant {
    /// Block the current thread until the slot is granted. Must not be
    /// called from within an async runtime.
    pub fn wait(self) -> KvResult<KvTransaction> {
        self.rx
            .blocking_recv()
            .unwrap_or_else(|_| Err(TxnError::Cancelled.into()))
    }

    /// Non-blocking poll; `None` while still queued.
    pub fn try_take(&mut self) -> Option<KvResult<KvTransaction>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(TxnError::Cancelled.into())),
        }
    }
}

impl Future for WriteGrant {
    type Output = KvResult<KvTransaction>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or_else(|_| Err(TxnError::Cancelled.into())))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FileStats {
    pub file_id: u32,
    pub size: u64,
    pub category: FileCategory,
    pub generation: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DbStats {
    pub key_count: u64,
    pub file_count: usize,
    pub last_generation: u64,
    pub commit_ulong: u64,
    pub files: Vec<FileStats>,
}

impl fmt::Display for DbStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "KeyValueCount:{}", self.key_count)?;
        writeln!(f, "FileCount:{}", self.file_count)?;
        writeln!(f, "FileGeneration:{}", self.last_generation)?;
        for file in &self.files {
            writeln!(
                f,
                "{} Size:{} Type:{} Gen:{}",
                file.file_id, file.size, file.category, file.generation
            )?;
        }
        Ok(())
    }
}

struct Recovered {
    root: BTreeRoot,
    appendable: FileId,
    last_in_chain: FileId,
    needs_checkpoint: bool,
}

/// Set `next_file_id` along the chain ending at `latest`; returns its
/// oldest member.
fn link_trlog_chain(files: &FileCollection, latest: FileId) -> FileId {
    let mut next = FileId::NONE;
    let mut current = latest;
    while !current.is_none() {
        let Some(FileInfo::TransactionLog(info)) = files.file_info(current) else {
            break;
        };
        files.set_next_file_id(current, next);
        next = current;
        current = info.previous_file_id;
    }
    next
}

fn recover(
    files: &FileCollection,
    compression: &dyn CompressionStrategy,
    config: &KvConfig,
) -> Result<Recovered, StorageError> {
    let mut latest_trlog: Option<(Generation, FileId)> = None;
    let mut key_indexes: Vec<(Generation, FileId, KeyIndexInfo)> = Vec::new();
    for (id, info) in files.file_infos() {
        match info {
            FileInfo::TransactionLog(log) => {
                if latest_trlog.map_or(true, |(g, _)| log.generation > g) {
                    latest_trlog = Some((log.generation, id));
                }
            }
            FileInfo::KeyIndex(ki) => key_indexes.push((ki.generation, id, ki)),
            FileInfo::PureValues(_) => {}
        }
    }
    key_indexes.sort_by_key(|(g, _, _)| *g);
    let latest_trlog = latest_trlog.map_or(FileId::NONE, |(_, id)| id);
    let first_trlog = link_trlog_chain(files, latest_trlog);

    let mut root = BTreeRoot::new(TransactionId(0));
    let mut start = (first_trlog, 0u64);
    let mut has_key_index = false;
    while let Some((generation, id, info)) = key_indexes.pop() {
        match load_key_index(files, compression, id, &info, TransactionId(0)) {
            Ok(loaded) => {
                tracing::info!(
                    file_id = id.0,
                    generation = generation.0,
                    key_count = info.key_count,
                    "key index loaded"
                );
                root = loaded;
                if !info.trlog_file_id.is_none() {
                    start = (info.trlog_file_id, info.trlog_offset);
                }
                has_key_index = true;
                break;
            }
            Err(e) => {
                tracing::warn!(file_id = id.0, error = %e, "discarding unusable key index");
                files.make_unknown(id);
            }
        }
    }
    for (_, id, _) in key_indexes {
        files.make_unknown(id);
    }

    let mut replayer = TrLogReplayer::new(files, compression, root);
    let mut appendable = FileId::NONE;
    let mut last_in_chain = FileId::NONE;
    let (mut id, mut offset) = start;
    while !id.is_none() {
        appendable = if replayer.replay_file(id, offset) {
            id
        } else {
            FileId::NONE
        };
        last_in_chain = id;
        offset = 0;
        id = match files.file_info(id) {
            Some(FileInfo::TransactionLog(info)) => info.next_file_id,
            _ => FileId::NONE,
        };
    }
    let root = replayer.into_committed();

    let replayed_tail = if root.trlog_file_id == start.0 {
        root.trlog_offset.saturating_sub(start.1)
    } else {
        u64::MAX
    };
    let needs_checkpoint = (latest_trlog != start.0 && !start.0.is_none())
        || (!has_key_index && files.file_count() > 1)
        || config
            .compaction
            .startup_checkpoint_distance
            .is_some_and(|limit| replayed_tail > limit);
    tracing::info!(
        key_count = root.calc_key_count(),
        trlog_file_id = root.trlog_file_id.0,
        trlog_offset = root.trlog_offset,
        appendable = appendable.0,
        needs_checkpoint,
        "recovery finished"
    );
    Ok(Recovered {
        root,
        appendable,
        last_in_chain,
        needs_checkpoint,
    })
}

impl KeyValueDb {
    /// Open (or create) the store described by `config`, with the codec
    /// selected by `config.compression`.
    pub fn open(config: KvConfig) -> KvResult<Self> {
        let codec = compression::from_config(&config.compression);
        Self::open_with_compression(config, codec)
    }

    pub fn open_with_compression(
        config: KvConfig,
        compression: Arc<dyn CompressionStrategy>,
    ) -> KvResult<Self> {
        config.validate().map_err(KvError::Config)?;
        let files = Arc::new(FileCollection::open(
            &config.storage.dir,
            config.storage.write_buffer_bytes,
        )?);
        let recovered = recover(&files, compression.as_ref(), &config)?;
        let mut log = TrLogWriter::new(
            Arc::clone(&files),
            Arc::clone(&compression),
            config.storage.max_trlog_file_size,
        );
        log.resume(recovered.appendable, recovered.last_in_chain);

        let inner = Arc::new(DbInner {
            durable: AtomicBool::new(config.storage.durable_transactions),
            config,
            files,
            compression,
            usage: Arc::new(SnapshotUsageRegistry::new()),
            state: Mutex::new(WriteState {
                last_committed: Arc::new(recovered.root),
                writer: None,
                queue: VecDeque::new(),
                closed: false,
            }),
            log: Mutex::new(log),
            compaction: Mutex::new(()),
            wake: WakeSignal::new(),
            scheduler: Mutex::new(None),
            sub_dbs: SubDbRegistry::new(),
        });

        if recovered.needs_checkpoint {
            tracing::info!("writing startup key index");
            inner.create_key_index(&CancelToken::new())?;
        }
        let cleaned = Compactor::new(&inner, &CancelToken::new()).fast_start_cleanup()?;
        let deleted = inner.files.delete_all_unknown()?;
        tracing::debug!(cleaned, deleted, "startup cleanup done");

        if inner.config.compaction.background {
            match CompactorScheduler::start(
                Arc::downgrade(&inner),
                inner.wake.clone(),
                Duration::from_millis(inner.config.compaction.idle_poll_ms),
            ) {
                Ok(scheduler) => *inner.scheduler.lock() = Some(scheduler),
                Err(e) => {
                    tracing::error!(error = %e, "failed to spawn compaction thread, compaction runs only on request")
                }
            }
            inner.wake.advise();
        }
        Ok(Self { inner })
    }

    /// Snapshot read that upgrades itself to the writer on first mutation,
    /// failing with a retryable error if another writer got there first.
    pub fn start_read_transaction(&self) -> KvTransaction {
        self.inner.start_reader(Mode::Read)
    }

    pub fn start_read_only_transaction(&self) -> KvTransaction {
        self.inner.start_reader(Mode::ReadOnly)
    }

    /// Request the write slot. Grants are strictly FIFO.
    pub fn start_write_transaction(&self) -> WriteGrant {
        self.inner.start_write_transaction()
    }

    pub fn durable_transactions(&self) -> bool {
        self.inner.durable.load(Ordering::Relaxed)
    }

    pub fn set_durable_transactions(&self, durable: bool) {
        self.inner.durable.store(durable, Ordering::Relaxed);
    }

    pub fn config(&self) -> &KvConfig {
        &self.inner.config
    }

    /// Wake the background compactor.
    pub fn request_compaction(&self) {
        self.inner.wake.advise();
    }

    /// Run one compaction pass on the calling thread. Must not be called
    /// while this thread holds a writing transaction.
    pub fn compact(&self) -> KvResult<CompactionReport> {
        self.inner.run_compaction(&CancelToken::new())
    }

    /// Like [`compact`](Self::compact), stopping early once `cancel` fires.
    pub fn run_compaction(&self, cancel: &CancelToken) -> KvResult<CompactionReport> {
        self.inner.run_compaction(cancel)
    }

    pub fn stats(&self) -> DbStats {
        let root = self.inner.last_committed();
        let files = &self.inner.files;
        DbStats {
            key_count: root.calc_key_count(),
            file_count: files.file_count(),
            last_generation: files.last_generation().0,
            commit_ulong: root.commit_ulong,
            files: files
                .file_infos()
                .into_iter()
                .map(|(id, info)| FileStats {
                    file_id: id.0,
                    size: files.file_size(id).unwrap_or_default(),
                    category: info.category(),
                    generation: info.generation().0,
                })
                .collect(),
        }
    }

    /// Whether the background compaction thread is alive.
    pub fn background_compaction_running(&self) -> bool {
        self.inner
            .scheduler
            .lock()
            .as_ref()
            .is_some_and(|s| s.is_running())
    }

    /// Get or create the secondary store `id`.
    pub fn sub_db<T: SubDb>(&self, id: u64) -> KvResult<Arc<T>> {
        self.inner.sub_dbs.get_or_create::<T>(id, &self.inner.files)
    }

    /// Close the store, leaving the active log appendable.
    ///
    /// Fails with [`TxnError::WriterStillActive`] while a writing
    /// transaction is open. Queued writers receive [`TxnError::Cancelled`].
    pub fn close(&self) -> KvResult<()> {
        self.inner.close()
    }
}

impl Drop for KeyValueDb {
    fn drop(&mut self) {
        if let Err(e) = self.inner.close() {
            tracing::error!(error = %e, "closing store on drop failed");
        }
    }
}

impl DbInner {
    pub fn last_committed(&self) -> Arc<BTreeRoot> {
        Arc::clone(&self.state.lock().last_committed)
    }

    fn start_reader(self: &Arc<Self>, mode: Mode) -> KvTransaction {
        let state = self.state.lock();
        let base = Arc::clone(&state.last_committed);
        let lease = self.usage.acquire(base.transaction_id);
        drop(state);
        KvTransaction::new(Arc::clone(self), base, lease, mode)
    }

    pub fn start_write_transaction(self: &Arc<Self>) -> WriteGrant {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock();
        if state.closed {
            let _ = tx.send(Err(TxnError::Closed.into()));
        } else {
            state.queue.push_back(tx);
            if state.writer.is_none() {
                self.grant_next(&mut state);
            }
        }
        WriteGrant { rx }
    }

    /// Hand the slot to the oldest waiter still listening.
    fn grant_next(self: &Arc<Self>, state: &mut WriteState) {
        while let Some(tx) = state.queue.pop_front() {
            if tx.is_closed() {
                continue;
            }
            let base = Arc::clone(&state.last_committed);
            let lease = self.usage.acquire(base.transaction_id);
            let txn = KvTransaction::new(Arc::clone(self), base, lease, Mode::Writing);
            state.writer = Some(txn.transaction_id());
            match tx.send(Ok(txn)) {
                Ok(()) => return,
                Err(unclaimed) => {
                    state.writer = None;
                    if let Ok(txn) = unclaimed {
                        txn.defuse();
                    }
                }
            }
        }
    }

    /// Upgrade a reader bound to `base` into the writer.
    pub fn make_writable(&self, base: &Arc<BTreeRoot>) -> KvResult<BTreeRoot> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(TxnError::Closed.into());
        }
        if state.writer.is_some() {
            return Err(TxnError::RetryRequired("another writing transaction already running".into()).into());
        }
        if !Arc::ptr_eq(&state.last_committed, base) {
            return Err(TxnError::RetryRequired("another writing transaction already finished".into()).into());
        }
        let root = base.new_transaction_root();
        state.writer = Some(root.transaction_id);
        Ok(root)
    }

    /// Publish `root` (if any) and pass the slot on.
    pub fn release_write_slot(self: &Arc<Self>, root: Option<BTreeRoot>) {
        let mut state = self.state.lock();
        if let Some(root) = root {
            state.last_committed = Arc::new(root);
        }
        state.writer = None;
        self.grant_next(&mut state);
    }

    fn stamp_log_position(&self, log: &TrLogWriter, root: &mut BTreeRoot) {
        let file_id = log.file_id();
        if root.trlog_file_id != file_id && !root.trlog_file_id.is_none() {
            self.wake.advise();
        }
        root.trlog_file_id = file_id;
        root.trlog_offset = log.position();
    }

    /// Commit protocol. `root` is the writer's private snapshot; `logged`
    /// tells whether anything was appended to the log for it.
    pub fn commit_writing(self: &Arc<Self>, mut root: BTreeRoot, logged: bool) -> KvResult<()> {
        if !logged {
            self.release_write_slot(None);
            return Ok(());
        }
        let previous_ulong = self.state.lock().last_committed.commit_ulong;
        let result = (|| -> KvResult<()> {
            let mut log = self.log.lock();
            log.write_commit(root.commit_ulong.wrapping_sub(previous_ulong))?;
            log.flush()?;
            self.stamp_log_position(&log, &mut root);
            if self.durable.load(Ordering::Relaxed) {
                log.hard_flush()?;
            }
            Ok(())
        })();
        match result {
            Ok(()) => {
                tracing::trace!(transaction_id = root.transaction_id.0, "committed");
                self.release_write_slot(Some(root));
                Ok(())
            }
            Err(e) => {
                self.release_write_slot(None);
                Err(e)
            }
        }
    }

    /// Rollback protocol.
    pub fn rollback_writing(self: &Arc<Self>, logged: bool) {
        if !logged {
            self.release_write_slot(None);
            return;
        }
        let mut root = self.last_committed().clone_root();
        {
            let mut log = self.log.lock();
            if let Err(e) = log.write_rollback() {
                tracing::warn!(error = %e, "failed to log rollback");
            }
            self.stamp_log_position(&log, &mut root);
        }
        self.release_write_slot(Some(root));
    }

    /// Acquire the write slot, apply `change` to a private snapshot and
    /// publish it without logging. Used to re-point relocated values; the
    /// caller must checkpoint afterwards. `None` when cancelled while
    /// waiting for the slot.
    pub fn atomically_change_btree<R>(
        self: &Arc<Self>,
        cancel: &CancelToken,
        change: impl FnOnce(&mut BTreeRoot) -> R,
    ) -> KvResult<Option<R>> {
        let mut grant = self.start_write_transaction();
        let recheck = Duration::from_millis(self.config.compaction.reclaim_recheck_ms);
        let txn = loop {
            if let Some(result) = grant.try_take() {
                break result?;
            }
            if cancel.wait_timeout(recheck) {
                return Ok(None);
            }
        };
        let mut root = txn.into_private_root();
        let result = change(&mut root);
        self.release_write_slot(Some(root));
        Ok(Some(result))
    }

    pub fn read_value(&self, location: &ValueLocation) -> Result<Vec<u8>, StorageError> {
        if location.is_inline() {
            return value::decode_inline(location);
        }
        let file = self.files.require_file(location.file_id)?;
        let mut buf = vec![0u8; location.stored_len() as usize];
        file.random_read(location.offset as u64, &mut buf)?;
        if location.is_compressed() {
            self.compression.decompress_value(&mut buf)?;
        }
        Ok(buf)
    }

    /// Checkpoint the last committed snapshot and retire older checkpoints.
    pub fn create_key_index(&self, cancel: &CancelToken) -> KvResult<Option<FileId>> {
        let root = self.last_committed();
        let Some(id) = write_key_index(&self.files, self.compression.as_ref(), &root, cancel)? else {
            return Ok(None);
        };
        for (other, info) in self.files.file_infos() {
            if other != id && info.category() == FileCategory::KeyIndex {
                self.files.make_unknown(other);
            }
        }
        self.files.delete_all_unknown()?;
        Ok(Some(id))
    }

    /// Log bytes written since the newest checkpoint.
    pub fn distance_from_last_key_index(&self, root: &BTreeRoot) -> u64 {
        let newest = self
            .files
            .file_infos()
            .into_iter()
            .filter_map(|(_, info)| match info {
                FileInfo::KeyIndex(ki) => Some(ki),
                _ => None,
            })
            .max_by_key(|ki| ki.generation);
        match newest {
            None if self.files.file_count() > 1 => u64::MAX,
            None => root.trlog_offset,
            Some(ki) if ki.trlog_file_id != root.trlog_file_id => u64::MAX,
            Some(ki) => root.trlog_offset.saturating_sub(ki.trlog_offset),
        }
    }

    pub fn run_compaction(self: &Arc<Self>, cancel: &CancelToken) -> KvResult<CompactionReport> {
        let _running = self.compaction.lock();
        Compactor::new(self, cancel).run()
    }

    fn close(&self) -> KvResult<()> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(());
            }
            if let Some(id) = state.writer {
                return Err(TxnError::WriterStillActive(id).into());
            }
            state.closed = true;
            for tx in state.queue.drain(..) {
                let _ = tx.send(Err(TxnError::Cancelled.into()));
            }
        }
        // New grants are refused from here on, so a pass still in flight
        // cannot take the write slot before the log closes.
        let scheduler = self.scheduler.lock().take();
        if let Some(mut scheduler) = scheduler {
            scheduler.stop();
        }
        self.log.lock().close()?;
        tracing::info!(dir = %self.files.dir().display(), "store closed");
        Ok(())
    }
}
