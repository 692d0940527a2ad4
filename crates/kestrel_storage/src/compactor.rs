//! Background space reclamation.
//!
//! A pass looks at the last committed snapshot, measures how many bytes of
//! every value-holding file it still references, and then
//! 1. relocates the live values out of mostly-dead files into a fresh
//!    pure-values file, re-pointing the tree under the write slot;
//! 2. writes a checkpoint so recovery no longer needs the old files;
//! 3. waits until no reader can still see an older snapshot, and deletes
//!    the reclaimed files.
//!
//! Files at or above the generation of the snapshot's own log file are
//! never touched; they may hold values of transactions still in flight.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use serde::Serialize;

use kestrel_common::error::{KvError, KvResult, StorageError, TxnError};
use kestrel_common::shutdown::{CancelToken, WakeSignal};
use kestrel_common::types::{FileId, Generation};

use crate::btree::{BTreeRoot, LeafEntry};
use crate::db::DbInner;
use crate::file_collection::{FileInfo, PureValuesInfo};
use crate::value::ValueLocation;

/// Keys between cancellation checks while scanning the tree.
const CANCEL_CHECK_STRIDE: usize = 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CompactionReport {
    pub relocated_files: usize,
    pub relocated_values: u64,
    pub relocated_bytes: u64,
    pub key_index: Option<u32>,
    pub deleted_files: usize,
    pub cancelled: bool,
}

impl CompactionReport {
    pub fn did_work(&self) -> bool {
        self.relocated_files > 0 || self.key_index.is_some() || self.deleted_files > 0
    }
}

impl fmt::Display for CompactionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "relocated {} values ({} bytes) from {} files, deleted {} files",
            self.relocated_values, self.relocated_bytes, self.relocated_files, self.deleted_files
        )?;
        if let Some(id) = self.key_index {
            write!(f, ", key index {}", id)?;
        }
        if self.cancelled {
            write!(f, " (cancelled)")?;
        }
        Ok(())
    }
}

struct Candidate {
    id: FileId,
    live_bytes: u64,
    size: u64,
}

pub(crate) struct Compactor<'a> {
    db: &'a Arc<DbInner>,
    cancel: &'a CancelToken,
}

impl<'a> Compactor<'a> {
    pub fn new(db: &'a Arc<DbInner>, cancel: &'a CancelToken) -> Self {
        Self { db, cancel }
    }

    /// Generation below which value files may be reclaimed.
    fn dont_touch_generation(&self, root: &BTreeRoot) -> Generation {
        let log_file = if root.trlog_file_id.is_none() {
            self.db.log.lock().file_id()
        } else {
            root.trlog_file_id
        };
        self.db.files.generation_of(log_file).unwrap_or(Generation(0))
    }

    /// Stored bytes referenced per file, or `None` if cancelled.
    fn live_bytes(&self, root: &BTreeRoot) -> Option<HashMap<FileId, u64>> {
        let mut used: HashMap<FileId, u64> = HashMap::new();
        for (n, entry) in root.iter().enumerate() {
            if n % CANCEL_CHECK_STRIDE == 0 && self.cancel.is_cancelled() {
                return None;
            }
            if !entry.value.is_inline() {
                *used.entry(entry.value.file_id).or_default() += entry.value.stored_len();
            }
        }
        Some(used)
    }

    fn candidates(&self, below: Generation, used: &HashMap<FileId, u64>) -> Vec<Candidate> {
        self.db
            .files
            .file_infos()
            .into_iter()
            .filter(|(_, info)| info.holds_values() && info.generation() < below)
            .map(|(id, _)| Candidate {
                id,
                live_bytes: used.get(&id).copied().unwrap_or(0),
                size: self.db.files.file_size(id).unwrap_or(0),
            })
            .collect()
    }

    pub fn run(&self) -> KvResult<CompactionReport> {
        let mut report = CompactionReport::default();
        let root = self.db.last_committed();
        let dont_touch = self.dont_touch_generation(&root);
        let Some(used) = self.live_bytes(&root) else {
            report.cancelled = true;
            return Ok(report);
        };

        let waste_ratio = self.db.config.compaction.waste_ratio;
        let mut reclaim: Vec<FileId> = Vec::new();
        let mut relocate: HashSet<FileId> = HashSet::new();
        for candidate in self.candidates(dont_touch, &used) {
            if candidate.live_bytes == 0 {
                reclaim.push(candidate.id);
            } else if candidate.size > 0
                && 1.0 - candidate.live_bytes as f64 / candidate.size as f64 > waste_ratio
            {
                relocate.insert(candidate.id);
            }
        }
        tracing::debug!(
            dont_touch = dont_touch.0,
            unused = reclaim.len(),
            relocate = relocate.len(),
            "compaction candidates"
        );

        if !relocate.is_empty() {
            if !self.relocate(&root, &relocate, &mut report)? {
                report.cancelled = true;
                return Ok(report);
            }
            reclaim.extend(relocate.iter().copied());
        }

        let current = self.db.last_committed();
        let distance = self.db.distance_from_last_key_index(&current);
        if !reclaim.is_empty() || distance > self.db.config.key_index_distance() {
            match self.db.create_key_index(self.cancel)? {
                Some(id) => report.key_index = Some(id.0),
                None => {
                    report.cancelled = true;
                    return Ok(report);
                }
            }
        }

        if !reclaim.is_empty() {
            let published = self.db.last_committed().transaction_id;
            let recheck = Duration::from_millis(self.db.config.compaction.reclaim_recheck_ms);
            if !self.db.usage.wait_for_finishing_before(published, self.cancel, recheck) {
                report.cancelled = true;
                return Ok(report);
            }
            for id in &reclaim {
                self.db.files.make_unknown(*id);
            }
            report.deleted_files = self.db.files.delete_all_unknown()?;
        }

        if report.did_work() {
            tracing::info!(%report, "compaction finished");
        }
        Ok(report)
    }

    /// Copy every live value held in `sources` into a new pure-values file
    /// and re-point the tree at the copies. Returns `false` if cancelled.
    fn relocate(
        &self,
        root: &BTreeRoot,
        sources: &HashSet<FileId>,
        report: &mut CompactionReport,
    ) -> KvResult<bool> {
        let files = &self.db.files;
        let info = FileInfo::PureValues(PureValuesInfo {
            generation: files.next_generation(),
        });
        let target = files.add_file_with_header(&info)?;
        let abandon = |target_id: FileId| -> KvResult<bool> {
            files.make_unknown(target_id);
            files.delete_all_unknown()?;
            Ok(false)
        };

        let mut moves: Vec<(LeafEntry, ValueLocation)> = Vec::new();
        let mut buf = Vec::new();
        for (n, entry) in root.iter().enumerate() {
            if n % CANCEL_CHECK_STRIDE == 0 && self.cancel.is_cancelled() {
                return abandon(target.id());
            }
            if entry.value.is_inline() || !sources.contains(&entry.value.file_id) {
                continue;
            }
            let source = files.require_file(entry.value.file_id)?;
            buf.resize(entry.value.stored_len() as usize, 0);
            source.random_read(entry.value.offset as u64, &mut buf)?;
            let offset = u32::try_from(target.position()).map_err(|_| {
                StorageError::Corrupted(format!("pure values file {} exceeds 4 GiB", target.id()))
            })?;
            target.append(&buf)?;
            report.relocated_bytes += buf.len() as u64;
            let moved = ValueLocation {
                file_id: target.id(),
                offset,
                size: entry.value.size,
            };
            moves.push((entry, moved));
        }
        target.hard_flush()?;
        target.truncate()?;
        files.set_info(target.id(), info);

        let Some(replaced) = self.db.atomically_change_btree(self.cancel, |root| {
            moves
                .iter()
                .filter(|(entry, moved)| root.replace_value_if(&entry.key, &entry.value, *moved))
                .count() as u64
        })?
        else {
            return abandon(target.id());
        };
        report.relocated_files = sources.len();
        report.relocated_values = replaced;
        tracing::debug!(
            target_file = target.id().0,
            replaced,
            sources = sources.len(),
            "values relocated"
        );
        Ok(true)
    }

    /// Startup cleanup: mark value files that neither the last snapshot nor
    /// a replay from the newest checkpoint can reference. Returns how many
    /// were marked; the caller sweeps them.
    pub fn fast_start_cleanup(&self) -> KvResult<usize> {
        let root = self.db.last_committed();
        if root.trlog_file_id.is_none() {
            return Ok(0);
        }
        let dont_touch = self.dont_touch_generation(&root);
        let replay_floor = self
            .db
            .files
            .file_infos()
            .into_iter()
            .filter_map(|(_, info)| match info {
                FileInfo::KeyIndex(ki) => Some(ki),
                _ => None,
            })
            .max_by_key(|ki| ki.generation)
            .and_then(|ki| self.db.files.generation_of(ki.trlog_file_id));
        let Some(replay_floor) = replay_floor else {
            return Ok(0);
        };
        let Some(used) = self.live_bytes(&root) else {
            return Ok(0);
        };
        let below = dont_touch.min(replay_floor);
        let mut marked = 0;
        for candidate in self.candidates(below, &used) {
            if candidate.live_bytes == 0 {
                self.db.files.make_unknown(candidate.id);
                marked += 1;
            }
        }
        Ok(marked)
    }
}

/// Background thread that runs a compaction pass whenever it is advised
/// (log rotation, explicit request) or the idle period elapses.
pub struct CompactorScheduler {
    cancel: CancelToken,
    wake: WakeSignal,
    handle: Option<JoinHandle<()>>,
}

impl CompactorScheduler {
    /// Returns `Err` if the thread cannot be spawned; the store keeps
    /// working without background compaction.
    pub(crate) fn start(
        db: Weak<DbInner>,
        wake: WakeSignal,
        idle: Duration,
    ) -> Result<Self, std::io::Error> {
        let cancel = CancelToken::new();
        let thread_cancel = cancel.clone();
        let thread_wake = wake.clone();

        let handle = std::thread::Builder::new()
            .name("kestrel-compactor".into())
            .spawn(move || {
                tracing::info!(idle_ms = idle.as_millis() as u64, "compactor started");
                while !thread_cancel.is_cancelled() {
                    thread_wake.wait(idle);
                    if thread_cancel.is_cancelled() {
                        break;
                    }
                    let Some(db) = db.upgrade() else {
                        break;
                    };
                    match db.run_compaction(&thread_cancel) {
                        Ok(report) if report.did_work() => {
                            tracing::debug!(%report, "background compaction pass")
                        }
                        Ok(_) => tracing::trace!("compaction pass found nothing to do"),
                        Err(KvError::Txn(TxnError::Closed)) => break,
                        Err(e) => tracing::warn!(error = %e, "compaction pass failed"),
                    }
                }
                tracing::info!("compactor stopped");
            })
            .map_err(|e| {
                tracing::error!(
                    component = "compactor",
                    error = %e,
                    "failed to spawn compactor thread"
                );
                e
            })?;

        Ok(Self {
            cancel,
            wake,
            handle: Some(handle),
        })
    }

    /// Signal the thread to stop and wait for it to finish its pass.
    pub fn stop(&mut self) {
        self.cancel.cancel();
        self.wake.advise();
        if let Some(h) = self.handle.take() {
            if h.thread().id() == std::thread::current().id() {
                return;
            }
            let _ = h.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for CompactorScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
