//! Transaction log: the write-ahead command stream.
//!
//! Every mutation of a writing transaction is appended as one framed
//! command the moment it happens; a commit only adds the `Commit` record
//! and flushes. Replay rebuilds the last committed snapshot by re-applying
//! the stream onto the snapshot loaded from a checkpoint (or onto an empty
//! tree).
//!
//! ```text
//! command        = tag u8 (low 6 bits: kind, 0x40 / 0x80: param 1 / 2 compressed)
//! TransactionStart : "tR"
//! CreateOrUpdate   : vu32 key_len | vu32 value_len | key | value
//! EraseOne         : vu32 key_len | key
//! EraseRange       : vu32 len1 | vu32 len2 | key1 | key2
//! CommitWithDeltaUlong : vu64 delta
//! Commit | Rollback | EndOfFile | TemporaryEndOfFile : no payload
//! ```
//!
//! A value's location is the offset of its bytes inside the log file, so
//! values are never copied out of the log unless the compactor relocates
//! them. Values of at most 7 uncompressed bytes are still written to the
//! log but resolve to inline locations.

use std::sync::Arc;

use kestrel_common::error::StorageError;
use kestrel_common::types::FileId;

use crate::btree::{BTreeRoot, FindResult};
use crate::codec::{write_vu32, write_vu64, ByteReader};
use crate::compression::CompressionStrategy;
use crate::file_collection::{CollectionFile, FileCollection, FileInfo, TrLogInfo};
use crate::value::{self, ValueLocation};

pub const MAGIC_START_OF_TRANSACTION: &[u8; 2] = b"tR";

const COMMAND_MASK: u8 = 0x3F;
const FIRST_PARAM_COMPRESSED: u8 = 0x40;
const SECOND_PARAM_COMPRESSED: u8 = 0x80;
/// Slack reserved for the tag and length varints of one command.
const COMMAND_OVERHEAD: u64 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    TransactionStart = 1,
    CreateOrUpdate = 2,
    EraseOne = 3,
    EraseRange = 4,
    Commit = 5,
    CommitWithDeltaUlong = 6,
    Rollback = 7,
    EndOfFile = 8,
    TemporaryEndOfFile = 9,
}

impl Command {
    pub fn from_tag(tag: u8) -> Option<Command> {
        Some(match tag & COMMAND_MASK {
            1 => Command::TransactionStart,
            2 => Command::CreateOrUpdate,
            3 => Command::EraseOne,
            4 => Command::EraseRange,
            5 => Command::Commit,
            6 => Command::CommitWithDeltaUlong,
            7 => Command::Rollback,
            8 => Command::EndOfFile,
            9 => Command::TemporaryEndOfFile,
            _ => return None,
        })
    }
}

fn value_offset(pos: u64) -> Result<u32, StorageError> {
    u32::try_from(pos)
        .map_err(|_| StorageError::Corrupted(format!("log offset {} exceeds 32 bits", pos)))
}

/// Appends commands to the active log file, rotating to a fresh linked
/// file before one would outgrow `max_file_size`.
pub struct TrLogWriter {
    files: Arc<FileCollection>,
    compression: Arc<dyn CompressionStrategy>,
    max_file_size: u64,
    file: Option<Arc<CollectionFile>>,
    /// Log file that replay found appendable, opened lazily.
    resume_file_id: FileId,
    previous_file_id: FileId,
    /// Offset of the first command in the active file.
    body_start: u64,
    scratch: Vec<u8>,
}

impl TrLogWriter {
    pub fn new(
        files: Arc<FileCollection>,
        compression: Arc<dyn CompressionStrategy>,
        max_file_size: u64,
    ) -> Self {
        Self {
            files,
            compression,
            max_file_size,
            file: None,
            resume_file_id: FileId::NONE,
            previous_file_id: FileId::NONE,
            body_start: 0,
            scratch: Vec::with_capacity(256),
        }
    }

    /// Continue after recovery. `appendable` is the log file replay left
    /// open for appending (if any); `previous` the last file of the chain.
    pub fn resume(&mut self, appendable: FileId, previous: FileId) {
        self.resume_file_id = appendable;
        self.previous_file_id = previous;
    }

    /// Id of the active log file, [`FileId::NONE`] before the first write.
    pub fn file_id(&self) -> FileId {
        match &self.file {
            Some(f) => f.id(),
            None => self.resume_file_id,
        }
    }

    pub fn position(&self) -> u64 {
        match &self.file {
            Some(f) => f.position(),
            None => self
                .files
                .file_size(self.resume_file_id)
                .unwrap_or_default(),
        }
    }

    fn active(&mut self) -> Result<&Arc<CollectionFile>, StorageError> {
        if self.file.is_none() {
            if self.resume_file_id.is_none() {
                self.start_new_file()?;
            } else {
                let file = self.files.require_file(self.resume_file_id)?;
                self.body_start = file.position();
                self.file = Some(file);
            }
        }
        self.file
            .as_ref()
            .ok_or_else(|| StorageError::Corrupted("no active log file".into()))
    }

    fn start_new_file(&mut self) -> Result<(), StorageError> {
        if let Some(file) = self.file.take() {
            file.append(&[Command::EndOfFile as u8])?;
            file.hard_flush()?;
            file.truncate()?;
            self.previous_file_id = file.id();
        }
        let info = FileInfo::TransactionLog(TrLogInfo {
            generation: self.files.next_generation(),
            previous_file_id: self.previous_file_id,
            next_file_id: FileId::NONE,
        });
        let file = self.files.add_file_with_header(&info)?;
        self.files.set_info(file.id(), info);
        self.files.set_next_file_id(self.previous_file_id, file.id());
        tracing::info!(
            file_id = file.id().0,
            previous_file_id = self.previous_file_id.0,
            "transaction log file started"
        );
        self.body_start = file.position();
        self.resume_file_id = FileId::NONE;
        self.file = Some(file);
        Ok(())
    }

    /// Rotate if `needed` more bytes would push a non-empty file past the limit.
    fn reserve(&mut self, needed: u64) -> Result<(), StorageError> {
        let position = self.active()?.position();
        if position > self.body_start && position + needed > self.max_file_size {
            self.start_new_file()?;
        }
        Ok(())
    }

    fn emit(&mut self) -> Result<(), StorageError> {
        let bytes = std::mem::take(&mut self.scratch);
        let result = self.active().and_then(|f| Ok(f.append(&bytes)?));
        self.scratch = bytes;
        self.scratch.clear();
        result
    }

    pub fn write_start_transaction(&mut self) -> Result<(), StorageError> {
        self.reserve(COMMAND_OVERHEAD)?;
        self.scratch.clear();
        self.scratch.push(Command::TransactionStart as u8);
        self.scratch.extend_from_slice(MAGIC_START_OF_TRANSACTION);
        self.emit()
    }

    /// Log an upsert and return where its value now lives.
    pub fn write_create_or_update(
        &mut self,
        prefix: &[u8],
        key: &[u8],
        value: &[u8],
    ) -> Result<ValueLocation, StorageError> {
        let mut tag = Command::CreateOrUpdate as u8;
        let mut full_key = Vec::with_capacity(prefix.len() + key.len());
        full_key.extend_from_slice(prefix);
        full_key.extend_from_slice(key);
        if self.compression.should_try_compress_key(full_key.len())
            && self.compression.compress_key(&mut full_key)
        {
            tag |= FIRST_PARAM_COMPRESSED;
        }
        let mut stored = value.to_vec();
        let compressed = self.compression.compress_value(&mut stored);
        if compressed {
            tag |= SECOND_PARAM_COMPRESSED;
        }
        self.reserve(full_key.len() as u64 + stored.len() as u64 + COMMAND_OVERHEAD)?;

        self.scratch.clear();
        self.scratch.push(tag);
        write_vu32(&mut self.scratch, full_key.len() as u32);
        write_vu32(&mut self.scratch, stored.len() as u32);
        self.scratch.extend_from_slice(&full_key);
        let offset = self.active()?.position() + self.scratch.len() as u64;
        self.scratch.extend_from_slice(&stored);
        let file_id = self.file_id();
        self.emit()?;

        if !compressed && value::can_inline(&stored) {
            value::encode_inline(&stored)
        } else {
            Ok(ValueLocation::in_file(
                file_id,
                value_offset(offset)?,
                stored.len(),
                compressed,
            ))
        }
    }

    pub fn write_erase_one(&mut self, key: &[u8]) -> Result<(), StorageError> {
        let mut tag = Command::EraseOne as u8;
        let mut key = key.to_vec();
        if self.compression.should_try_compress_key(key.len()) && self.compression.compress_key(&mut key)
        {
            tag |= FIRST_PARAM_COMPRESSED;
        }
        self.reserve(key.len() as u64 + COMMAND_OVERHEAD)?;
        self.scratch.clear();
        self.scratch.push(tag);
        write_vu32(&mut self.scratch, key.len() as u32);
        self.scratch.extend_from_slice(&key);
        self.emit()
    }

    pub fn write_erase_range(&mut self, first: &[u8], last: &[u8]) -> Result<(), StorageError> {
        let mut tag = Command::EraseRange as u8;
        let mut first = first.to_vec();
        let mut last = last.to_vec();
        if self.compression.should_try_compress_key(first.len())
            && self.compression.compress_key(&mut first)
        {
            tag |= FIRST_PARAM_COMPRESSED;
        }
        if self.compression.should_try_compress_key(last.len())
            && self.compression.compress_key(&mut last)
        {
            tag |= SECOND_PARAM_COMPRESSED;
        }
        self.reserve((first.len() + last.len()) as u64 + COMMAND_OVERHEAD)?;
        self.scratch.clear();
        self.scratch.push(tag);
        write_vu32(&mut self.scratch, first.len() as u32);
        write_vu32(&mut self.scratch, last.len() as u32);
        self.scratch.extend_from_slice(&first);
        self.scratch.extend_from_slice(&last);
        self.emit()
    }

    /// Append the commit record; `delta` is added to the replayed
    /// commit counter with wraparound.
    pub fn write_commit(&mut self, delta: u64) -> Result<(), StorageError> {
        self.reserve(COMMAND_OVERHEAD)?;
        self.scratch.clear();
        if delta == 0 {
            self.scratch.push(Command::Commit as u8);
        } else {
            self.scratch.push(Command::CommitWithDeltaUlong as u8);
            write_vu64(&mut self.scratch, delta);
        }
        self.emit()
    }

    pub fn write_rollback(&mut self) -> Result<(), StorageError> {
        self.reserve(COMMAND_OVERHEAD)?;
        self.scratch.clear();
        self.scratch.push(Command::Rollback as u8);
        self.emit()
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        if let Some(file) = &self.file {
            file.flush_buffer()?;
        }
        Ok(())
    }

    pub fn hard_flush(&self) -> Result<(), StorageError> {
        if let Some(file) = &self.file {
            file.hard_flush()?;
        }
        Ok(())
    }

    /// Leave the active file cleanly closed but appendable. No-op when
    /// nothing was written in this session.
    pub fn close(&mut self) -> Result<(), StorageError> {
        if let Some(file) = &self.file {
            file.append(&[Command::TemporaryEndOfFile as u8])?;
            file.hard_flush()?;
            file.truncate()?;
            tracing::debug!(file_id = file.id().0, size = file.position(), "transaction log closed");
        }
        Ok(())
    }
}

/// Re-applies log files onto a committed snapshot.
///
/// The in-flight working snapshot survives file boundaries: a transaction
/// may start in one file and commit in the next.
pub struct TrLogReplayer<'a> {
    files: &'a FileCollection,
    compression: &'a dyn CompressionStrategy,
    committed: BTreeRoot,
    working: Option<BTreeRoot>,
}

impl<'a> TrLogReplayer<'a> {
    pub fn new(
        files: &'a FileCollection,
        compression: &'a dyn CompressionStrategy,
        committed: BTreeRoot,
    ) -> Self {
        Self {
            files,
            compression,
            committed,
            working: None,
        }
    }

    pub fn committed(&self) -> &BTreeRoot {
        &self.committed
    }

    pub fn into_committed(self) -> BTreeRoot {
        self.committed
    }

    /// Replay `file_id` from `offset` (0 = right after the header).
    ///
    /// Returns `true` when the file ended at a clean boundary (or `offset`
    /// is already its end) and new transactions may be appended to it. Torn writes and corruption stop
    /// replay of this file, dropping only the in-flight transaction.
    pub fn replay_file(&mut self, file_id: FileId, offset: u64) -> bool {
        match self.replay_inner(file_id, offset) {
            Ok(appendable) => appendable,
            Err(StorageError::UnexpectedEof(at)) => {
                tracing::warn!(file_id = file_id.0, offset = at, "torn write in transaction log, dropping incomplete transaction");
                self.working = None;
                false
            }
            Err(e) => {
                tracing::warn!(file_id = file_id.0, error = %e, "transaction log replay stopped");
                self.working = None;
                false
            }
        }
    }

    fn read_key(&self, r: &mut ByteReader<'_>, len: usize, compressed: bool) -> Result<Vec<u8>, StorageError> {
        let mut key = r.read_block(len)?.to_vec();
        if compressed {
            self.compression.decompress_key(&mut key)?;
        }
        Ok(key)
    }

    fn working(&mut self, offset: u64) -> Result<&mut BTreeRoot, StorageError> {
        self.working.as_mut().ok_or_else(|| {
            StorageError::Corrupted(format!("command outside transaction at offset {}", offset))
        })
    }

    fn replay_inner(&mut self, file_id: FileId, offset: u64) -> Result<bool, StorageError> {
        let file = self.files.require_file(file_id)?;
        let data = file.read_all()?;
        let mut r = ByteReader::new(&data);
        if offset == 0 {
            let (_, header_len) = FileInfo::read_header(&data)?;
            r.seek(header_len as u64)?;
        } else {
            r.seek(offset)?;
        }
        if r.is_eof() {
            return Ok(true);
        }
        let mut after_temporary_end = false;
        let mut stack = Vec::new();
        while !r.is_eof() {
            let at = r.position();
            let tag = r.read_u8()?;
            if tag == 0 && after_temporary_end {
                file.set_size(at)?;
                tracing::info!(file_id = file_id.0, offset = at, "log truncated at clean end marker");
                return Ok(true);
            }
            after_temporary_end = false;
            let command =
                Command::from_tag(tag).ok_or(StorageError::UnsupportedCommand { tag, offset: at })?;
            match command {
                Command::TransactionStart => {
                    if !r.check_magic(MAGIC_START_OF_TRANSACTION)? {
                        return Err(StorageError::Corrupted(format!(
                            "bad transaction start magic at offset {}",
                            at
                        )));
                    }
                    self.working = Some(self.committed.new_transaction_root());
                }
                Command::CreateOrUpdate => {
                    let key_len = r.read_length()?;
                    let value_len = r.read_length()?;
                    let key = self.read_key(&mut r, key_len, tag & FIRST_PARAM_COMPRESSED != 0)?;
                    let value_compressed = tag & SECOND_PARAM_COMPRESSED != 0;
                    let value_at = r.position();
                    let bytes = r.read_block(value_len)?;
                    let location = if !value_compressed && value::can_inline(bytes) {
                        value::encode_inline(bytes)?
                    } else {
                        ValueLocation::in_file(
                            file_id,
                            value_offset(value_at)?,
                            value_len,
                            value_compressed,
                        )
                    };
                    self.working(at)?.create_or_update(&key, location);
                }
                Command::EraseOne => {
                    let key_len = r.read_length()?;
                    let key = self.read_key(&mut r, key_len, tag & FIRST_PARAM_COMPRESSED != 0)?;
                    let working = self.working(at)?;
                    if let (FindResult::Exact, index) = working.find_key(&mut stack, &[], &key) {
                        working.erase_range(index, index);
                    }
                }
                Command::EraseRange => {
                    let first_len = r.read_length()?;
                    let last_len = r.read_length()?;
                    let first = self.read_key(&mut r, first_len, tag & FIRST_PARAM_COMPRESSED != 0)?;
                    let last = self.read_key(&mut r, last_len, tag & SECOND_PARAM_COMPRESSED != 0)?;
                    let working = self.working(at)?;
                    if let Some((from, to)) = key_range_indexes(working, &mut stack, &first, &last) {
                        working.erase_range(from, to);
                    }
                }
                Command::CommitWithDeltaUlong | Command::Commit => {
                    let delta = if command == Command::CommitWithDeltaUlong {
                        r.read_vu64()?
                    } else {
                        0
                    };
                    let position = r.position();
                    let mut working = self.working.take().ok_or_else(|| {
                        StorageError::Corrupted(format!("commit outside transaction at offset {}", at))
                    })?;
                    working.commit_ulong = working.commit_ulong.wrapping_add(delta);
                    working.trlog_file_id = file_id;
                    working.trlog_offset = position;
                    self.committed = working;
                }
                Command::Rollback => {
                    self.working = None;
                    self.committed.trlog_file_id = file_id;
                    self.committed.trlog_offset = r.position();
                }
                Command::EndOfFile => {
                    file.set_size(r.position())?;
                    return Ok(false);
                }
                Command::TemporaryEndOfFile => after_temporary_end = true,
            }
        }
        Ok(after_temporary_end)
    }
}

/// Inclusive index range of the keys between `first` and `last`, if any.
pub(crate) fn key_range_indexes(
    root: &BTreeRoot,
    stack: &mut Vec<crate::btree::PathStep>,
    first: &[u8],
    last: &[u8],
) -> Option<(u64, u64)> {
    let from = match root.find_key(stack, &[], first) {
        (FindResult::NotFound, _) => return None,
        (FindResult::Previous, i) => i + 1,
        (_, i) => i,
    };
    let to = match root.find_key(stack, &[], last) {
        (FindResult::NotFound, _) | (FindResult::Next, _) => return None,
        (_, i) => i,
    };
    (from <= to).then_some((from, to))
}
