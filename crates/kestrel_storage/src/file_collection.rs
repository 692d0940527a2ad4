//! File collection: numbered files in one directory, each stamped with a
//! header naming its category, format version and generation.
//!
//! ```text
//! header = magic "KSTL" | category u8 | version u8 | generation vu64
//!          | category fields (varints) | crc32(le) of all preceding bytes
//! ```
//!
//! Metadata (id → descriptor) lives behind one short-held lock that is never
//! held across I/O. Each physical file carries its own lock covering its
//! append buffer and handle.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use kestrel_common::error::StorageError;
use kestrel_common::types::{FileCategory, FileId, Generation};

use crate::codec::{write_vu32, write_vu64, ByteReader};

pub const FILE_MAGIC: &[u8; 4] = b"KSTL";
/// Bump when any header or record layout changes incompatibly.
pub const FORMAT_VERSION: u8 = 1;
/// Enough to hold the largest header.
const MAX_HEADER_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrLogInfo {
    pub generation: Generation,
    pub previous_file_id: FileId,
    /// Derived at startup by walking `previous_file_id` links; not on disk.
    pub next_file_id: FileId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyIndexInfo {
    pub generation: Generation,
    pub trlog_file_id: FileId,
    pub trlog_offset: u64,
    pub key_count: u64,
    pub commit_ulong: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PureValuesInfo {
    pub generation: Generation,
}

/// Descriptor of a known file, one case per category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileInfo {
    TransactionLog(TrLogInfo),
    KeyIndex(KeyIndexInfo),
    PureValues(PureValuesInfo),
}

impl FileInfo {
    pub fn category(&self) -> FileCategory {
        match self {
            FileInfo::TransactionLog(_) => FileCategory::TransactionLog,
            FileInfo::KeyIndex(_) => FileCategory::KeyIndex,
            FileInfo::PureValues(_) => FileCategory::PureValues,
        }
    }

    pub fn generation(&self) -> Generation {
        match self {
            FileInfo::TransactionLog(i) => i.generation,
            FileInfo::KeyIndex(i) => i.generation,
            FileInfo::PureValues(i) => i.generation,
        }
    }

    /// Files whose bytes can be the target of a value location.
    pub fn holds_values(&self) -> bool {
        matches!(self, FileInfo::TransactionLog(_) | FileInfo::PureValues(_))
    }

    pub fn encode_header(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(48);
        buf.extend_from_slice(FILE_MAGIC);
        buf.push(self.category().tag());
        buf.push(FORMAT_VERSION);
        write_vu64(&mut buf, self.generation().0);
        match self {
            FileInfo::TransactionLog(i) => write_vu32(&mut buf, i.previous_file_id.0),
            FileInfo::KeyIndex(i) => {
                write_vu32(&mut buf, i.trlog_file_id.0);
                write_vu64(&mut buf, i.trlog_offset);
                write_vu64(&mut buf, i.key_count);
                write_vu64(&mut buf, i.commit_ulong);
            }
            FileInfo::PureValues(_) => {}
        }
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Parse a header, returning the descriptor and the header length.
    pub fn read_header(data: &[u8]) -> Result<(FileInfo, usize), StorageError> {
        let mut r = ByteReader::new(data);
        if !r.check_magic(FILE_MAGIC)? {
            return Err(StorageError::Corrupted("bad file magic".into()));
        }
        let tag = r.read_u8()?;
        let category = FileCategory::from_tag(tag)
            .ok_or_else(|| StorageError::Corrupted(format!("unknown file category {}", tag)))?;
        let version = r.read_u8()?;
        if version != FORMAT_VERSION {
            return Err(StorageError::Corrupted(format!(
                "unsupported format version {}",
                version
            )));
        }
        let generation = Generation(r.read_vu64()?);
        let info = match category {
            FileCategory::TransactionLog => FileInfo::TransactionLog(TrLogInfo {
                generation,
                previous_file_id: FileId(r.read_vu32()?),
                next_file_id: FileId::NONE,
            }),
            FileCategory::KeyIndex => FileInfo::KeyIndex(KeyIndexInfo {
                generation,
                trlog_file_id: FileId(r.read_vu32()?),
                trlog_offset: r.read_vu64()?,
                key_count: r.read_vu64()?,
                commit_ulong: r.read_vu64()?,
            }),
            FileCategory::PureValues => FileInfo::PureValues(PureValuesInfo { generation }),
        };
        let body_len = r.position() as usize;
        let stored = r.read_u32_le()?;
        if crc32fast::hash(&data[..body_len]) != stored {
            return Err(StorageError::Corrupted("header checksum mismatch".into()));
        }
        Ok((info, body_len + 4))
    }
}

/// Physical file with a single append buffer.
pub struct CollectionFile {
    id: FileId,
    path: PathBuf,
    state: Mutex<FileState>,
    write_buffer_bytes: usize,
}

struct FileState {
    file: File,
    flushed_len: u64,
    pending: Vec<u8>,
}

impl FileState {
    fn flush(&mut self) -> std::io::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.file.seek(SeekFrom::Start(self.flushed_len))?;
        self.file.write_all(&self.pending)?;
        self.flushed_len += self.pending.len() as u64;
        self.pending.clear();
        Ok(())
    }
}

impl CollectionFile {
    fn open(id: FileId, path: PathBuf, write_buffer_bytes: usize) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let flushed_len = file.metadata()?.len();
        Ok(Self {
            id,
            path,
            state: Mutex::new(FileState {
                file,
                flushed_len,
                pending: Vec::new(),
            }),
            write_buffer_bytes,
        })
    }

    pub fn id(&self) -> FileId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Logical length including buffered bytes; the next append lands here.
    pub fn position(&self) -> u64 {
        let state = self.state.lock();
        state.flushed_len + state.pending.len() as u64
    }

    pub fn append(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut state = self.state.lock();
        state.pending.extend_from_slice(bytes);
        if state.pending.len() >= self.write_buffer_bytes {
            state.flush()?;
        }
        Ok(())
    }

    pub fn flush_buffer(&self) -> std::io::Result<()> {
        self.state.lock().flush()
    }

    /// Flush buffered bytes and force them to stable storage.
    pub fn hard_flush(&self) -> std::io::Result<()> {
        let mut state = self.state.lock();
        state.flush()?;
        state.file.sync_data()
    }

    /// Cut the physical file to its logical length.
    pub fn truncate(&self) -> std::io::Result<()> {
        let mut state = self.state.lock();
        state.flush()?;
        let len = state.flushed_len;
        state.file.set_len(len)
    }

    /// Cut the file at `len`, dropping anything buffered past it.
    pub fn set_size(&self, len: u64) -> std::io::Result<()> {
        let mut state = self.state.lock();
        state.flush()?;
        state.file.set_len(len)?;
        state.flushed_len = len;
        Ok(())
    }

    /// Read `buf.len()` bytes at `offset`, seeing buffered bytes too.
    pub fn random_read(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        let end = offset + buf.len() as u64;
        let total = state.flushed_len + state.pending.len() as u64;
        if end > total {
            return Err(StorageError::UnexpectedEof(offset));
        }
        let from_file = state.flushed_len.saturating_sub(offset).min(buf.len() as u64) as usize;
        if from_file > 0 {
            state.file.seek(SeekFrom::Start(offset))?;
            state.file.read_exact(&mut buf[..from_file])?;
        }
        if from_file < buf.len() {
            let start = (offset + from_file as u64 - state.flushed_len) as usize;
            let rest = buf.len() - from_file;
            buf[from_file..].copy_from_slice(&state.pending[start..start + rest]);
        }
        Ok(())
    }

    /// Whole-file image for sequential replay.
    pub fn read_all(&self) -> std::io::Result<Vec<u8>> {
        let mut state = self.state.lock();
        state.flush()?;
        let len = state.flushed_len;
        let mut data = Vec::with_capacity(len as usize);
        let file = &mut state.file;
        file.seek(SeekFrom::Start(0))?;
        file.take(len).read_to_end(&mut data)?;
        Ok(data)
    }

    pub fn size(&self) -> u64 {
        self.position()
    }

    fn read_prefix(&self, max: usize) -> std::io::Result<Vec<u8>> {
        let mut state = self.state.lock();
        let len = (state.flushed_len as usize).min(max);
        let mut data = vec![0u8; len];
        state.file.seek(SeekFrom::Start(0))?;
        state.file.read_exact(&mut data)?;
        Ok(data)
    }
}

#[derive(Debug, Clone)]
enum EntryState {
    /// Created, header not yet committed to metadata.
    Building,
    Known(FileInfo),
    /// Superseded or unreadable; removed by the next sweep.
    Unknown,
}

struct FileEntry {
    file: Arc<CollectionFile>,
    state: EntryState,
}

/// Registry of the store's files.
pub struct FileCollection {
    dir: PathBuf,
    entries: RwLock<BTreeMap<FileId, FileEntry>>,
    next_id: AtomicU32,
    last_generation: AtomicU64,
    write_buffer_bytes: usize,
}

fn file_name(id: FileId, category: FileCategory) -> String {
    format!("{:08}.{}", id.0, category.extension())
}

fn parse_file_name(name: &str) -> Option<FileId> {
    let (stem, ext) = name.split_once('.')?;
    if !["trl", "kvi", "pvl"].contains(&ext) || stem.len() != 8 {
        return None;
    }
    stem.parse::<u32>().ok().filter(|id| *id != 0).map(FileId)
}

impl FileCollection {
    /// Open (creating if needed) the collection in `dir` and classify every
    /// file by its header.
    pub fn open(dir: &Path, write_buffer_bytes: usize) -> Result<Self, StorageError> {
        fs::create_dir_all(dir)?;
        let mut entries = BTreeMap::new();
        let mut max_id = 0u32;
        let mut max_generation = 0u64;
        for dirent in fs::read_dir(dir)?.flatten() {
            let name = dirent.file_name();
            let Some(id) = parse_file_name(&name.to_string_lossy()) else {
                continue;
            };
            max_id = max_id.max(id.0);
            let file = Arc::new(CollectionFile::open(id, dirent.path(), write_buffer_bytes)?);
            let state = match FileInfo::read_header(&file.read_prefix(MAX_HEADER_LEN)?) {
                Ok((info, _)) => {
                    max_generation = max_generation.max(info.generation().0);
                    EntryState::Known(info)
                }
                Err(e) => {
                    tracing::warn!(file_id = id.0, error = %e, "unreadable file header, marking unknown");
                    EntryState::Unknown
                }
            };
            entries.insert(id, FileEntry { file, state });
        }
        tracing::debug!(
            dir = %dir.display(),
            files = entries.len(),
            last_generation = max_generation,
            "file collection opened"
        );
        Ok(Self {
            dir: dir.to_path_buf(),
            entries: RwLock::new(entries),
            next_id: AtomicU32::new(max_id + 1),
            last_generation: AtomicU64::new(max_generation),
            write_buffer_bytes,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn next_generation(&self) -> Generation {
        Generation(self.last_generation.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn last_generation(&self) -> Generation {
        Generation(self.last_generation.load(Ordering::SeqCst))
    }

    /// Create an empty file of `category`. It is invisible to recovery and
    /// to sweeps until `set_info` registers its descriptor.
    pub fn add_file(&self, category: FileCategory) -> Result<Arc<CollectionFile>, StorageError> {
        let id = FileId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let path = self.dir.join(file_name(id, category));
        let file = Arc::new(CollectionFile::open(id, path, self.write_buffer_bytes)?);
        self.entries.write().insert(
            id,
            FileEntry {
                file: Arc::clone(&file),
                state: EntryState::Building,
            },
        );
        tracing::debug!(file_id = id.0, %category, "file created");
        Ok(file)
    }

    /// Create a file and write the header for `info` into its buffer.
    pub fn add_file_with_header(
        &self,
        info: &FileInfo,
    ) -> Result<Arc<CollectionFile>, StorageError> {
        let file = self.add_file(info.category())?;
        file.append(&info.encode_header())?;
        Ok(file)
    }

    pub fn set_info(&self, id: FileId, info: FileInfo) {
        if let Some(entry) = self.entries.write().get_mut(&id) {
            entry.state = EntryState::Known(info);
        }
    }

    pub fn file(&self, id: FileId) -> Option<Arc<CollectionFile>> {
        self.entries.read().get(&id).map(|e| Arc::clone(&e.file))
    }

    pub fn require_file(&self, id: FileId) -> Result<Arc<CollectionFile>, StorageError> {
        self.file(id).ok_or(StorageError::UnknownFileId(id))
    }

    pub fn file_info(&self, id: FileId) -> Option<FileInfo> {
        match self.entries.read().get(&id).map(|e| &e.state) {
            Some(EntryState::Known(info)) => Some(info.clone()),
            _ => None,
        }
    }

    /// All known descriptors in id order.
    pub fn file_infos(&self) -> Vec<(FileId, FileInfo)> {
        self.entries
            .read()
            .iter()
            .filter_map(|(id, e)| match &e.state {
                EntryState::Known(info) => Some((*id, info.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn generation_of(&self, id: FileId) -> Option<Generation> {
        self.file_info(id).map(|i| i.generation())
    }

    pub fn set_next_file_id(&self, id: FileId, next: FileId) {
        if let Some(FileEntry {
            state: EntryState::Known(FileInfo::TransactionLog(info)),
            ..
        }) = self.entries.write().get_mut(&id)
        {
            info.next_file_id = next;
        }
    }

    pub fn make_unknown(&self, id: FileId) {
        if let Some(entry) = self.entries.write().get_mut(&id) {
            entry.state = EntryState::Unknown;
        }
    }

    /// Number of files with a registered descriptor.
    pub fn file_count(&self) -> usize {
        self.entries
            .read()
            .values()
            .filter(|e| matches!(e.state, EntryState::Known(_)))
            .count()
    }

    pub fn file_size(&self, id: FileId) -> Option<u64> {
        self.file(id).map(|f| f.size())
    }

    /// Physically remove every file marked unknown. Returns how many were
    /// deleted.
    pub fn delete_all_unknown(&self) -> Result<usize, StorageError> {
        let doomed: Vec<(FileId, Arc<CollectionFile>)> = {
            let mut entries = self.entries.write();
            let ids: Vec<FileId> = entries
                .iter()
                .filter(|(_, e)| matches!(e.state, EntryState::Unknown))
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| entries.remove(&id).map(|e| (id, e.file)))
                .collect()
        };
        for (id, file) in &doomed {
            match fs::remove_file(file.path()) {
                Ok(()) => tracing::info!(file_id = id.0, path = %file.path().display(), "file deleted"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(doomed.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trlog(generation: u64, previous: u32) -> FileInfo {
        FileInfo::TransactionLog(TrLogInfo {
            generation: Generation(generation),
            previous_file_id: FileId(previous),
            next_file_id: FileId::NONE,
        })
    }

    #[test]
    fn test_header_roundtrip_key_index() {
        let info = FileInfo::KeyIndex(KeyIndexInfo {
            generation: Generation(12),
            trlog_file_id: FileId(4),
            trlog_offset: 9_000,
            key_count: 77,
            commit_ulong: u64::MAX,
        });
        let header = info.encode_header();
        let (parsed, len) = FileInfo::read_header(&header).unwrap();
        assert_eq!(parsed, info);
        assert_eq!(len, header.len());
    }

    #[test]
    fn test_header_checksum_detects_flip() {
        let mut header = trlog(3, 1).encode_header();
        let n = header.len();
        header[n - 6] ^= 0x01;
        assert!(FileInfo::read_header(&header).is_err());
    }

    #[test]
    fn test_header_rejects_other_version() {
        let mut header = trlog(3, 1).encode_header();
        header[5] = FORMAT_VERSION + 1;
        assert!(matches!(
            FileInfo::read_header(&header),
            Err(StorageError::Corrupted(_))
        ));
    }

    #[test]
    fn test_reopen_classifies_files() {
        let dir = tempfile::tempdir().unwrap();
        {
            let fc = FileCollection::open(dir.path(), 1024).unwrap();
            let info = trlog(fc.next_generation().0, 0);
            let f = fc.add_file_with_header(&info).unwrap();
            f.append(b"payload").unwrap();
            f.hard_flush().unwrap();
            fc.set_info(f.id(), info);
            // A file that never got a header.
            let junk = fc.add_file(FileCategory::PureValues).unwrap();
            junk.append(b"xx").unwrap();
            junk.flush_buffer().unwrap();
        }
        let fc = FileCollection::open(dir.path(), 1024).unwrap();
        assert_eq!(fc.file_count(), 1);
        assert_eq!(fc.last_generation(), Generation(1));
        assert_eq!(fc.next_generation(), Generation(2));
        let infos = fc.file_infos();
        assert_eq!(infos[0].1.category(), FileCategory::TransactionLog);
        assert_eq!(fc.delete_all_unknown().unwrap(), 1);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_random_read_spans_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let fc = FileCollection::open(dir.path(), 1 << 20).unwrap();
        let f = fc.add_file(FileCategory::PureValues).unwrap();
        f.append(b"hello ").unwrap();
        f.flush_buffer().unwrap();
        f.append(b"world").unwrap();
        let mut buf = [0u8; 8];
        f.random_read(3, &mut buf).unwrap();
        assert_eq!(&buf, b"lo world");
        let mut too_far = [0u8; 4];
        assert!(f.random_read(9, &mut too_far).is_err());
    }

    #[test]
    fn test_set_size_discards_tail() {
        let dir = tempfile::tempdir().unwrap();
        let fc = FileCollection::open(dir.path(), 4).unwrap();
        let f = fc.add_file(FileCategory::TransactionLog).unwrap();
        f.append(b"0123456789").unwrap();
        f.set_size(4).unwrap();
        assert_eq!(f.position(), 4);
        assert_eq!(f.read_all().unwrap(), b"0123");
        assert_eq!(std::fs::metadata(f.path()).unwrap().len(), 4);
    }

    #[test]
    fn test_building_files_survive_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let fc = FileCollection::open(dir.path(), 1024).unwrap();
        let building = fc.add_file(FileCategory::KeyIndex).unwrap();
        let doomed = fc.add_file(FileCategory::PureValues).unwrap();
        fc.make_unknown(doomed.id());
        assert_eq!(fc.delete_all_unknown().unwrap(), 1);
        assert!(fc.file(building.id()).is_some());
        assert!(fc.file(doomed.id()).is_none());
        assert!(matches!(
            fc.require_file(doomed.id()),
            Err(StorageError::UnknownFileId(_))
        ));
    }
}
