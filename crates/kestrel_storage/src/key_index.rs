//! Key-index checkpoints: a full dump of one snapshot's keys and value
//! locations, so recovery can bulk-load the tree and replay only the log
//! written after it.
//!
//! ```text
//! file  = header(KeyIndexInfo) | entry* | marker u32le 0x1234DEAD
//! entry = vi32 key_len (negative: compressed) | key | vu32 file_id
//!         | vu32 offset | vi32 size
//! ```
//!
//! The body is hard-flushed before the marker is appended, so a present
//! marker proves every entry reached disk.

use std::sync::Arc;

use kestrel_common::error::StorageError;
use kestrel_common::shutdown::CancelToken;
use kestrel_common::types::{FileId, TransactionId};

use crate::btree::{BTreeRoot, LeafEntry};
use crate::codec::{write_vi32, write_vu32, ByteReader};
use crate::compression::CompressionStrategy;
use crate::file_collection::{FileCollection, FileInfo, KeyIndexInfo};
use crate::value::ValueLocation;

pub const END_OF_INDEX_MARKER: u32 = 0x1234_DEAD;

/// Write a checkpoint of `root`. Returns `None` when cancelled; the
/// partial file is then discarded and never registered.
pub fn write_key_index(
    files: &FileCollection,
    compression: &dyn CompressionStrategy,
    root: &BTreeRoot,
    cancel: &CancelToken,
) -> Result<Option<FileId>, StorageError> {
    let key_count = root.calc_key_count();
    let info = KeyIndexInfo {
        generation: files.next_generation(),
        trlog_file_id: root.trlog_file_id,
        trlog_offset: root.trlog_offset,
        key_count,
        commit_ulong: root.commit_ulong,
    };
    let generation = info.generation;
    let info = FileInfo::KeyIndex(info);
    let file = files.add_file_with_header(&info)?;
    let mut buf = Vec::with_capacity(256);
    for entry in root.iter() {
        if cancel.is_cancelled() {
            files.make_unknown(file.id());
            files.delete_all_unknown()?;
            tracing::debug!(file_id = file.id().0, "key index write cancelled");
            return Ok(None);
        }
        buf.clear();
        let mut key = entry.key.to_vec();
        let compressed = compression.should_try_compress_key(key.len()) && compression.compress_key(&mut key);
        let len = key.len() as i32;
        write_vi32(&mut buf, if compressed { -len } else { len });
        buf.extend_from_slice(&key);
        write_vu32(&mut buf, entry.value.file_id.0);
        write_vu32(&mut buf, entry.value.offset);
        write_vi32(&mut buf, entry.value.size);
        file.append(&buf)?;
    }
    file.hard_flush()?;
    file.append(&END_OF_INDEX_MARKER.to_le_bytes())?;
    file.hard_flush()?;
    file.truncate()?;
    files.set_info(file.id(), info);
    tracing::info!(
        file_id = file.id().0,
        generation = generation.0,
        key_count,
        trlog_file_id = root.trlog_file_id.0,
        trlog_offset = root.trlog_offset,
        "key index written"
    );
    Ok(Some(file.id()))
}

/// Rebuild the snapshot stored in checkpoint `file_id`.
///
/// The file is accepted only if the entries are followed by the marker or
/// by nothing at all; any trailing bytes, short read or unsorted key makes
/// it corrupt.
pub fn load_key_index(
    files: &FileCollection,
    compression: &dyn CompressionStrategy,
    file_id: FileId,
    info: &KeyIndexInfo,
    transaction_id: TransactionId,
) -> Result<BTreeRoot, StorageError> {
    let file = files.require_file(file_id)?;
    let data = file.read_all()?;
    let (_, header_len) = FileInfo::read_header(&data)?;
    let mut r = ByteReader::new(&data);
    r.seek(header_len as u64)?;

    let mut root = BTreeRoot::new(transaction_id);
    root.trlog_file_id = info.trlog_file_id;
    root.trlog_offset = info.trlog_offset;
    root.commit_ulong = info.commit_ulong;
    root.build_tree(info.key_count, || {
        let len = r.read_vi32()?;
        let mut key = r.read_block(len.unsigned_abs() as usize)?.to_vec();
        if len < 0 {
            compression.decompress_key(&mut key)?;
        }
        let value = ValueLocation {
            file_id: FileId(r.read_vu32()?),
            offset: r.read_vu32()?,
            size: r.read_vi32()?,
        };
        Ok(LeafEntry {
            key: Arc::from(key),
            value,
        })
    })?;
    if !r.is_eof() {
        let at = r.position();
        if r.read_u32_le()? != END_OF_INDEX_MARKER || !r.is_eof() {
            return Err(StorageError::Corrupted(format!(
                "key index {} has trailing data at offset {}",
                file_id, at
            )));
        }
    }
    Ok(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::{NoCompression, ZstdCompression};
    use kestrel_common::config::CompressionConfig;

    fn sample_root(n: u32) -> BTreeRoot {
        let mut root = BTreeRoot::new(TransactionId(7));
        for i in 0..n {
            root.create_or_update(
                format!("key-{:05}", i).as_bytes(),
                ValueLocation::in_file(FileId(3), i * 10, 10, i % 2 == 0),
            );
        }
        root.trlog_file_id = FileId(3);
        root.trlog_offset = 4242;
        root.commit_ulong = 99;
        root
    }

    fn info_of(files: &FileCollection, id: FileId) -> KeyIndexInfo {
        match files.file_info(id) {
            Some(FileInfo::KeyIndex(info)) => info,
            other => panic!("expected key index, got {:?}", other),
        }
    }

    #[test]
    fn test_write_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let files = FileCollection::open(dir.path(), 4096).unwrap();
        let root = sample_root(1500);
        let id = write_key_index(&files, &NoCompression, &root, &CancelToken::new())
            .unwrap()
            .unwrap();
        let info = info_of(&files, id);
        assert_eq!(info.key_count, 1500);
        let loaded = load_key_index(&files, &NoCompression, id, &info, TransactionId(1)).unwrap();
        assert_eq!(loaded.calc_key_count(), 1500);
        assert_eq!(loaded.trlog_offset, 4242);
        assert_eq!(loaded.commit_ulong, 99);
        let a: Vec<LeafEntry> = root.iter().collect();
        let b: Vec<LeafEntry> = loaded.iter().collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_compressed_keys() {
        let dir = tempfile::tempdir().unwrap();
        let files = FileCollection::open(dir.path(), 4096).unwrap();
        let codec = ZstdCompression::new(&CompressionConfig {
            min_key_len: 16,
            ..CompressionConfig::default()
        });
        let mut root = BTreeRoot::new(TransactionId(1));
        let long_key = vec![b'z'; 300];
        root.create_or_update(&long_key, ValueLocation::EMPTY);
        root.create_or_update(b"short", ValueLocation::EMPTY);
        let id = write_key_index(&files, &codec, &root, &CancelToken::new()).unwrap().unwrap();
        assert!(files.file_size(id).unwrap() < 300);
        let info = info_of(&files, id);
        let loaded = load_key_index(&files, &codec, id, &info, TransactionId(1)).unwrap();
        assert!(loaded.get(&long_key).is_some());
        assert!(loaded.get(b"short").is_some());
    }

    #[test]
    fn test_truncated_checkpoint_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let files = FileCollection::open(dir.path(), 4096).unwrap();
        let id = write_key_index(&files, &NoCompression, &sample_root(100), &CancelToken::new())
            .unwrap()
            .unwrap();
        let info = info_of(&files, id);
        let file = files.file(id).unwrap();
        file.set_size(file.position() - 9).unwrap();
        assert!(load_key_index(&files, &NoCompression, id, &info, TransactionId(1)).is_err());
    }

    #[test]
    fn test_missing_marker_with_clean_end_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let files = FileCollection::open(dir.path(), 4096).unwrap();
        let id = write_key_index(&files, &NoCompression, &sample_root(10), &CancelToken::new())
            .unwrap()
            .unwrap();
        let info = info_of(&files, id);
        let file = files.file(id).unwrap();
        file.set_size(file.position() - 4).unwrap();
        let loaded = load_key_index(&files, &NoCompression, id, &info, TransactionId(1)).unwrap();
        assert_eq!(loaded.calc_key_count(), 10);
    }

    #[test]
    fn test_garbage_after_marker_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let files = FileCollection::open(dir.path(), 4096).unwrap();
        let id = write_key_index(&files, &NoCompression, &sample_root(10), &CancelToken::new())
            .unwrap()
            .unwrap();
        let info = info_of(&files, id);
        files.file(id).unwrap().append(&[1, 2]).unwrap();
        assert!(load_key_index(&files, &NoCompression, id, &info, TransactionId(1)).is_err());
    }

    #[test]
    fn test_cancelled_write_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let files = FileCollection::open(dir.path(), 4096).unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = write_key_index(&files, &NoCompression, &sample_root(10), &cancel).unwrap();
        assert!(result.is_none());
        assert_eq!(files.file_count(), 0);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
