//! Embedded transactional key-value store.
//!
//! Keys and values are byte strings. Snapshots are persistent copy-on-write
//! B-trees; every write is appended to a transaction log before it becomes
//! visible, and periodic key-index checkpoints bound recovery time. One
//! writer at a time, any number of concurrent readers.
//!
//! ```no_run
//! use kestrel_common::config::KvConfig;
//! use kestrel_storage::KeyValueDb;
//!
//! # fn main() -> kestrel_common::error::KvResult<()> {
//! let db = KeyValueDb::open(KvConfig::with_dir("/tmp/kestrel"))?;
//! let mut tr = db.start_write_transaction().wait()?;
//! tr.create_or_update(b"hello", b"world")?;
//! tr.commit()?;
//! # Ok(())
//! # }
//! ```

pub mod btree;
pub mod codec;
pub mod compactor;
pub mod compression;
pub mod db;
pub mod file_collection;
pub mod key_index;
pub mod sub_db;
pub mod transaction;
pub mod trlog;
pub mod usage;
pub mod value;

pub use btree::FindResult;
pub use compactor::CompactionReport;
pub use db::{DbStats, FileStats, KeyValueDb, WriteGrant};
pub use sub_db::SubDb;
pub use transaction::KvTransaction;
