use thiserror::Error;

use crate::types::{FileId, TransactionId};

/// Convenience alias for `Result<T, KvError>`.
pub type KvResult<T> = Result<T, KvError>;

/// Error classification for retry/escalation decisions.
///
/// - `UserError`   : API misuse (write on a read-only handle, closing with a live writer)
/// - `Retryable`   : the snapshot moved under the caller; restart against the new one
/// - `Corruption`  : on-disk data could not be interpreted; aborts only the current operation
/// - `InternalBug` : should never happen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UserError,
    Retryable,
    Corruption,
    InternalBug,
}

/// Top-level error type that all crate-specific errors convert into.
#[derive(Error, Debug)]
pub enum KvError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Transaction error: {0}")]
    Txn(#[from] TxnError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Sub-store {id} already registered with a different type (requested {requested})")]
    SubDbTypeMismatch { id: u64, requested: &'static str },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl KvError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            KvError::Storage(StorageError::Io(_)) => ErrorKind::InternalBug,
            KvError::Storage(_) => ErrorKind::Corruption,
            KvError::Txn(TxnError::RetryRequired(_)) => ErrorKind::Retryable,
            KvError::Txn(_) => ErrorKind::UserError,
            KvError::Config(_) | KvError::SubDbTypeMismatch { .. } => ErrorKind::UserError,
            KvError::Internal(_) => ErrorKind::InternalBug,
        }
    }

    /// True when the caller should restart its transaction against the
    /// current snapshot.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Retryable
    }
}

impl From<std::io::Error> for KvError {
    fn from(e: std::io::Error) -> Self {
        KvError::Storage(StorageError::Io(e))
    }
}

/// Storage layer errors.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown file id {0}")]
    UnknownFileId(FileId),

    #[error("Unsupported command tag {tag:#04x} at offset {offset}")]
    UnsupportedCommand { tag: u8, offset: u64 },

    #[error("Malformed inline value length {0}")]
    MalformedInlineValue(usize),

    #[error("Unexpected end of data at offset {0}")]
    UnexpectedEof(u64),

    #[error("Corrupted data: {0}")]
    Corrupted(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Bulk load keys are not strictly ascending at position {0}")]
    UnsortedBulkLoad(u64),
}

/// Transaction layer errors.
#[derive(Error, Debug)]
pub enum TxnError {
    #[error("Retry required: {0}")]
    RetryRequired(String),

    #[error("Cannot close store while writing transaction {0} is still running")]
    WriterStillActive(TransactionId),

    #[error("Transaction is read-only")]
    ReadOnly,

    #[error("Store is closed")]
    Closed,

    #[error("Write request cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_is_retryable() {
        let e: KvError = TxnError::RetryRequired("writer finished".into()).into();
        assert!(e.is_retryable());
        assert_eq!(e.kind(), ErrorKind::Retryable);
    }

    #[test]
    fn test_usage_faults_are_not_retryable() {
        let e: KvError = TxnError::WriterStillActive(TransactionId(3)).into();
        assert!(!e.is_retryable());
        assert_eq!(e.kind(), ErrorKind::UserError);
        assert!(e.to_string().contains("transaction 3"));
    }

    #[test]
    fn test_corruption_kind() {
        let e: KvError = StorageError::UnknownFileId(FileId(9)).into();
        assert_eq!(e.kind(), ErrorKind::Corruption);
        let e: KvError = StorageError::MalformedInlineValue(12).into();
        assert_eq!(e.kind(), ErrorKind::Corruption);
    }

    #[test]
    fn test_io_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let e: KvError = io.into();
        assert!(matches!(e, KvError::Storage(StorageError::Io(_))));
    }
}
