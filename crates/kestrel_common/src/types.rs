use std::fmt;

use serde::{Deserialize, Serialize};

/// Dense handle of a physical file inside a file collection.
///
/// `FileId(0)` never names a real file: inside a value location it marks an
/// inline value, inside a snapshot it means "no transaction log yet".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct FileId(pub u32);

impl FileId {
    pub const NONE: FileId = FileId(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Global, strictly increasing stamp assigned to every file at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Generation(pub u64);

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Total order over snapshots. Every write transaction gets the successor of
/// the snapshot it was cloned from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct TransactionId(pub u64);

impl TransactionId {
    pub fn next(self) -> TransactionId {
        TransactionId(self.0 + 1)
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Category of a file in the collection, read back from its header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileCategory {
    TransactionLog,
    KeyIndex,
    PureValues,
}

impl FileCategory {
    pub fn tag(self) -> u8 {
        match self {
            FileCategory::TransactionLog => 1,
            FileCategory::KeyIndex => 2,
            FileCategory::PureValues => 3,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(FileCategory::TransactionLog),
            2 => Some(FileCategory::KeyIndex),
            3 => Some(FileCategory::PureValues),
            _ => None,
        }
    }

    /// File name extension used by the on-disk collection.
    pub fn extension(self) -> &'static str {
        match self {
            FileCategory::TransactionLog => "trl",
            FileCategory::KeyIndex => "kvi",
            FileCategory::PureValues => "pvl",
        }
    }
}

impl fmt::Display for FileCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileCategory::TransactionLog => write!(f, "TransactionLog"),
            FileCategory::KeyIndex => write!(f, "KeyIndex"),
            FileCategory::PureValues => write!(f, "PureValues"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_tag_roundtrip() {
        for cat in [
            FileCategory::TransactionLog,
            FileCategory::KeyIndex,
            FileCategory::PureValues,
        ] {
            assert_eq!(FileCategory::from_tag(cat.tag()), Some(cat));
        }
        assert_eq!(FileCategory::from_tag(0), None);
        assert_eq!(FileCategory::from_tag(42), None);
    }

    #[test]
    fn test_transaction_id_next() {
        assert_eq!(TransactionId(7).next(), TransactionId(8));
    }

    #[test]
    fn test_file_id_none() {
        assert!(FileId::NONE.is_none());
        assert!(!FileId(3).is_none());
    }
}
