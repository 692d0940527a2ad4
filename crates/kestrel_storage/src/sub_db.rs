//! Registry of secondary stores that live next to the main keyspace and
//! share its file collection. Each is created on first request and is
//! bound to the type it was first requested with.

use std::any::{type_name, Any};
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use kestrel_common::error::{KvError, KvResult};

use crate::file_collection::FileCollection;

/// A secondary store attachable by id.
pub trait SubDb: Any + Send + Sync + Sized {
    fn open(id: u64, files: &Arc<FileCollection>) -> KvResult<Self>;
}

#[derive(Default)]
pub(crate) struct SubDbRegistry {
    entries: Mutex<HashMap<u64, Arc<dyn Any + Send + Sync>>>,
}

impl SubDbRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create<T: SubDb>(&self, id: u64, files: &Arc<FileCollection>) -> KvResult<Arc<T>> {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(&id) {
            return Arc::clone(existing)
                .downcast::<T>()
                .map_err(|_| KvError::SubDbTypeMismatch {
                    id,
                    requested: type_name::<T>(),
                });
        }
        let created = Arc::new(T::open(id, files)?);
        entries.insert(id, Arc::clone(&created) as Arc<dyn Any + Send + Sync>);
        tracing::debug!(id, kind = type_name::<T>(), "sub-store attached");
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter(u64);

    impl SubDb for Counter {
        fn open(id: u64, _files: &Arc<FileCollection>) -> KvResult<Self> {
            Ok(Counter(id * 10))
        }
    }

    struct Other;

    impl SubDb for Other {
        fn open(_id: u64, _files: &Arc<FileCollection>) -> KvResult<Self> {
            Ok(Other)
        }
    }

    #[test]
    fn test_get_or_create_is_stable_and_typed() {
        let dir = tempfile::tempdir().unwrap();
        let files = Arc::new(FileCollection::open(dir.path(), 1024).unwrap());
        let registry = SubDbRegistry::new();
        let a = registry.get_or_create::<Counter>(3, &files).unwrap();
        let b = registry.get_or_create::<Counter>(3, &files).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.0, 30);
        assert!(matches!(
            registry.get_or_create::<Other>(3, &files),
            Err(KvError::SubDbTypeMismatch { id: 3, .. })
        ));
        assert!(registry.get_or_create::<Other>(4, &files).is_ok());
    }
}
