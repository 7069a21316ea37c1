use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use crate::error::StorageError;
use crate::history::{HistoryStore, Snapshot};

/// In-memory history store shared by every document of a process.
///
/// Holds at most `documents` histories; touching a document makes it the most
/// recently used, and opening one more evicts the least recently used. Each
/// history is capped at `entries` snapshots, newest kept.
#[derive(Clone)]
pub struct HistoryCache {
    inner: Arc<Mutex<LruCache<String, Vec<Snapshot>>>>,
    entries: usize,
}

impl HistoryCache {
    pub fn new(documents: usize, entries: usize) -> Self {
        let capacity = NonZeroUsize::new(documents).unwrap_or(NonZeroUsize::MIN);
        HistoryCache {
            inner: Arc::new(Mutex::new(LruCache::new(capacity))),
            entries,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|cache| cache.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, document_id: &str) -> bool {
        self.inner
            .lock()
            .map(|cache| cache.contains(document_id))
            .unwrap_or(false)
    }

    pub fn forget(&self, document_id: &str) {
        if let Ok(mut cache) = self.inner.lock() {
            cache.pop(document_id);
        }
    }
}

impl HistoryStore for HistoryCache {
    fn persist(&mut self, document_id: &str, entries: &[Snapshot]) -> Result<(), StorageError> {
        let skip = entries.len().saturating_sub(self.entries);
        let mut cache = self
            .inner
            .lock()
            .map_err(|_| StorageError::Config("history cache poisoned".into()))?;
        cache.put(document_id.to_string(), entries[skip..].to_vec());
        Ok(())
    }

    fn load(&mut self, document_id: &str) -> Result<Vec<Snapshot>, StorageError> {
        let mut cache = self
            .inner
            .lock()
            .map_err(|_| StorageError::Config("history cache poisoned".into()))?;
        Ok(cache.get(document_id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Cursor, Document, DocumentStore};
    use crate::history::{Action, ActionKind};
    use crate::schema::Schema;

    fn snapshots(n: usize) -> Vec<Snapshot> {
        let store = DocumentStore::new(Document::new(Schema::from_tags(&["note"])), Cursor(0));
        (0..n)
            .map(|i| Snapshot::capture(&store, Action::new(ActionKind::Edit, format!("e{}", i))))
            .collect()
    }

    #[test]
    fn keeps_only_the_newest_entries() {
        let mut cache = HistoryCache::new(4, 2);
        cache.persist("a", &snapshots(5)).unwrap();
        let loaded = cache.load("a").unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1].action().description, "e4");
    }

    #[test]
    fn evicts_least_recently_used_document() {
        let mut cache = HistoryCache::new(2, 10);
        cache.persist("a", &snapshots(1)).unwrap();
        cache.persist("b", &snapshots(1)).unwrap();
        cache.load("a").unwrap();
        cache.persist("c", &snapshots(1)).unwrap();
        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert!(cache.contains("c"));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn clones_share_storage() {
        let mut cache = HistoryCache::new(2, 10);
        let mut other = cache.clone();
        cache.persist("a", &snapshots(3)).unwrap();
        assert_eq!(other.load("a").unwrap().len(), 3);
        other.forget("a");
        assert!(cache.is_empty());
    }
}
