use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;

use keep_types::Hash256;

/// Read-only LRU over recently touched sectors, keyed by root. Entries
/// never hold a sector lock; lookups still go through the metadata store
/// for lock acquisition.
pub struct SectorCache {
    inner: Option<Mutex<LruCache<Hash256, Arc<Vec<u8>>>>>,
}

impl SectorCache {
    /// `capacity` is in sectors; zero disables caching.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: NonZeroUsize::new(capacity).map(|cap| Mutex::new(LruCache::new(cap))),
        }
    }

    pub fn get(&self, root: &Hash256) -> Option<Arc<Vec<u8>>> {
        let inner = self.inner.as_ref()?;
        let mut cache = inner.lock().expect("cache lock poisoned");
        cache.get(root).cloned()
    }

    pub fn put(&self, root: Hash256, sector: Arc<Vec<u8>>) {
        if let Some(inner) = &self.inner {
            let mut cache = inner.lock().expect("cache lock poisoned");
            cache.put(root, sector);
        }
    }

    pub fn remove(&self, root: &Hash256) {
        if let Some(inner) = &self.inner {
            let mut cache = inner.lock().expect("cache lock poisoned");
            cache.pop(root);
        }
    }

    pub fn len(&self) -> usize {
        match &self.inner {
            Some(inner) => inner.lock().expect("cache lock poisoned").len(),
            None => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_least_recently_used() {
        let cache = SectorCache::new(2);
        let roots: Vec<Hash256> = (0u8..3).map(|i| Hash256::from_bytes([i; 32])).collect();
        cache.put(roots[0], Arc::new(vec![0]));
        cache.put(roots[1], Arc::new(vec![1]));
        assert!(cache.get(&roots[0]).is_some());
        cache.put(roots[2], Arc::new(vec![2]));

        // roots[1] was the least recently used entry.
        assert!(cache.get(&roots[1]).is_none());
        assert!(cache.get(&roots[0]).is_some());
        assert!(cache.get(&roots[2]).is_some());
    }

    #[test]
    fn zero_capacity_disables_cache() {
        let cache = SectorCache::new(0);
        cache.put(Hash256::default(), Arc::new(vec![1]));
        assert!(cache.get(&Hash256::default()).is_none());
        assert!(cache.is_empty());
    }
}
