use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::RwLock;

use crate::backend::{Batch, BatchOp, KvBackend};
use crate::error::Result;

/// In-memory backend for tests and development.
#[derive(Default)]
pub struct MemoryBackend {
    entries: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvBackend for MemoryBackend {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let entries = self.entries.read().expect("backend lock poisoned");
        Ok(entries.get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut entries = self.entries.write().expect("backend lock poisoned");
        entries.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        let mut entries = self.entries.write().expect("backend lock poisoned");
        entries.remove(key);
        Ok(())
    }

    fn write(&self, batch: Batch) -> Result<()> {
        let mut entries = self.entries.write().expect("backend lock poisoned");
        for op in batch.into_ops() {
            match op {
                BatchOp::Put(key, value) => {
                    entries.insert(key, value);
                }
                BatchOp::Delete(key) => {
                    entries.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn scan_prefix_while(
        &self,
        prefix: &[u8],
        f: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<()> {
        let entries = self.entries.read().expect("backend lock poisoned");
        let range = entries.range::<Vec<u8>, _>((Bound::Included(prefix.to_vec()), Bound::Unbounded));
        for (key, value) in range {
            if !key.starts_with(prefix) {
                break;
            }
            if !f(key, value) {
                break;
            }
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_is_atomic_and_ordered() {
        let backend = MemoryBackend::new();
        let mut batch = Batch::new();
        batch.put(b"a:1".to_vec(), b"one".to_vec());
        batch.put(b"a:2".to_vec(), b"two".to_vec());
        batch.put(b"b:1".to_vec(), b"other".to_vec());
        batch.delete(b"a:2".to_vec());
        backend.write(batch).unwrap();

        let entries = backend.scan_prefix(b"a:").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, b"a:1");
    }

    #[test]
    fn scan_stops_when_callback_returns_false() {
        let backend = MemoryBackend::new();
        for i in 0u8..10 {
            backend.put(&[b'k', i], &[i]).unwrap();
        }
        let mut seen = 0;
        backend
            .scan_prefix_while(b"k", &mut |_, _| {
                seen += 1;
                seen < 3
            })
            .unwrap();
        assert_eq!(seen, 3);
    }
}
