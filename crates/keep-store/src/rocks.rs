use std::path::Path;
use std::sync::Arc;

use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};

use crate::backend::{Batch, BatchOp, KvBackend};
use crate::error::{Result, StoreError};

/// RocksDB-backed persistence for production deployments.
pub struct RocksBackend {
    db: Arc<DB>,
}

impl RocksBackend {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts.set_write_buffer_size(32 * 1024 * 1024);
        opts.set_max_background_jobs(2);
        opts.set_level_compaction_dynamic_level_bytes(true);

        let db = DB::open(&opts, path)
            .map_err(|e| StoreError::Backend(format!("failed to open rocksdb: {e}")))?;
        Ok(Self { db: Arc::new(db) })
    }
}

impl KvBackend for RocksBackend {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.db
            .get(key)
            .map_err(|e| StoreError::Backend(format!("rocksdb get: {e}")))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.db
            .put(key, value)
            .map_err(|e| StoreError::Backend(format!("rocksdb put: {e}")))
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.db
            .delete(key)
            .map_err(|e| StoreError::Backend(format!("rocksdb delete: {e}")))
    }

    fn write(&self, batch: Batch) -> Result<()> {
        let mut wb = WriteBatch::default();
        for op in batch.into_ops() {
            match op {
                BatchOp::Put(key, value) => wb.put(key, value),
                BatchOp::Delete(key) => wb.delete(key),
            }
        }
        self.db
            .write(wb)
            .map_err(|e| StoreError::Backend(format!("rocksdb write: {e}")))
    }

    fn scan_prefix_while(
        &self,
        prefix: &[u8],
        f: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<()> {
        let iter = self
            .db
            .iterator(IteratorMode::From(prefix, Direction::Forward));
        for item in iter {
            let (key, value) =
                item.map_err(|e| StoreError::Backend(format!("rocksdb iterator: {e}")))?;
            if !key.starts_with(prefix) {
                break;
            }
            if !f(&key, &value) {
                break;
            }
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.db
            .flush()
            .map_err(|e| StoreError::Backend(format!("rocksdb flush: {e}")))
    }
}
