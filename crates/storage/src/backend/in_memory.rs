use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::{Arc, RwLock, RwLockReadGuard};

use crate::api::{StorageBackend, StorageCursor, StorageReadView, StorageWriteBatch};
use crate::error::StoreError;

type Table = BTreeMap<Vec<u8>, Vec<u8>>;
type Database = HashMap<&'static str, Table>;

/// Ordered in-memory backend. Tables are `BTreeMap`s so cursors get
/// byte-lexicographic iteration for free.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    inner: Arc<RwLock<Database>>,
}

impl InMemoryBackend {
    pub fn open() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl StorageBackend for InMemoryBackend {
    fn create_table(&self, name: &'static str) -> Result<(), StoreError> {
        let mut db = self.inner.write().map_err(|_| StoreError::LockError)?;
        db.entry(name).or_default();
        Ok(())
    }

    fn begin_read(&self) -> Result<Box<dyn StorageReadView + '_>, StoreError> {
        let guard = self.inner.read().map_err(|_| StoreError::LockError)?;
        Ok(Box::new(InMemoryReadView { guard }))
    }

    fn begin_write(&self) -> Result<Box<dyn StorageWriteBatch + '_>, StoreError> {
        Ok(Box::new(InMemoryWriteBatch {
            backend: self.inner.clone(),
            ops: Vec::new(),
        }))
    }
}

pub struct InMemoryReadView<'a> {
    guard: RwLockReadGuard<'a, Database>,
}

impl StorageReadView for InMemoryReadView<'_> {
    fn get(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let table = self
            .guard
            .get(table)
            .ok_or_else(|| StoreError::UnknownTable(table.to_string()))?;
        Ok(table.get(key).cloned())
    }

    fn cursor<'a>(&'a self, table: &str) -> Result<Box<dyn StorageCursor + 'a>, StoreError> {
        let table = self
            .guard
            .get(table)
            .ok_or_else(|| StoreError::UnknownTable(table.to_string()))?;
        Ok(Box::new(InMemoryCursor {
            table,
            position: None,
        }))
    }
}

struct InMemoryCursor<'a> {
    table: &'a Table,
    position: Option<Vec<u8>>,
}

impl StorageCursor for InMemoryCursor<'_> {
    fn seek(&mut self, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>, StoreError> {
        let entry = self
            .table
            .range::<[u8], _>((Bound::Included(key), Bound::Unbounded))
            .next()
            .map(|(k, v)| (k.clone(), v.clone()));
        self.position = entry.as_ref().map(|(k, _)| k.clone());
        Ok(entry)
    }

    fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>, StoreError> {
        let Some(position) = &self.position else {
            return Ok(None);
        };
        let entry = self
            .table
            .range::<[u8], _>((Bound::Excluded(position.as_slice()), Bound::Unbounded))
            .next()
            .map(|(k, v)| (k.clone(), v.clone()));
        self.position = entry.as_ref().map(|(k, _)| k.clone());
        Ok(entry)
    }
}

enum WriteOp {
    Put(&'static str, Vec<u8>, Vec<u8>),
    Delete(&'static str, Vec<u8>),
    DeletePrefix(&'static str, Vec<u8>),
}

/// Buffers writes and applies them atomically under the write lock on
/// commit.
pub struct InMemoryWriteBatch {
    backend: Arc<RwLock<Database>>,
    ops: Vec<WriteOp>,
}

impl StorageWriteBatch for InMemoryWriteBatch {
    fn put(&mut self, table: &'static str, key: Vec<u8>, value: Vec<u8>) -> Result<(), StoreError> {
        self.ops.push(WriteOp::Put(table, key, value));
        Ok(())
    }

    fn delete(&mut self, table: &'static str, key: &[u8]) -> Result<(), StoreError> {
        self.ops.push(WriteOp::Delete(table, key.to_vec()));
        Ok(())
    }

    fn delete_prefix(&mut self, table: &'static str, prefix: &[u8]) -> Result<(), StoreError> {
        self.ops.push(WriteOp::DeletePrefix(table, prefix.to_vec()));
        Ok(())
    }

    fn multi_put(
        &mut self,
        entries: Vec<(&'static str, Vec<u8>, Vec<u8>)>,
    ) -> Result<(), StoreError> {
        // keys land in a BTreeMap, which orders them regardless of the
        // arrival order
        for (table, key, value) in entries {
            self.ops.push(WriteOp::Put(table, key, value));
        }
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let mut db = self.backend.write().map_err(|_| StoreError::LockError)?;
        for op in self.ops {
            match op {
                WriteOp::Put(table, key, value) => {
                    db.entry(table).or_default().insert(key, value);
                }
                WriteOp::Delete(table, key) => {
                    db.entry(table).or_default().remove(&key);
                }
                WriteOp::DeletePrefix(table, prefix) => {
                    let table = db.entry(table).or_default();
                    let doomed: Vec<Vec<u8>> = table
                        .range(prefix.clone()..)
                        .take_while(|(k, _)| k.starts_with(&prefix))
                        .map(|(k, _)| k.clone())
                        .collect();
                    for key in doomed {
                        table.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }
}
