use std::fmt::Debug;

use crate::error::StoreError;

/// The minimum a key-value backend must provide for the trie engine:
/// ordered tables with point reads, forward cursors and batched writes.
pub trait StorageBackend: Debug + Send + Sync + 'static {
    fn create_table(&self, name: &'static str) -> Result<(), StoreError>;
    /// Opens a read snapshot spanning one whole scan.
    fn begin_read(&self) -> Result<Box<dyn StorageReadView + '_>, StoreError>;
    /// Opens a write transaction spanning one whole post-scan flush.
    fn begin_write(&self) -> Result<Box<dyn StorageWriteBatch + '_>, StoreError>;
}

pub trait StorageReadView {
    fn get(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;
    fn cursor<'a>(&'a self, table: &str) -> Result<Box<dyn StorageCursor + 'a>, StoreError>;
}

/// A forward-only cursor over an ordered table.
pub trait StorageCursor {
    /// Positions at the first entry with key >= `key`.
    fn seek(&mut self, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>, StoreError>;
    /// Advances past the current entry.
    fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>, StoreError>;
}

pub trait StorageWriteBatch {
    fn put(&mut self, table: &'static str, key: Vec<u8>, value: Vec<u8>) -> Result<(), StoreError>;
    fn delete(&mut self, table: &'static str, key: &[u8]) -> Result<(), StoreError>;
    /// Removes every key starting with `prefix`.
    fn delete_prefix(&mut self, table: &'static str, prefix: &[u8]) -> Result<(), StoreError>;
    /// Stages a flat stream of `(table, key, value)` triples. Keys may arrive
    /// unsorted; the store orders them before write.
    fn multi_put(
        &mut self,
        entries: Vec<(&'static str, Vec<u8>, Vec<u8>)>,
    ) -> Result<(), StoreError>;
    fn commit(self: Box<Self>) -> Result<(), StoreError>;
}
