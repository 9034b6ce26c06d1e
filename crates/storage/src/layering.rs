//! Read-through overlays: pending block changes layered over a store
//! snapshot, so scans observe "store ⊕ changes" without writing anything.

use std::collections::BTreeMap;
use std::ops::Bound;

use rustc_hash::FxHashMap;

use crate::api::{StorageCursor, StorageReadView, StorageWriteBatch};
use crate::error::StoreError;

type Entries = BTreeMap<Vec<u8>, Option<Vec<u8>>>;

/// Pending changes for a set of tables. `None` values are tombstones;
/// deleted prefixes hide whole key ranges of the base view (used to drop an
/// account's storage without enumerating its rows).
#[derive(Debug, Default)]
pub struct Overlay {
    tables: FxHashMap<&'static str, Entries>,
    deleted_prefixes: FxHashMap<&'static str, Vec<Vec<u8>>>,
}

impl Overlay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, table: &'static str, key: Vec<u8>, value: Vec<u8>) {
        self.tables.entry(table).or_default().insert(key, Some(value));
    }

    pub fn delete(&mut self, table: &'static str, key: Vec<u8>) {
        self.tables.entry(table).or_default().insert(key, None);
    }

    /// Hides every base key starting with `prefix` and drops overlaid
    /// entries under it.
    pub fn delete_prefix(&mut self, table: &'static str, prefix: Vec<u8>) {
        let entries = self.tables.entry(table).or_default();
        let doomed: Vec<Vec<u8>> = entries
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in doomed {
            entries.remove(&key);
        }
        let prefixes = self.deleted_prefixes.entry(table).or_default();
        prefixes.push(prefix);
        prefixes.sort();
        prefixes.dedup();
    }

    /// The overlaid value for `key`: `None` if the overlay has no opinion,
    /// `Some(None)` if the key is deleted here.
    pub fn get(&self, table: &str, key: &[u8]) -> Option<Option<&[u8]>> {
        if let Some(entry) = self.tables.get(table).and_then(|t| t.get(key)) {
            return Some(entry.as_deref());
        }
        if self.covers(table, key) {
            return Some(None);
        }
        None
    }

    fn covers(&self, table: &str, key: &[u8]) -> bool {
        let Some(prefixes) = self.deleted_prefixes.get(table) else {
            return false;
        };
        let idx = prefixes.partition_point(|p| p.as_slice() <= key);
        idx > 0 && key.starts_with(&prefixes[idx - 1])
    }

    fn entries(&self, table: &str) -> Option<&Entries> {
        self.tables.get(table)
    }

    fn prefixes(&self, table: &str) -> &[Vec<u8>] {
        self.deleted_prefixes
            .get(table)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Writes the overlay out: prefix deletions first, then tombstones, then
    /// the surviving entries.
    pub fn flush_into(&self, batch: &mut dyn StorageWriteBatch) -> Result<(), StoreError> {
        for (&table, prefixes) in &self.deleted_prefixes {
            for prefix in prefixes {
                batch.delete_prefix(table, prefix)?;
            }
        }
        let mut puts = Vec::new();
        for (&table, entries) in &self.tables {
            for (key, value) in entries {
                match value {
                    Some(value) => puts.push((table, key.clone(), value.clone())),
                    None => batch.delete(table, key)?,
                }
            }
        }
        batch.multi_put(puts)
    }

    pub fn clear(&mut self) {
        self.tables.clear();
        self.deleted_prefixes.clear();
    }
}

/// A read view that resolves through an [`Overlay`] before the base view.
pub struct OverlayView<'a> {
    base: &'a dyn StorageReadView,
    overlay: &'a Overlay,
}

impl<'a> OverlayView<'a> {
    pub fn new(base: &'a dyn StorageReadView, overlay: &'a Overlay) -> Self {
        Self { base, overlay }
    }
}

impl StorageReadView for OverlayView<'_> {
    fn get(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        match self.overlay.get(table, key) {
            Some(value) => Ok(value.map(<[u8]>::to_vec)),
            None => self.base.get(table, key),
        }
    }

    fn cursor<'c>(&'c self, table: &str) -> Result<Box<dyn StorageCursor + 'c>, StoreError> {
        static EMPTY: Entries = BTreeMap::new();
        Ok(Box::new(OverlayCursor {
            base: self.base.cursor(table)?,
            entries: self.overlay.entries(table).unwrap_or(&EMPTY),
            deleted_prefixes: self.overlay.prefixes(table),
            base_entry: None,
            overlay_key: None,
        }))
    }
}

/// Merge-iterates the overlay entries and the base cursor, with the overlay
/// shadowing the base on equal keys.
struct OverlayCursor<'a> {
    base: Box<dyn StorageCursor + 'a>,
    entries: &'a Entries,
    deleted_prefixes: &'a [Vec<u8>],
    base_entry: Option<(Vec<u8>, Vec<u8>)>,
    overlay_key: Option<Vec<u8>>,
}

impl OverlayCursor<'_> {
    fn base_hidden(&self, key: &[u8]) -> bool {
        let idx = self
            .deleted_prefixes
            .partition_point(|p| p.as_slice() <= key);
        idx > 0 && key.starts_with(&self.deleted_prefixes[idx - 1])
    }

    fn skip_hidden_base(&mut self) -> Result<(), StoreError> {
        while let Some((key, _)) = &self.base_entry {
            if self.base_hidden(key) {
                self.base_entry = self.base.next()?;
            } else {
                break;
            }
        }
        Ok(())
    }

    fn overlay_entry(&self) -> Option<(&Vec<u8>, &Option<Vec<u8>>)> {
        let bound = match &self.overlay_key {
            Some(key) => Bound::Excluded(key.clone()),
            None => Bound::Unbounded,
        };
        self.entries.range((bound, Bound::Unbounded)).next()
    }

    fn merged_next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>, StoreError> {
        loop {
            self.skip_hidden_base()?;
            let overlay = self
                .overlay_entry()
                .map(|(k, v)| (k.clone(), v.clone()));
            match (&self.base_entry, overlay) {
                (None, None) => return Ok(None),
                (Some(_), None) => {
                    let out = self.base_entry.take();
                    self.base_entry = self.base.next()?;
                    return Ok(out);
                }
                (None, Some((key, value))) => {
                    self.overlay_key = Some(key.clone());
                    if let Some(value) = value {
                        return Ok(Some((key, value)));
                    }
                }
                (Some((base_key, _)), Some((key, value))) => {
                    if key < *base_key {
                        self.overlay_key = Some(key.clone());
                        if let Some(value) = value {
                            return Ok(Some((key, value)));
                        }
                    } else if key == *base_key {
                        // overlay shadows the base row
                        self.overlay_key = Some(key.clone());
                        self.base_entry = self.base.next()?;
                        if let Some(value) = value {
                            return Ok(Some((key, value)));
                        }
                    } else {
                        let out = self.base_entry.take();
                        self.base_entry = self.base.next()?;
                        return Ok(out);
                    }
                }
            }
        }
    }
}

impl StorageCursor for OverlayCursor<'_> {
    fn seek(&mut self, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>, StoreError> {
        self.base_entry = self.base.seek(key)?;
        // position the overlay iteration just before `key`
        self.overlay_key = self
            .entries
            .range(..key.to_vec())
            .next_back()
            .map(|(k, _)| k.clone());
        self.merged_next()
    }

    fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>, StoreError> {
        self.merged_next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::in_memory::InMemoryBackend;
    use crate::tables;
    use crate::api::StorageBackend;

    fn seeded_backend() -> std::sync::Arc<InMemoryBackend> {
        let backend = InMemoryBackend::open();
        tables::create_all(backend.as_ref()).unwrap();
        let mut batch = backend.begin_write().unwrap();
        batch.put(tables::STATE, vec![0x01], vec![1]).unwrap();
        batch.put(tables::STATE, vec![0x03], vec![3]).unwrap();
        batch.put(tables::STATE, vec![0x05], vec![5]).unwrap();
        batch.commit().unwrap();
        backend
    }

    fn collect(view: &dyn StorageReadView) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut cursor = view.cursor(tables::STATE).unwrap();
        let mut out = Vec::new();
        let mut entry = cursor.seek(&[]).unwrap();
        while let Some(kv) = entry {
            out.push(kv);
            entry = cursor.next().unwrap();
        }
        out
    }

    #[test]
    fn overlay_shadows_and_inserts() {
        let backend = seeded_backend();
        let mut overlay = Overlay::new();
        overlay.put(tables::STATE, vec![0x02], vec![2]);
        overlay.put(tables::STATE, vec![0x03], vec![0x33]);

        let base = backend.begin_read().unwrap();
        let view = OverlayView::new(base.as_ref(), &overlay);
        assert_eq!(
            collect(&view),
            vec![
                (vec![0x01], vec![1]),
                (vec![0x02], vec![2]),
                (vec![0x03], vec![0x33]),
                (vec![0x05], vec![5]),
            ]
        );
        assert_eq!(view.get(tables::STATE, &[0x03]).unwrap(), Some(vec![0x33]));
    }

    #[test]
    fn tombstones_hide_base_rows() {
        let backend = seeded_backend();
        let mut overlay = Overlay::new();
        overlay.delete(tables::STATE, vec![0x03]);

        let base = backend.begin_read().unwrap();
        let view = OverlayView::new(base.as_ref(), &overlay);
        assert_eq!(
            collect(&view),
            vec![(vec![0x01], vec![1]), (vec![0x05], vec![5])]
        );
        assert_eq!(view.get(tables::STATE, &[0x03]).unwrap(), None);
    }

    #[test]
    fn deleted_prefixes_hide_ranges() {
        let backend = InMemoryBackend::open();
        tables::create_all(backend.as_ref()).unwrap();
        let mut batch = backend.begin_write().unwrap();
        batch.put(tables::STATE, vec![0xaa, 0x01], vec![1]).unwrap();
        batch.put(tables::STATE, vec![0xaa, 0x02], vec![2]).unwrap();
        batch.put(tables::STATE, vec![0xbb, 0x01], vec![3]).unwrap();
        batch.commit().unwrap();

        let mut overlay = Overlay::new();
        overlay.delete_prefix(tables::STATE, vec![0xaa]);
        overlay.put(tables::STATE, vec![0xaa, 0x05], vec![9]);

        let base = backend.begin_read().unwrap();
        let view = OverlayView::new(base.as_ref(), &overlay);
        assert_eq!(
            collect(&view),
            vec![(vec![0xaa, 0x05], vec![9]), (vec![0xbb, 0x01], vec![3])]
        );
        assert_eq!(view.get(tables::STATE, &[0xaa, 0x01]).unwrap(), None);
        assert_eq!(
            view.get(tables::STATE, &[0xaa, 0x05]).unwrap(),
            Some(vec![9])
        );
    }

    #[test]
    fn seek_merges_both_sides() {
        let backend = seeded_backend();
        let mut overlay = Overlay::new();
        overlay.put(tables::STATE, vec![0x04], vec![4]);

        let base = backend.begin_read().unwrap();
        let view = OverlayView::new(base.as_ref(), &overlay);
        let mut cursor = view.cursor(tables::STATE).unwrap();
        assert_eq!(cursor.seek(&[0x04]).unwrap(), Some((vec![0x04], vec![4])));
        assert_eq!(cursor.next().unwrap(), Some((vec![0x05], vec![5])));
        assert_eq!(cursor.next().unwrap(), None);
    }
}
