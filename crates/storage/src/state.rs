//! Block-level orchestration: change buffering, root recomputation through
//! the scan pipeline, flushing and unwind.

use std::mem;
use std::sync::{Arc, Mutex};

use ethereum_types::{Address, H256};
use rustc_hash::{FxHashMap, FxHashSet};
use strata_common::{Account, CancelToken, EMPTY_TRIE_HASH, MAX_INCARNATION};
use strata_crypto::keccak_hash;
use strata_trie::{RetainList, TrieError};
use tracing::{debug, info};

use crate::api::{StorageBackend, StorageReadView};
use crate::error::StoreError;
use crate::keys::{history_key, split_history_key, storage_prefix, StorageKey};
use crate::layering::{Overlay, OverlayView};
use crate::sub_trie_loader::{LoadStats, SubTrieLoader};
use crate::tables;

/// Deepest account-trie branch prefix (in nibbles) republished to the
/// intermediate-hash cache after a root computation.
const IH_COLLECT_DEPTH: usize = 8;

/// Updates, deletes and reads registered within one change period — a
/// transaction within a block, or a block within a group of blocks.
#[derive(Debug, Default, Clone)]
pub struct Buffer {
    /// address hash → new account, or `None` for a deletion
    pub account_updates: FxHashMap<H256, Option<Account>>,
    /// address → (storage key hash → value bytes, empty = delete)
    pub storage_updates: FxHashMap<Address, FxHashMap<H256, Vec<u8>>>,
    pub account_reads: FxHashSet<H256>,
    pub storage_reads: FxHashMap<Address, FxHashSet<H256>>,
    /// addresses whose whole storage was cleared this period
    pub deleted: FxHashSet<Address>,
}

impl Buffer {
    pub fn is_empty(&self) -> bool {
        self.account_updates.is_empty()
            && self.storage_updates.is_empty()
            && self.account_reads.is_empty()
            && self.storage_reads.is_empty()
            && self.deleted.is_empty()
    }

    /// Merges the content of another buffer into this one.
    pub fn merge(&mut self, other: &Buffer) {
        for (address, slots) in &other.storage_updates {
            let entry = self.storage_updates.entry(*address).or_default();
            for (key_hash, value) in slots {
                entry.insert(*key_hash, value.clone());
            }
        }
        for (address, reads) in &other.storage_reads {
            let entry = self.storage_reads.entry(*address).or_default();
            entry.extend(reads.iter().copied());
        }
        for (addr_hash, account) in &other.account_updates {
            self.account_updates.insert(*addr_hash, account.clone());
        }
        self.account_reads.extend(other.account_reads.iter().copied());
        self.deleted.extend(other.deleted.iter().copied());
    }
}

pub trait StateReader {
    fn read_account_data(&mut self, address: Address) -> Result<Option<Account>, StoreError>;
    fn read_account_storage(
        &mut self,
        address: Address,
        key: H256,
    ) -> Result<Option<Vec<u8>>, StoreError>;
    fn read_account_code(&mut self, code_hash: H256) -> Result<Option<Vec<u8>>, StoreError>;
    fn read_account_code_size(&mut self, code_hash: H256) -> Result<Option<usize>, StoreError>;
}

pub trait StateWriter {
    fn update_account_data(
        &mut self,
        address: Address,
        account: &Account,
    ) -> Result<(), StoreError>;
    fn delete_account(&mut self, address: Address) -> Result<(), StoreError>;
    fn update_account_code(&mut self, code_hash: H256, code: &[u8]) -> Result<(), StoreError>;
    fn write_account_storage(
        &mut self,
        address: Address,
        key: H256,
        value: H256,
    ) -> Result<(), StoreError>;
}

/// Flat-store-first state front-end.
///
/// Writes land in per-transaction [`Buffer`]s; root recomputation applies
/// them to an in-memory overlay of the flat table and re-hashes the touched
/// sub-tries through the scan pipeline. The trie is never mutated through
/// node pointers.
pub struct TrieDbState {
    backend: Arc<dyn StorageBackend>,
    block_number: u64,
    last_root: H256,
    buffers: Vec<Buffer>,
    aggregate_buffer: Buffer,
    merged_buffers: usize,
    overlay: Overlay,
    /// pre-image values captured at first touch, keyed by (history table,
    /// state key)
    pending_history: FxHashMap<(&'static str, Vec<u8>), Vec<u8>>,
    pending_preimages: FxHashMap<H256, Vec<u8>>,
    pending_code: FxHashMap<H256, Vec<u8>>,
    /// address hash → (storage root, witness length) captured by the last
    /// scan
    storage_roots: FxHashMap<H256, (H256, u64)>,
    /// rebuilt account-trie branch hashes for the intermediate-hash cache
    collected_ih: Vec<(Vec<u8>, H256, u64)>,
    touched_accounts: FxHashSet<H256>,
    /// accounts whose storage rows changed in this window
    storage_touched: FxHashSet<H256>,
    /// incarnations of accounts deleted in this window
    gone_incarnations: FxHashMap<H256, u64>,
    code_cache: Mutex<FxHashMap<H256, Arc<Vec<u8>>>>,
    loader_stats: LoadStats,
    resolve_reads: bool,
    no_history: bool,
    cancel: CancelToken,
}

impl TrieDbState {
    pub fn new(backend: Arc<dyn StorageBackend>, root: H256, block_number: u64) -> Self {
        Self {
            backend,
            block_number,
            last_root: root,
            buffers: Vec::new(),
            aggregate_buffer: Buffer::default(),
            merged_buffers: 0,
            overlay: Overlay::new(),
            pending_history: FxHashMap::default(),
            pending_preimages: FxHashMap::default(),
            pending_code: FxHashMap::default(),
            storage_roots: FxHashMap::default(),
            collected_ih: Vec::new(),
            touched_accounts: FxHashSet::default(),
            storage_touched: FxHashSet::default(),
            gone_incarnations: FxHashMap::default(),
            code_cache: Mutex::new(FxHashMap::default()),
            loader_stats: LoadStats::default(),
            resolve_reads: false,
            no_history: false,
            cancel: CancelToken::new(),
        }
    }

    pub fn set_resolve_reads(&mut self, resolve: bool) {
        self.resolve_reads = resolve;
    }

    pub fn set_no_history(&mut self, no_history: bool) {
        self.no_history = no_history;
    }

    pub fn set_block_number(&mut self, block_number: u64) {
        self.block_number = block_number;
    }

    pub fn block_number(&self) -> u64 {
        self.block_number
    }

    pub fn last_root(&self) -> H256 {
        self.last_root
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Cursor-motion counters of the most recent scan.
    pub fn loader_stats(&self) -> LoadStats {
        self.loader_stats
    }

    pub fn trie_state_writer(&mut self) -> TrieStateWriter<'_> {
        TrieStateWriter { tds: self }
    }

    pub fn db_state_writer(&mut self) -> DbStateWriter<'_> {
        DbStateWriter { tds: self }
    }

    /// Seals the current buffer and opens a fresh one.
    pub fn start_new_buffer(&mut self) {
        self.merge_pending();
        self.buffers.push(Buffer::default());
    }

    fn current_buffer(&mut self) -> &mut Buffer {
        if self.buffers.is_empty() {
            self.buffers.push(Buffer::default());
        }
        self.buffers.last_mut().expect("pushed above")
    }

    fn merge_pending(&mut self) {
        while self.merged_buffers < self.buffers.len() {
            let buffer = self.buffers[self.merged_buffers].clone();
            self.aggregate_buffer.merge(&buffer);
            self.merged_buffers += 1;
        }
    }

    pub fn hash_address(&mut self, address: Address, save: bool) -> H256 {
        let hash = H256(keccak_hash(address.as_bytes()));
        if save {
            self.pending_preimages
                .insert(hash, address.as_bytes().to_vec());
        }
        hash
    }

    pub fn hash_key(&mut self, key: H256, save: bool) -> H256 {
        let hash = H256(keccak_hash(key.as_bytes()));
        if save {
            self.pending_preimages.insert(hash, key.as_bytes().to_vec());
        }
        hash
    }

    /// Resolves the original bytes of a hashed key, if they were saved.
    pub fn preimage(&self, hash: H256) -> Result<Option<Vec<u8>>, StoreError> {
        if let Some(bytes) = self.pending_preimages.get(&hash) {
            return Ok(Some(bytes.clone()));
        }
        let view = self.backend.begin_read()?;
        view.get(tables::PREIMAGE, hash.as_bytes())
    }

    /// The incarnation a recreated contract at `address` must use.
    pub fn next_incarnation(&mut self, address: Address) -> Result<u64, StoreError> {
        let addr_hash = self.hash_address(address, false);
        if let Some(gone) = self.gone_incarnations.get(&addr_hash) {
            return checked_incarnation(gone + 1);
        }
        match self.read_account_record(addr_hash)? {
            Some(account) => checked_incarnation(account.incarnation + 1),
            None => Ok(strata_common::INITIAL_INCARNATION),
        }
    }

    fn read_account_record(&self, addr_hash: H256) -> Result<Option<Account>, StoreError> {
        let view = self.backend.begin_read()?;
        let overlay_view = OverlayView::new(view.as_ref(), &self.overlay);
        let Some(raw) = overlay_view.get(tables::STATE, addr_hash.as_bytes())? else {
            return Ok(None);
        };
        let account = Account::decode_for_storage(&raw).map_err(|source| StoreError::Decode {
            key: format!("{addr_hash:#x}"),
            source,
        })?;
        Ok(Some(account))
    }

    fn incarnation_for_updates(&self, addr_hash: H256) -> Result<u64, StoreError> {
        // a pending account update knows best, then the overlaid row
        for buffer in self.buffers.iter().rev() {
            if let Some(update) = buffer.account_updates.get(&addr_hash) {
                if let Some(account) = update {
                    return Ok(account.incarnation);
                }
                break;
            }
        }
        match self.read_account_record(addr_hash)? {
            Some(account) => Ok(account.incarnation),
            None => Ok(strata_common::INITIAL_INCARNATION),
        }
    }

    /// Builds the retention set covering every touched nibble path; deleted
    /// accounts retain their entire sub-trie.
    fn build_retain_list(&mut self) -> RetainList {
        let mut list = RetainList::new();
        let mut touched = FxHashSet::default();
        for addr_hash in self.aggregate_buffer.account_updates.keys() {
            list.add_hex(unpack(addr_hash.as_bytes()));
            touched.insert(*addr_hash);
        }
        for addr_hash in &self.aggregate_buffer.account_reads {
            list.add_hex(unpack(addr_hash.as_bytes()));
            touched.insert(*addr_hash);
        }
        let storage_paths = |address: &Address, key_hashes: &mut dyn Iterator<Item = H256>| {
            let addr_hash = H256(keccak_hash(address.as_bytes()));
            let mut paths = Vec::new();
            for key_hash in key_hashes {
                let mut hex = unpack(addr_hash.as_bytes());
                hex.extend(unpack(key_hash.as_bytes()));
                paths.push(hex);
            }
            (addr_hash, paths)
        };
        for (address, slots) in &self.aggregate_buffer.storage_updates {
            let (addr_hash, paths) = storage_paths(address, &mut slots.keys().copied());
            touched.insert(addr_hash);
            self.storage_touched.insert(addr_hash);
            for path in paths {
                list.add_hex(path);
            }
        }
        for (address, reads) in &self.aggregate_buffer.storage_reads {
            let (addr_hash, paths) = storage_paths(address, &mut reads.iter().copied());
            touched.insert(addr_hash);
            for path in paths {
                list.add_hex(path);
            }
        }
        for address in &self.aggregate_buffer.deleted {
            let addr_hash = H256(keccak_hash(address.as_bytes()));
            touched.insert(addr_hash);
            list.add_subtree(unpack(addr_hash.as_bytes()));
        }
        list.sort();
        self.touched_accounts.extend(touched);
        list
    }

    /// Captures the pre-block value of a state key, once per window.
    fn record_history(
        &mut self,
        table: &'static str,
        key: Vec<u8>,
        base: &dyn StorageReadView,
    ) -> Result<(), StoreError> {
        if self.no_history {
            return Ok(());
        }
        let entry = (table, key);
        if self.pending_history.contains_key(&entry) {
            return Ok(());
        }
        let original = base.get(tables::STATE, &entry.1)?.unwrap_or_default();
        self.pending_history.insert(entry, original);
        Ok(())
    }

    /// Applies one buffer to the overlay, recording history pre-images.
    fn apply_buffer(&mut self, buffer: &Buffer) -> Result<(), StoreError> {
        let backend = self.backend.clone();
        let base = backend.begin_read()?;

        // deletions wipe the account row and its whole storage range
        let deleted: Vec<Address> = buffer.deleted.iter().copied().collect();
        for address in deleted {
            let addr_hash = H256(keccak_hash(address.as_bytes()));
            self.record_history(
                tables::ACCOUNT_HISTORY,
                addr_hash.as_bytes().to_vec(),
                base.as_ref(),
            )?;
            if let Some(account) = self.read_account_record(addr_hash)? {
                self.gone_incarnations.insert(addr_hash, account.incarnation);
            }
            // capture each doomed storage row before hiding the range
            let doomed: Vec<Vec<u8>> = {
                let overlay_view = OverlayView::new(base.as_ref(), &self.overlay);
                let mut cursor = overlay_view.cursor(tables::STATE)?;
                let mut keys = Vec::new();
                let mut entry = cursor.seek(addr_hash.as_bytes())?;
                while let Some((key, _)) = entry {
                    if !key.starts_with(addr_hash.as_bytes()) {
                        break;
                    }
                    if key.len() > 32 {
                        keys.push(key);
                    }
                    entry = cursor.next()?;
                }
                keys
            };
            for key in doomed {
                self.record_history(tables::STORAGE_HISTORY, key, base.as_ref())?;
            }
            self.overlay
                .delete_prefix(tables::STATE, addr_hash.as_bytes().to_vec());
        }

        let mut account_updates: Vec<(H256, Option<Account>)> = buffer
            .account_updates
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect();
        account_updates.sort_by_key(|(k, _)| *k);
        for (addr_hash, update) in account_updates {
            self.record_history(
                tables::ACCOUNT_HISTORY,
                addr_hash.as_bytes().to_vec(),
                base.as_ref(),
            )?;
            match update {
                Some(mut account) => {
                    if account.incarnation > MAX_INCARNATION {
                        return Err(StoreError::InvalidIncarnation(account.incarnation));
                    }
                    // the engine owns the storage root; it is patched from
                    // the scan results before the flush
                    account.storage_root = *EMPTY_TRIE_HASH;
                    self.overlay.put(
                        tables::STATE,
                        addr_hash.as_bytes().to_vec(),
                        account.encode_for_storage_to_vec(),
                    );
                }
                None => {
                    self.overlay
                        .delete(tables::STATE, addr_hash.as_bytes().to_vec());
                }
            }
        }

        let mut storage_updates: Vec<(Address, Vec<(H256, Vec<u8>)>)> = buffer
            .storage_updates
            .iter()
            .map(|(address, slots)| {
                let mut slots: Vec<(H256, Vec<u8>)> =
                    slots.iter().map(|(k, v)| (*k, v.clone())).collect();
                slots.sort_by_key(|(k, _)| *k);
                (*address, slots)
            })
            .collect();
        storage_updates.sort_by_key(|(address, _)| *address);
        for (address, slots) in storage_updates {
            if buffer.deleted.contains(&address) {
                // storage of a deleted account is gone regardless of the
                // writes staged before the deletion
                continue;
            }
            let addr_hash = H256(keccak_hash(address.as_bytes()));
            let incarnation = self.incarnation_for_updates(addr_hash)?;
            for (key_hash, value) in slots {
                let row_key = StorageKey::new(addr_hash, incarnation, key_hash);
                self.record_history(
                    tables::STORAGE_HISTORY,
                    row_key.as_ref().to_vec(),
                    base.as_ref(),
                )?;
                if value.is_empty() {
                    self.overlay.delete(tables::STATE, row_key.as_ref().to_vec());
                } else {
                    self.overlay
                        .put(tables::STATE, row_key.as_ref().to_vec(), value);
                }
            }
        }
        Ok(())
    }

    /// One full-range scan against "store ⊕ overlay".
    fn scan_root(&mut self, retain: &RetainList) -> Result<H256, StoreError> {
        let backend = self.backend.clone();
        let view = backend.begin_read()?;
        let overlay_view = OverlayView::new(view.as_ref(), &self.overlay);
        let mut loader = SubTrieLoader::new();

        let mut collected: Vec<(Vec<u8>, H256, u64)> = Vec::new();
        let mut collector = |prefix: &[u8], hash: H256, witness_len: u64| -> Result<(), TrieError> {
            // the cache is keyed by packed bytes, so only byte-aligned
            // account-trie prefixes are published
            if !prefix.is_empty() && prefix.len() <= IH_COLLECT_DEPTH && prefix.len() % 2 == 0 {
                collected.push((pack(prefix), hash, witness_len));
            }
            Ok(())
        };

        let sub_tries = loader.load_sub_tries(
            &overlay_view,
            retain,
            &[Vec::new()],
            &[0],
            &self.cancel,
            Some(&mut collector),
        )?;
        self.loader_stats = loader.stats();

        // every scan covers the full range, so the last scan's capture is
        // authoritative; an account whose storage emptied out simply drops
        // off the map
        self.storage_roots = sub_tries.storage_roots;
        self.collected_ih = collected;
        sub_tries
            .hashes
            .first()
            .copied()
            .ok_or_else(|| StoreError::Custom("scan produced no root".into()))
    }

    /// Applies each buffer in order and recomputes the root after each one.
    /// The returned hashes are what a consumer stores in `post_state` for
    /// pre-Byzantium receipts.
    pub fn compute_trie_roots(&mut self) -> Result<Vec<H256>, StoreError> {
        self.merge_pending();
        if self.buffers.is_empty() {
            return Ok(Vec::new());
        }
        let retain = self.build_retain_list();
        debug!(
            buffers = self.buffers.len(),
            touched = self.touched_accounts.len(),
            "computing trie roots"
        );

        let buffers = mem::take(&mut self.buffers);
        let mut roots = Vec::with_capacity(buffers.len());
        for buffer in &buffers {
            if let Err(err) = self.apply_buffer(buffer) {
                self.discard();
                return Err(err);
            }
            match self.scan_root(&retain) {
                Ok(root) => roots.push(root),
                Err(err) => {
                    // cancellation and failures discard both the staged
                    // writes and the partially built stacks
                    self.discard();
                    return Err(err);
                }
            }
        }
        self.buffers = buffers;
        if let Some(root) = roots.last() {
            self.last_root = *root;
        }
        Ok(roots)
    }

    /// Computes the current root without applying any updates and checks it
    /// against the caller's expectation.
    pub fn verify_root(&mut self, expected: H256) -> Result<(), StoreError> {
        let retain = RetainList::new();
        let computed = self.scan_root(&retain)?;
        if computed != expected {
            return Err(StoreError::HashMismatch { expected, computed });
        }
        Ok(())
    }

    /// Patches the freshly computed storage roots into the overlaid account
    /// rows and returns the staged intermediate-hash rewrites for them.
    fn patch_storage_roots(&mut self) -> Result<Vec<(Vec<u8>, H256, u64)>, StoreError> {
        let mut staged = Vec::new();
        let storage_roots = mem::take(&mut self.storage_roots);
        for (addr_hash, (root, witness_len)) in &storage_roots {
            let Some(mut account) = self.read_account_record(*addr_hash)? else {
                continue;
            };
            if account.storage_root != *root {
                account.storage_root = *root;
                self.overlay.put(
                    tables::STATE,
                    addr_hash.as_bytes().to_vec(),
                    account.encode_for_storage_to_vec(),
                );
            }
            if *root != *EMPTY_TRIE_HASH {
                let prefix = storage_prefix(*addr_hash, account.incarnation);
                staged.push((prefix.to_vec(), *root, *witness_len));
            }
        }
        // storage that emptied out leaves no capture behind; the row must
        // fall back to the empty root
        let storage_touched = mem::take(&mut self.storage_touched);
        for addr_hash in &storage_touched {
            if storage_roots.contains_key(addr_hash) {
                continue;
            }
            let Some(mut account) = self.read_account_record(*addr_hash)? else {
                continue;
            };
            if account.storage_root != *EMPTY_TRIE_HASH {
                account.storage_root = *EMPTY_TRIE_HASH;
                self.overlay.put(
                    tables::STATE,
                    addr_hash.as_bytes().to_vec(),
                    account.encode_for_storage_to_vec(),
                );
            }
        }
        self.storage_touched = storage_touched;
        self.storage_roots = storage_roots;
        Ok(staged)
    }

    /// Flushes the window: state rows, history pre-images, preimages, code,
    /// and the intermediate-hash invalidation plus rewrite. One write
    /// transaction spans the whole flush.
    pub fn commit_block(&mut self, block_number: u64) -> Result<(), StoreError> {
        let staged_storage_ih = self.patch_storage_roots()?;
        let backend = self.backend.clone();
        let mut batch = backend.begin_write()?;

        // invalidate every cached sub-trie containing a touched path
        for addr_hash in &self.touched_accounts {
            let key = addr_hash.as_bytes();
            for len in 1..key.len() {
                batch.delete(tables::INTERMEDIATE_HASH, &key[..len])?;
                batch.delete(tables::INTERMEDIATE_WITNESS_LEN, &key[..len])?;
            }
            batch.delete_prefix(tables::INTERMEDIATE_HASH, key)?;
            batch.delete_prefix(tables::INTERMEDIATE_WITNESS_LEN, key)?;
        }
        // republish the rebuilt roots
        for (key, hash, witness_len) in self
            .collected_ih
            .drain(..)
            .chain(staged_storage_ih.into_iter())
        {
            batch.put(tables::INTERMEDIATE_HASH, key.clone(), hash.as_bytes().to_vec())?;
            batch.put(
                tables::INTERMEDIATE_WITNESS_LEN,
                key,
                witness_len.to_be_bytes().to_vec(),
            )?;
        }

        if !self.no_history {
            for ((table, key), value) in self.pending_history.drain() {
                batch.put(table, history_key(&key, block_number), value)?;
            }
        } else {
            self.pending_history.clear();
        }
        for (hash, preimage) in self.pending_preimages.drain() {
            batch.put(tables::PREIMAGE, hash.as_bytes().to_vec(), preimage)?;
        }
        for (code_hash, code) in self.pending_code.drain() {
            batch.put(tables::CODE, code_hash.as_bytes().to_vec(), code)?;
        }

        self.overlay.flush_into(batch.as_mut())?;
        batch.commit()?;

        info!(block_number, root = ?self.last_root, "state window committed");
        self.block_number = block_number;
        self.clear_window();
        Ok(())
    }

    fn clear_window(&mut self) {
        self.buffers.clear();
        self.aggregate_buffer = Buffer::default();
        self.merged_buffers = 0;
        self.overlay.clear();
        self.pending_history.clear();
        self.storage_roots.clear();
        self.collected_ih.clear();
        self.touched_accounts.clear();
        self.storage_touched.clear();
        self.gone_incarnations.clear();
    }

    /// Drops all staged work without flushing anything.
    pub fn discard(&mut self) {
        self.clear_window();
        self.pending_preimages.clear();
        self.pending_code.clear();
    }

    /// Replays history records back to `target_block`, restoring the flat
    /// table, recomputing the root and dropping the unwound history.
    pub fn unwind_to(&mut self, target_block: u64) -> Result<H256, StoreError> {
        info!(from = self.block_number, to = target_block, "unwinding state");
        if !self.buffers.is_empty() || self.merged_buffers > 0 {
            return Err(StoreError::Custom(
                "cannot unwind with uncommitted buffers".into(),
            ));
        }
        let backend = self.backend.clone();

        // For every key changed after the target, the entry with the lowest
        // block number above it is the value the key had at the target.
        let mut restores: FxHashMap<(&'static str, Vec<u8>), (u64, Vec<u8>)> = FxHashMap::default();
        let mut doomed_history: Vec<(&'static str, Vec<u8>)> = Vec::new();
        {
            let view = backend.begin_read()?;
            for table in [tables::ACCOUNT_HISTORY, tables::STORAGE_HISTORY] {
                let mut cursor = view.cursor(table)?;
                let mut entry = cursor.seek(&[])?;
                while let Some((key, value)) = entry {
                    let (state_key, block) = split_history_key(&key).ok_or_else(|| {
                        StoreError::Custom(format!("malformed history key in {table}"))
                    })?;
                    if block > target_block {
                        doomed_history.push((table, key.clone()));
                        let slot = restores
                            .entry((table, state_key.to_vec()))
                            .or_insert((block, value.clone()));
                        if block < slot.0 {
                            *slot = (block, value);
                        }
                    }
                    entry = cursor.next()?;
                }
            }
        }

        let mut retain = RetainList::new();
        for ((table, state_key), (_, value)) in &restores {
            if *table == tables::ACCOUNT_HISTORY {
                retain.add_hex(unpack(state_key));
                self.touched_accounts
                    .insert(H256::from_slice(state_key));
            } else {
                let mut hex = unpack(&state_key[..32]);
                hex.extend(unpack(&state_key[40..]));
                retain.add_hex(hex);
                let addr_hash = H256::from_slice(&state_key[..32]);
                self.touched_accounts.insert(addr_hash);
                self.storage_touched.insert(addr_hash);
            }
            if value.is_empty() {
                self.overlay.delete(tables::STATE, state_key.clone());
            } else {
                self.overlay
                    .put(tables::STATE, state_key.clone(), value.clone());
            }
        }
        retain.sort();

        let root = match self.scan_root(&retain) {
            Ok(root) => root,
            Err(err) => {
                self.discard();
                return Err(err);
            }
        };

        let staged_storage_ih = self.patch_storage_roots()?;
        let mut batch = backend.begin_write()?;
        for addr_hash in &self.touched_accounts {
            let key = addr_hash.as_bytes();
            for len in 1..key.len() {
                batch.delete(tables::INTERMEDIATE_HASH, &key[..len])?;
                batch.delete(tables::INTERMEDIATE_WITNESS_LEN, &key[..len])?;
            }
            batch.delete_prefix(tables::INTERMEDIATE_HASH, key)?;
            batch.delete_prefix(tables::INTERMEDIATE_WITNESS_LEN, key)?;
        }
        for (key, hash, witness_len) in self
            .collected_ih
            .drain(..)
            .chain(staged_storage_ih.into_iter())
        {
            batch.put(tables::INTERMEDIATE_HASH, key.clone(), hash.as_bytes().to_vec())?;
            batch.put(
                tables::INTERMEDIATE_WITNESS_LEN,
                key,
                witness_len.to_be_bytes().to_vec(),
            )?;
        }
        for (table, key) in doomed_history {
            batch.delete(table, &key)?;
        }
        self.overlay.flush_into(batch.as_mut())?;
        batch.commit()?;

        self.block_number = target_block;
        self.last_root = root;
        self.clear_window();
        Ok(root)
    }

    /// Writes an intermediate hash (and its witness length) directly, for
    /// callers that warm the cache out of band.
    pub fn put_intermediate_hash(
        &mut self,
        prefix: &[u8],
        hash: H256,
        witness_len: u64,
    ) -> Result<(), StoreError> {
        let mut batch = self.backend.begin_write()?;
        batch.put(
            tables::INTERMEDIATE_HASH,
            prefix.to_vec(),
            hash.as_bytes().to_vec(),
        )?;
        batch.put(
            tables::INTERMEDIATE_WITNESS_LEN,
            prefix.to_vec(),
            witness_len.to_be_bytes().to_vec(),
        )?;
        batch.commit()
    }
}

impl StateReader for TrieDbState {
    fn read_account_data(&mut self, address: Address) -> Result<Option<Account>, StoreError> {
        let addr_hash = self.hash_address(address, false);
        if self.resolve_reads {
            let already_written = self
                .buffers
                .last()
                .is_some_and(|b| b.account_updates.contains_key(&addr_hash));
            if !already_written {
                self.current_buffer().account_reads.insert(addr_hash);
            }
        }
        self.read_account_record(addr_hash)
    }

    fn read_account_storage(
        &mut self,
        address: Address,
        key: H256,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let addr_hash = self.hash_address(address, false);
        let seckey = self.hash_key(key, false);
        if self.resolve_reads {
            let already_written = self.buffers.last().is_some_and(|b| {
                b.storage_updates
                    .get(&address)
                    .is_some_and(|slots| slots.contains_key(&seckey))
            });
            if !already_written {
                self.current_buffer()
                    .storage_reads
                    .entry(address)
                    .or_default()
                    .insert(seckey);
            }
        }
        let incarnation = self.incarnation_for_updates(addr_hash)?;
        let row_key = StorageKey::new(addr_hash, incarnation, seckey);
        let view = self.backend.begin_read()?;
        let overlay_view = OverlayView::new(view.as_ref(), &self.overlay);
        overlay_view.get(tables::STATE, row_key.as_ref())
    }

    fn read_account_code(&mut self, code_hash: H256) -> Result<Option<Vec<u8>>, StoreError> {
        if code_hash == *strata_common::EMPTY_CODE_HASH {
            return Ok(None);
        }
        {
            let cache = self.code_cache.lock().map_err(|_| StoreError::LockError)?;
            if let Some(code) = cache.get(&code_hash) {
                return Ok(Some(code.as_ref().clone()));
            }
        }
        if let Some(code) = self.pending_code.get(&code_hash) {
            return Ok(Some(code.clone()));
        }
        let view = self.backend.begin_read()?;
        let code = view.get(tables::CODE, code_hash.as_bytes())?;
        drop(view);
        if let Some(code) = &code {
            // entries are immutable once inserted; only insertion locks
            let mut cache = self.code_cache.lock().map_err(|_| StoreError::LockError)?;
            cache.insert(code_hash, Arc::new(code.clone()));
        }
        Ok(code)
    }

    fn read_account_code_size(&mut self, code_hash: H256) -> Result<Option<usize>, StoreError> {
        Ok(self.read_account_code(code_hash)?.map(|code| code.len()))
    }
}

/// Buffered writer: changes land in the current [`Buffer`] and only reach
/// the store at [`TrieDbState::commit_block`].
pub struct TrieStateWriter<'a> {
    tds: &'a mut TrieDbState,
}

impl StateWriter for TrieStateWriter<'_> {
    fn update_account_data(
        &mut self,
        address: Address,
        account: &Account,
    ) -> Result<(), StoreError> {
        if account.incarnation > MAX_INCARNATION {
            return Err(StoreError::InvalidIncarnation(account.incarnation));
        }
        let addr_hash = self.tds.hash_address(address, false);
        self.tds
            .current_buffer()
            .account_updates
            .insert(addr_hash, Some(account.clone()));
        Ok(())
    }

    fn delete_account(&mut self, address: Address) -> Result<(), StoreError> {
        let addr_hash = self.tds.hash_address(address, false);
        let buffer = self.tds.current_buffer();
        buffer.account_updates.insert(addr_hash, None);
        buffer.deleted.insert(address);
        buffer.storage_updates.remove(&address);
        Ok(())
    }

    fn update_account_code(&mut self, code_hash: H256, code: &[u8]) -> Result<(), StoreError> {
        self.tds.pending_code.insert(code_hash, code.to_vec());
        Ok(())
    }

    fn write_account_storage(
        &mut self,
        address: Address,
        key: H256,
        value: H256,
    ) -> Result<(), StoreError> {
        let seckey = self.tds.hash_key(key, false);
        let trimmed = trim_leading_zeros(value.as_bytes()).to_vec();
        self.tds
            .current_buffer()
            .storage_updates
            .entry(address)
            .or_default()
            .insert(seckey, trimmed);
        Ok(())
    }
}

/// Direct writer: rows and history records go straight to the store, one
/// write transaction per call. Used outside block processing.
pub struct DbStateWriter<'a> {
    tds: &'a mut TrieDbState,
}

impl DbStateWriter<'_> {
    fn write_history(
        &mut self,
        table: &'static str,
        state_key: &[u8],
        original: Vec<u8>,
    ) -> Result<(), StoreError> {
        if self.tds.no_history {
            return Ok(());
        }
        let block = self.tds.block_number;
        let mut batch = self.tds.backend.begin_write()?;
        batch.put(table, history_key(state_key, block), original)?;
        batch.commit()
    }
}

impl StateWriter for DbStateWriter<'_> {
    fn update_account_data(
        &mut self,
        address: Address,
        account: &Account,
    ) -> Result<(), StoreError> {
        if account.incarnation > MAX_INCARNATION {
            return Err(StoreError::InvalidIncarnation(account.incarnation));
        }
        let addr_hash = self.tds.hash_address(address, true);
        let original = {
            let view = self.tds.backend.begin_read()?;
            view.get(tables::STATE, addr_hash.as_bytes())?
        };
        let mut batch = self.tds.backend.begin_write()?;
        batch.put(
            tables::STATE,
            addr_hash.as_bytes().to_vec(),
            account.encode_for_storage_to_vec(),
        )?;
        batch.commit()?;
        self.write_history(
            tables::ACCOUNT_HISTORY,
            addr_hash.as_bytes(),
            original.unwrap_or_default(),
        )
    }

    fn delete_account(&mut self, address: Address) -> Result<(), StoreError> {
        let addr_hash = self.tds.hash_address(address, true);
        let original = {
            let view = self.tds.backend.begin_read()?;
            view.get(tables::STATE, addr_hash.as_bytes())?
        };
        let mut batch = self.tds.backend.begin_write()?;
        batch.delete_prefix(tables::STATE, addr_hash.as_bytes())?;
        batch.commit()?;
        self.write_history(
            tables::ACCOUNT_HISTORY,
            addr_hash.as_bytes(),
            original.unwrap_or_default(),
        )
    }

    fn update_account_code(&mut self, code_hash: H256, code: &[u8]) -> Result<(), StoreError> {
        let mut batch = self.tds.backend.begin_write()?;
        batch.put(tables::CODE, code_hash.as_bytes().to_vec(), code.to_vec())?;
        batch.commit()
    }

    fn write_account_storage(
        &mut self,
        address: Address,
        key: H256,
        value: H256,
    ) -> Result<(), StoreError> {
        let addr_hash = self.tds.hash_address(address, true);
        let seckey = self.tds.hash_key(key, true);
        let incarnation = self.tds.incarnation_for_updates(addr_hash)?;
        let row_key = StorageKey::new(addr_hash, incarnation, seckey);
        let original = {
            let view = self.tds.backend.begin_read()?;
            view.get(tables::STATE, row_key.as_ref())?
        };
        let trimmed = trim_leading_zeros(value.as_bytes());
        let mut batch = self.tds.backend.begin_write()?;
        if trimmed.is_empty() {
            batch.delete(tables::STATE, row_key.as_ref())?;
        } else {
            batch.put(tables::STATE, row_key.as_ref().to_vec(), trimmed.to_vec())?;
        }
        batch.commit()?;
        self.write_history(
            tables::STORAGE_HISTORY,
            row_key.as_ref(),
            original.unwrap_or_default(),
        )
    }
}

fn checked_incarnation(incarnation: u64) -> Result<u64, StoreError> {
    if incarnation > MAX_INCARNATION {
        return Err(StoreError::InvalidIncarnation(incarnation));
    }
    Ok(incarnation)
}

fn trim_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}

fn unpack(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push(b >> 4);
        out.push(b & 0x0f);
    }
    out
}

fn pack(nibbles: &[u8]) -> Vec<u8> {
    debug_assert!(nibbles.len() % 2 == 0);
    nibbles
        .chunks_exact(2)
        .map(|pair| (pair[0] << 4) | pair[1])
        .collect()
}
