//! Dual-cursor scan over the flat state table and the intermediate-hash
//! cache, producing the ordered item stream that drives structure generation
//! and hashing.

use ethereum_types::H256;
use rustc_hash::FxHashMap;
use strata_common::{Account, CancelToken, EMPTY_TRIE_HASH};
use strata_trie::{
    bytes_mask, gen_struct_step, key_is_before, next_account, next_subtree, AccountFieldSet,
    AccountStepData, HashBuilder, HashCollector, Nibbles, NodeArena, NodeId, RetainDecider,
    RlpSerializableBytes, StepData, TrieError,
};
use tracing::{error, trace};

use crate::api::{StorageCursor, StorageReadView};
use crate::error::StoreError;
use crate::keys::{encode_incarnation, ACCOUNT_KEY_LENGTH, STORAGE_PREFIX_LENGTH};
use crate::tables;

/// Nibble length of an account path; also the depth at which an account's
/// storage sub-trie begins.
const ACCOUNT_NIBBLES: usize = 2 * ACCOUNT_KEY_LENGTH;

/// One element of the loader's output stream, in ascending order of the
/// merged (incarnation-less) nibble key space.
#[derive(Debug, Clone)]
pub enum StreamItem {
    Storage {
        key_part1: Vec<u8>,
        key_part2: Vec<u8>,
        value: Vec<u8>,
    },
    StorageHash {
        key_part1: Vec<u8>,
        key_part2: Vec<u8>,
        hash: H256,
        witness_len: u64,
    },
    Account {
        key: Vec<u8>,
        account: Account,
    },
    AccountHash {
        key: Vec<u8>,
        hash: H256,
        witness_len: u64,
    },
    /// Terminates the current target range; `depth` is the nibble depth the
    /// range's sub-trie is rooted at.
    Cutoff { depth: usize },
}

/// Result of one load: one root per target range, plus the retained nodes
/// and the storage roots of the accounts whose storage was rebuilt.
#[derive(Debug, Default)]
pub struct SubTries {
    pub hashes: Vec<H256>,
    pub witness_lens: Vec<u64>,
    pub roots: Vec<Option<NodeId>>,
    pub arena: NodeArena,
    /// address hash → (storage root, witness length)
    pub storage_roots: FxHashMap<H256, (H256, u64)>,
}

/// Cursor-motion counters of the last load.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoadStats {
    pub seeks: u64,
    pub nexts: u64,
}

/// Scans the flat state table and the intermediate-hash cache in lock-step,
/// feeding the item stream into a [`DefaultReceiver`].
pub struct SubTrieLoader {
    receiver: DefaultReceiver,
    stats: LoadStats,
}

impl Default for SubTrieLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl SubTrieLoader {
    pub fn new() -> Self {
        Self {
            receiver: DefaultReceiver::new(),
            stats: LoadStats::default(),
        }
    }

    pub fn stats(&self) -> LoadStats {
        self.stats
    }

    /// Loads the sub-tries under `db_prefixes`. `fixed_bits[i]` is how many
    /// leading bits of `db_prefixes[i]` a key must share to stay in range.
    pub fn load_sub_tries(
        &mut self,
        view: &dyn StorageReadView,
        retain: &dyn RetainDecider,
        db_prefixes: &[Vec<u8>],
        fixed_bits: &[usize],
        cancel: &CancelToken,
        mut hash_collector: Option<&mut HashCollector<'_>>,
    ) -> Result<SubTries, StoreError> {
        if db_prefixes.is_empty() {
            return Ok(SubTries::default());
        }
        debug_assert_eq!(db_prefixes.len(), fixed_bits.len());

        let mut fixed_bytes = Vec::with_capacity(fixed_bits.len());
        let mut masks = Vec::with_capacity(fixed_bits.len());
        let mut cutoffs = Vec::with_capacity(fixed_bits.len());
        for bits in fixed_bits {
            let cutoff = if *bits >= 8 * ACCOUNT_KEY_LENGTH + 64 {
                // storage range: drop the incarnation from the nibble depth
                bits / 4 - 16
            } else {
                bits / 4
            };
            cutoffs.push(cutoff);
            let (bytes, mask) = bytes_mask(*bits);
            fixed_bytes.push(bytes);
            masks.push(mask);
        }

        self.receiver.reset();
        let mut walk = Walk {
            view,
            state: view.cursor(tables::STATE)?,
            ih: view.cursor(tables::INTERMEDIATE_HASH)?,
            state_entry: None,
            ih_entry: None,
            db_prefixes,
            fixed_bytes,
            masks,
            cutoffs,
            range_idx: 0,
            account_key_with_inc: [0u8; STORAGE_PREFIX_LENGTH],
            next_account_key: [0u8; ACCOUNT_KEY_LENGTH],
            item: None,
            retain,
            cancel,
            stats: LoadStats::default(),
        };

        let mut first = true;
        loop {
            if let Some(item) = walk.item.take() {
                self.receiver.receive(item, retain, &mut hash_collector)?;
                continue;
            }
            if walk.range_idx >= db_prefixes.len() {
                break;
            }
            walk.step(first)?;
            first = false;
        }
        self.stats = walk.stats;
        Ok(self.receiver.take_result())
    }
}

struct Walk<'v> {
    view: &'v dyn StorageReadView,
    state: Box<dyn StorageCursor + 'v>,
    ih: Box<dyn StorageCursor + 'v>,
    state_entry: Option<(Vec<u8>, Vec<u8>)>,
    ih_entry: Option<(Vec<u8>, Vec<u8>)>,
    db_prefixes: &'v [Vec<u8>],
    fixed_bytes: Vec<usize>,
    masks: Vec<u8>,
    cutoffs: Vec<usize>,
    range_idx: usize,
    /// 40-byte prefix of the account whose storage sub-trie is being built.
    account_key_with_inc: [u8; STORAGE_PREFIX_LENGTH],
    next_account_key: [u8; ACCOUNT_KEY_LENGTH],
    item: Option<StreamItem>,
    retain: &'v dyn RetainDecider,
    cancel: &'v CancelToken,
    stats: LoadStats,
}

impl Walk<'_> {
    fn state_key(&self) -> Option<&[u8]> {
        self.state_entry.as_ref().map(|(k, _)| k.as_slice())
    }

    fn ih_key(&self) -> Option<&[u8]> {
        self.ih_entry.as_ref().map(|(k, _)| k.as_slice())
    }

    fn check_cancelled(&self) -> Result<(), StoreError> {
        if self.cancel.cancelled() {
            return Err(StoreError::Cancelled);
        }
        Ok(())
    }

    fn seek_state(&mut self, key: &[u8]) -> Result<(), StoreError> {
        self.check_cancelled()?;
        self.stats.seeks += 1;
        self.state_entry = self.state.seek(key)?;
        Ok(())
    }

    fn advance_state(&mut self) -> Result<(), StoreError> {
        self.check_cancelled()?;
        self.stats.nexts += 1;
        self.state_entry = self.state.next()?;
        Ok(())
    }

    fn seek_ih(&mut self, key: &[u8]) -> Result<(), StoreError> {
        self.check_cancelled()?;
        self.stats.seeks += 1;
        self.ih_entry = self.ih.seek(key)?;
        Ok(())
    }

    fn advance_ih(&mut self) -> Result<(), StoreError> {
        self.check_cancelled()?;
        self.stats.nexts += 1;
        self.ih_entry = self.ih.next()?;
        Ok(())
    }

    /// Jumps the state cursor from a storage row to the next account row.
    fn state_to_next_account(&mut self) -> Result<(), StoreError> {
        let Some(key) = self.state_key() else {
            return Ok(());
        };
        let key = key.to_vec();
        if next_account(&key, &mut self.next_account_key) {
            let target = self.next_account_key;
            self.seek_state(&target)
        } else {
            self.state_entry = None;
            Ok(())
        }
    }

    fn ih_to_next_account(&mut self) -> Result<(), StoreError> {
        let Some(key) = self.ih_key() else {
            return Ok(());
        };
        let key = key.to_vec();
        if next_account(&key, &mut self.next_account_key) {
            let target = self.next_account_key;
            self.seek_ih(&target)
        } else {
            self.ih_entry = None;
            Ok(())
        }
    }

    fn arbitrate(&self) -> (bool, Option<Vec<u8>>) {
        let (is_ih, min) = key_is_before(self.ih_key(), self.state_key());
        (is_ih, min.map(<[u8]>::to_vec))
    }

    fn emit_cutoff(&mut self) {
        self.item = Some(StreamItem::Cutoff {
            depth: self.cutoffs[self.range_idx],
        });
        self.range_idx += 1;
    }

    /// Moves the walk forward, producing at most one stream item.
    fn step(&mut self, first: bool) -> Result<(), StoreError> {
        self.check_cancelled()?;
        let (mut is_ih, mut min_key) = if first {
            (false, None)
        } else {
            self.arbitrate()
        };
        let db_prefix = self.db_prefixes[self.range_idx].clone();
        let fixed_bytes = self.fixed_bytes[self.range_idx];
        let mask = self.masks[self.range_idx];

        let mut positioned = !first;
        let mut cmp: i32 = -1;
        while cmp != 0 {
            cmp = match &min_key {
                None => {
                    if positioned {
                        1
                    } else {
                        -1
                    }
                }
                Some(min) if fixed_bytes > 0 => compare_masked(min, &db_prefix, fixed_bytes, mask),
                Some(_) => 0,
            };
            if cmp < 0 {
                // enter the target range
                if db_prefix.len() > ACCOUNT_KEY_LENGTH {
                    // the range is a storage sub-trie
                    self.account_key_with_inc
                        .copy_from_slice(&db_prefix[..STORAGE_PREFIX_LENGTH]);
                }
                self.seek_state(&db_prefix)?;
                if db_prefix.len() <= ACCOUNT_KEY_LENGTH
                    && self
                        .state_key()
                        .is_some_and(|k| k.len() > ACCOUNT_KEY_LENGTH)
                {
                    // landed on storage of an absent account
                    self.state_to_next_account()?;
                }
                self.seek_ih(&db_prefix)?;
                if db_prefix.len() <= ACCOUNT_KEY_LENGTH
                    && self.ih_key().is_some_and(|k| k.len() > ACCOUNT_KEY_LENGTH)
                {
                    self.ih_to_next_account()?;
                }
                (is_ih, min_key) = self.arbitrate();
                positioned = true;
                if fixed_bytes == 0 {
                    cmp = 0;
                }
            } else if cmp > 0 {
                // past the range: close it and hand over to the next one
                self.emit_cutoff();
                return Ok(());
            }
        }

        let Some(min_key) = min_key else {
            // both cursors exhausted inside an unbounded range
            self.emit_cutoff();
            return Ok(());
        };

        if !is_ih {
            let (k, v) = self.state_entry.clone().expect("min key came from state");
            if k.len() > ACCOUNT_KEY_LENGTH && !k.starts_with(&self.account_key_with_inc) {
                if k.as_slice() < &self.account_key_with_inc[..] {
                    // skip the irrelevant storage in the middle
                    let target = self.account_key_with_inc;
                    self.seek_state(&target)?;
                } else {
                    self.state_to_next_account()?;
                }
                return Ok(());
            }
            if k.len() > ACCOUNT_KEY_LENGTH {
                self.item = Some(StreamItem::Storage {
                    key_part1: k[..ACCOUNT_KEY_LENGTH].to_vec(),
                    key_part2: storage_key_part2(&k),
                    value: v,
                });
                self.advance_state()?;
            } else {
                if k.len() != ACCOUNT_KEY_LENGTH {
                    return Err(StoreError::Decode {
                        key: hex_key(&k),
                        source: strata_rlp::error::RLPDecodeError::InvalidLength,
                    });
                }
                let account = Account::decode_for_storage(&v).map_err(|source| {
                    error!(key = %hex_key(&k), "malformed account record");
                    StoreError::Decode {
                        key: hex_key(&k),
                        source,
                    }
                })?;
                self.account_key_with_inc[..ACCOUNT_KEY_LENGTH].copy_from_slice(&k);
                self.account_key_with_inc[ACCOUNT_KEY_LENGTH..]
                    .copy_from_slice(&encode_incarnation(account.incarnation));
                self.item = Some(StreamItem::Account {
                    key: k.clone(),
                    account,
                });
                // Stale storage of older incarnations sorts after this
                // prefix, so one seek skips it entirely
                let target = self.account_key_with_inc;
                self.seek_state(&target)?;
                if !self.ih_key().is_some_and(|ih| ih.starts_with(&target)) {
                    self.seek_ih(&target)?;
                }
            }
            return Ok(());
        }

        // intermediate-hash side
        let min_nibbles = Nibbles::from_state_key(&min_key);
        if min_nibbles.len() < self.cutoffs[self.range_idx] {
            // shallower than the range root: descend to children, not to the
            // sibling
            self.advance_ih()?;
            return Ok(());
        }
        let retain = self.retain.retain(&min_nibbles);
        trace!(target: "trie::sub_trie_loader", prefix = ?min_nibbles, retain, "IH candidate");
        if retain {
            // the sub-trie is needed in full; go to children
            self.advance_ih()?;
            return Ok(());
        }

        let (ih_k, ih_v) = self.ih_entry.clone().expect("min key came from IH");
        if ih_k.len() > ACCOUNT_KEY_LENGTH && !ih_k.starts_with(&self.account_key_with_inc) {
            if ih_k.as_slice() < &self.account_key_with_inc[..] {
                let target = self.account_key_with_inc;
                self.seek_ih(&target)?;
            } else {
                self.ih_to_next_account()?;
            }
            return Ok(());
        }

        if ih_v.len() != 32 {
            return Err(StoreError::Decode {
                key: hex_key(&ih_k),
                source: strata_rlp::error::RLPDecodeError::InvalidLength,
            });
        }
        let hash = H256::from_slice(&ih_v);
        let witness_len = self.witness_len(&ih_k)?;
        self.item = Some(if ih_k.len() > ACCOUNT_KEY_LENGTH {
            StreamItem::StorageHash {
                key_part1: ih_k[..ACCOUNT_KEY_LENGTH].to_vec(),
                key_part2: storage_key_part2(&ih_k),
                hash,
                witness_len,
            }
        } else {
            StreamItem::AccountHash {
                key: ih_k.clone(),
                hash,
                witness_len,
            }
        });

        // skip the covered sub-trie on both cursors
        match next_subtree(&ih_k) {
            None => {
                self.state_entry = None;
                self.ih_entry = None;
            }
            Some(next) => {
                if !self.state_key().is_some_and(|k| k.starts_with(&next)) {
                    self.seek_state(&next)?;
                }
                if next.len() <= ACCOUNT_KEY_LENGTH
                    && self
                        .state_key()
                        .is_some_and(|k| k.len() > ACCOUNT_KEY_LENGTH)
                {
                    self.state_to_next_account()?;
                }
                if !self.ih_key().is_some_and(|k| k.starts_with(&next)) {
                    self.seek_ih(&next)?;
                }
                if next.len() <= ACCOUNT_KEY_LENGTH
                    && self.ih_key().is_some_and(|k| k.len() > ACCOUNT_KEY_LENGTH)
                {
                    self.ih_to_next_account()?;
                }
            }
        }
        Ok(())
    }

    fn witness_len(&mut self, prefix: &[u8]) -> Result<u64, StoreError> {
        let value = self
            .view
            .get(tables::INTERMEDIATE_WITNESS_LEN, prefix)?
            .ok_or_else(|| {
                TrieError::InvariantViolation(format!(
                    "intermediate hash at {} has no witness length",
                    hex_key(prefix)
                ))
            })?;
        let bytes: [u8; 8] = value.as_slice().try_into().map_err(|_| {
            TrieError::InvariantViolation(format!(
                "malformed witness length under {}",
                hex_key(prefix)
            ))
        })?;
        Ok(u64::from_be_bytes(bytes))
    }
}

/// Compares a key against a target prefix over the first `fixed_bytes` bytes,
/// masking the last one.
fn compare_masked(min_key: &[u8], db_prefix: &[u8], fixed_bytes: usize, mask: u8) -> i32 {
    if min_key.len() < fixed_bytes {
        let cmp = min_key.cmp(&db_prefix[..min_key.len()]);
        if cmp == std::cmp::Ordering::Equal {
            -1
        } else {
            order_to_i32(cmp)
        }
    } else {
        let cmp = min_key[..fixed_bytes - 1].cmp(&db_prefix[..fixed_bytes - 1]);
        if cmp == std::cmp::Ordering::Equal {
            let k1 = min_key[fixed_bytes - 1] & mask;
            let k2 = db_prefix[fixed_bytes - 1] & mask;
            order_to_i32(k1.cmp(&k2))
        } else {
            order_to_i32(cmp)
        }
    }
}

fn order_to_i32(order: std::cmp::Ordering) -> i32 {
    match order {
        std::cmp::Ordering::Less => -1,
        std::cmp::Ordering::Equal => 0,
        std::cmp::Ordering::Greater => 1,
    }
}

fn storage_key_part2(key: &[u8]) -> Vec<u8> {
    if key.len() >= STORAGE_PREFIX_LENGTH {
        key[STORAGE_PREFIX_LENGTH..].to_vec()
    } else {
        Vec::new()
    }
}

fn hex_key(key: &[u8]) -> String {
    key.iter().map(|b| format!("{b:02x}")).collect()
}

/// Consumes the item stream: advances the account/storage key double
/// buffers, runs structure generation and collects per-range roots.
pub struct DefaultReceiver {
    curr: Vec<u8>,
    succ: Vec<u8>,
    curr_storage: Vec<u8>,
    succ_storage: Vec<u8>,
    value: Vec<u8>,
    value_storage: Vec<u8>,
    groups: Vec<u16>,
    hb: HashBuilder,
    was_ih: bool,
    was_ih_storage: bool,
    account: Account,
    account_key: H256,
    account_field_set: AccountFieldSet,
    witness_len: u64,
    hashes: Vec<H256>,
    witness_lens: Vec<u64>,
    roots: Vec<Option<NodeId>>,
    storage_roots: FxHashMap<H256, (H256, u64)>,
}

impl DefaultReceiver {
    pub fn new() -> Self {
        Self {
            curr: Vec::new(),
            succ: Vec::new(),
            curr_storage: Vec::new(),
            succ_storage: Vec::new(),
            value: Vec::new(),
            value_storage: Vec::new(),
            groups: Vec::new(),
            hb: HashBuilder::new(),
            was_ih: false,
            was_ih_storage: false,
            account: Account::default(),
            account_key: H256::zero(),
            account_field_set: AccountFieldSet::default(),
            witness_len: 0,
            hashes: Vec::new(),
            witness_lens: Vec::new(),
            roots: Vec::new(),
            storage_roots: FxHashMap::default(),
        }
    }

    fn reset(&mut self) {
        self.curr.clear();
        self.succ.clear();
        self.curr_storage.clear();
        self.succ_storage.clear();
        self.value.clear();
        self.value_storage.clear();
        self.groups.clear();
        self.hb.reset();
        self.hb.take_arena();
        self.was_ih = false;
        self.was_ih_storage = false;
        self.account_field_set.clear();
        self.witness_len = 0;
        self.hashes.clear();
        self.witness_lens.clear();
        self.roots.clear();
        self.storage_roots.clear();
    }

    fn take_result(&mut self) -> SubTries {
        SubTries {
            hashes: std::mem::take(&mut self.hashes),
            witness_lens: std::mem::take(&mut self.witness_lens),
            roots: std::mem::take(&mut self.roots),
            arena: self.hb.take_arena(),
            storage_roots: std::mem::take(&mut self.storage_roots),
        }
    }

    fn receive(
        &mut self,
        item: StreamItem,
        retain: &dyn RetainDecider,
        collector: &mut Option<&mut HashCollector<'_>>,
    ) -> Result<(), StoreError> {
        match item {
            StreamItem::Storage {
                key_part1,
                key_part2,
                value,
            } => {
                self.advance_keys_storage(&key_part1, &key_part2, true);
                if !self.curr_storage.is_empty() {
                    self.gen_struct_storage(retain, collector)?;
                }
                self.save_value_storage(false, &value, H256::zero(), 0);
            }
            StreamItem::StorageHash {
                key_part1,
                key_part2,
                hash,
                witness_len,
            } => {
                self.advance_keys_storage(&key_part1, &key_part2, false);
                if !self.curr_storage.is_empty() {
                    self.gen_struct_storage(retain, collector)?;
                }
                self.save_value_storage(true, &[], hash, witness_len);
            }
            StreamItem::Account { key, account } => {
                self.advance_keys_account(&key, true);
                self.close_pending_storage(retain, collector)?;
                if !self.curr.is_empty() {
                    self.gen_struct_account(retain, collector)?;
                }
                self.save_value_account(&key, account)?;
            }
            StreamItem::AccountHash {
                key,
                hash,
                witness_len,
            } => {
                self.advance_keys_account(&key, false);
                self.close_pending_storage(retain, collector)?;
                if !self.curr.is_empty() {
                    self.gen_struct_account(retain, collector)?;
                }
                self.save_value_account_hash(hash, witness_len);
            }
            StreamItem::Cutoff { depth } => self.cutoff(depth, retain, collector)?,
        }
        Ok(())
    }

    /// Finalizes the storage sub-trie of the account that just went out of
    /// scope, leaving its root on the hash stack for the `ACCOUNT_LEAF`.
    fn close_pending_storage(
        &mut self,
        retain: &dyn RetainDecider,
        collector: &mut Option<&mut HashCollector<'_>>,
    ) -> Result<(), StoreError> {
        if self.curr.is_empty() || self.was_ih {
            return Ok(());
        }
        self.cutoff_keys_storage(ACCOUNT_NIBBLES);
        if !self.curr_storage.is_empty() {
            self.gen_struct_storage(retain, collector)?;
        }
        if !self.curr_storage.is_empty() {
            if self.groups.len() >= ACCOUNT_NIBBLES {
                self.groups.truncate(ACCOUNT_NIBBLES - 1);
            }
            while self.groups.last() == Some(&0) {
                self.groups.pop();
            }
            self.curr_storage.clear();
            self.succ_storage.clear();
            self.was_ih_storage = false;
            // the account has storage; remember its freshly built root
            let root = self.hb.root_hash().map_err(StoreError::Trie)?;
            self.storage_roots
                .insert(self.account_key, (root, self.hb.top_witness_len()));
            self.account_field_set.insert(AccountFieldSet::STORAGE);
        }
        Ok(())
    }

    fn cutoff(
        &mut self,
        depth: usize,
        retain: &dyn RetainDecider,
        collector: &mut Option<&mut HashCollector<'_>>,
    ) -> Result<(), StoreError> {
        if depth >= ACCOUNT_NIBBLES {
            // a storage target range ends
            self.cutoff_keys_storage(depth);
            if !self.curr_storage.is_empty() {
                self.gen_struct_storage(retain, collector)?;
            }
            if !self.curr_storage.is_empty() {
                if self.groups.len() >= depth {
                    self.groups.truncate(depth - 1);
                }
                while self.groups.last() == Some(&0) {
                    self.groups.pop();
                }
                self.curr_storage.clear();
                self.succ_storage.clear();
                self.was_ih_storage = false;
                self.roots.push(self.hb.root_node());
                self.hashes.push(self.hb.root_hash().map_err(StoreError::Trie)?);
                self.witness_lens.push(self.hb.top_witness_len());
            } else {
                self.roots.push(None);
                self.hashes.push(*EMPTY_TRIE_HASH);
                self.witness_lens.push(0);
            }
        } else {
            // an account target range ends
            self.cutoff_keys_account(depth);
            self.close_pending_storage(retain, collector)?;
            if !self.curr.is_empty() {
                self.gen_struct_account(retain, collector)?;
                if self.groups.len() > depth {
                    self.groups.truncate(depth);
                }
                while self.groups.last() == Some(&0) {
                    self.groups.pop();
                }
            }
            if self.hb.has_root() {
                self.roots.push(self.hb.root_node());
                self.hashes.push(self.hb.root_hash().map_err(StoreError::Trie)?);
                self.witness_lens.push(self.hb.top_witness_len());
            } else {
                self.roots.push(None);
                self.hashes.push(*EMPTY_TRIE_HASH);
                self.witness_lens.push(0);
            }
            self.groups.clear();
            self.hb.reset();
            self.was_ih = false;
            self.was_ih_storage = false;
            self.curr.clear();
            self.succ.clear();
            self.curr_storage.clear();
            self.succ_storage.clear();
        }
        Ok(())
    }

    fn advance_keys_storage(&mut self, part1: &[u8], part2: &[u8], terminator: bool) {
        self.curr_storage.clear();
        self.curr_storage.extend_from_slice(&self.succ_storage);
        self.succ_storage.clear();
        unpack_nibbles(part1, &mut self.succ_storage);
        unpack_nibbles(part2, &mut self.succ_storage);
        if terminator {
            self.succ_storage.push(16);
        }
    }

    fn cutoff_keys_storage(&mut self, cutoff: usize) {
        self.curr_storage.clear();
        self.curr_storage.extend_from_slice(&self.succ_storage);
        self.succ_storage.clear();
        if !self.curr_storage.is_empty() {
            self.succ_storage
                .extend_from_slice(&self.curr_storage[..cutoff - 1]);
            // bump the last nibble before the cutoff point
            self.succ_storage.push(self.curr_storage[cutoff - 1] + 1);
        }
    }

    fn gen_struct_storage(
        &mut self,
        retain: &dyn RetainDecider,
        collector: &mut Option<&mut HashCollector<'_>>,
    ) -> Result<(), StoreError> {
        let data = if self.was_ih_storage {
            StepData::Hash {
                hash: H256::from_slice(&self.value_storage),
                witness_len: self.witness_len,
            }
        } else {
            StepData::Leaf(RlpSerializableBytes(&self.value_storage))
        };
        let groups = std::mem::take(&mut self.groups);
        self.groups = gen_struct_step(
            &mut |prefix| retain.retain(prefix),
            &self.curr_storage,
            &self.succ_storage,
            &mut self.hb,
            data,
            groups,
            collector.as_deref_mut(),
        )?;
        Ok(())
    }

    fn save_value_storage(&mut self, is_ih: bool, value: &[u8], hash: H256, witness_len: u64) {
        self.was_ih_storage = is_ih;
        self.value_storage.clear();
        if is_ih {
            self.value_storage.extend_from_slice(hash.as_bytes());
            self.witness_len = witness_len;
        } else {
            self.value_storage.extend_from_slice(value);
        }
    }

    fn advance_keys_account(&mut self, key: &[u8], terminator: bool) {
        self.curr.clear();
        self.curr.extend_from_slice(&self.succ);
        self.succ.clear();
        unpack_nibbles(key, &mut self.succ);
        if terminator {
            self.succ.push(16);
        }
    }

    fn cutoff_keys_account(&mut self, cutoff: usize) {
        self.curr.clear();
        self.curr.extend_from_slice(&self.succ);
        self.succ.clear();
        if !self.curr.is_empty() && cutoff > 0 {
            self.succ.extend_from_slice(&self.curr[..cutoff - 1]);
            self.succ.push(self.curr[cutoff - 1] + 1);
        }
    }

    fn gen_struct_account(
        &mut self,
        retain: &dyn RetainDecider,
        collector: &mut Option<&mut HashCollector<'_>>,
    ) -> Result<(), StoreError> {
        let data = if self.was_ih {
            StepData::Hash {
                hash: H256::from_slice(&self.value),
                witness_len: self.witness_len,
            }
        } else {
            let mut field_set = self.account_field_set;
            if !self.account.balance.is_zero() {
                field_set.insert(AccountFieldSet::BALANCE);
            }
            if self.account.nonce != 0 {
                field_set.insert(AccountFieldSet::NONCE);
            }
            StepData::Account(AccountStepData {
                balance: self.account.balance,
                nonce: self.account.nonce,
                incarnation: self.account.incarnation,
                field_set,
            })
        };
        self.was_ih_storage = false;
        self.curr_storage.clear();
        self.succ_storage.clear();
        let groups = std::mem::take(&mut self.groups);
        self.groups = gen_struct_step(
            &mut |prefix| retain.retain(prefix),
            &self.curr,
            &self.succ,
            &mut self.hb,
            data,
            groups,
            collector.as_deref_mut(),
        )?;
        self.account_field_set.clear();
        Ok(())
    }

    fn save_value_account(&mut self, key: &[u8], account: Account) -> Result<(), StoreError> {
        self.was_ih = false;
        self.account_key = H256::from_slice(key);
        self.account = account;
        // the code hash goes onto the stack first; the storage root, if any,
        // will end up on top of it
        if self.account.has_code() {
            self.account_field_set.insert(AccountFieldSet::CODE);
            self.hb
                .hash(self.account.code_hash, 0)
                .map_err(StoreError::Trie)?;
        }
        Ok(())
    }

    fn save_value_account_hash(&mut self, hash: H256, witness_len: u64) {
        self.was_ih = true;
        self.value.clear();
        self.value.extend_from_slice(hash.as_bytes());
        self.witness_len = witness_len;
    }
}

fn unpack_nibbles(bytes: &[u8], out: &mut Vec<u8>) {
    for b in bytes {
        out.push(b >> 4);
        out.push(b & 0x0f);
    }
}
