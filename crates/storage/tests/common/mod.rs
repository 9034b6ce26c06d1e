//! Shared test fixtures: an independent recursive Merkle-Patricia
//! implementation used to cross-check the roots the scan pipeline produces,
//! plus backend helpers.

#![allow(dead_code)]

use std::sync::Arc;

use ethereum_types::{Address, H256};
use strata_common::Account;
use strata_common::EMPTY_TRIE_HASH;
use strata_crypto::keccak_hash;
use strata_rlp::encode::{encode_length, RLPEncode};
use strata_storage::{tables, InMemoryBackend, StorageBackend, StorageReadView};
use strata_trie::Nibbles;

pub fn make_backend() -> Arc<InMemoryBackend> {
    let backend = InMemoryBackend::open();
    tables::create_all(backend.as_ref()).unwrap();
    backend
}

pub fn address(n: u64) -> Address {
    Address::from_low_u64_be(n)
}

pub fn hash_of(bytes: &[u8]) -> H256 {
    H256(keccak_hash(bytes))
}

pub fn unpack(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push(b >> 4);
        out.push(b & 0x0f);
    }
    out
}

fn wrap_list(payload: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::new();
    encode_length(payload.len(), &mut out);
    out.extend_from_slice(&payload);
    out
}

/// The RLP item a node contributes to its parent: embedded below 32 bytes,
/// a hash reference otherwise.
fn node_ref(rlp: Vec<u8>) -> Vec<u8> {
    if rlp.len() < 32 {
        rlp
    } else {
        let mut out = Vec::with_capacity(33);
        out.push(0xa0);
        out.extend_from_slice(&keccak_hash(&rlp));
        out
    }
}

/// Builds the node RLP for `entries` (sorted, equal-length nibble paths with
/// ready-made leaf value items) from `depth` downward.
fn build_node(entries: &[(Vec<u8>, Vec<u8>)], depth: usize) -> Vec<u8> {
    assert!(!entries.is_empty());
    if entries.len() == 1 {
        let (path, value_item) = &entries[0];
        let mut key = path[depth..].to_vec();
        key.push(16);
        let compact = Nibbles::from_hex(key).encode_compact();
        let mut payload = Vec::new();
        compact.as_slice().encode(&mut payload);
        payload.extend_from_slice(value_item);
        return wrap_list(payload);
    }

    let first = &entries[0].0;
    let last = &entries[entries.len() - 1].0;
    let mut common = 0;
    while depth + common < first.len() && first[depth + common] == last[depth + common] {
        common += 1;
    }
    if common > 0 {
        let child = build_node(entries, depth + common);
        let compact = Nibbles::from_hex(first[depth..depth + common].to_vec()).encode_compact();
        let mut payload = Vec::new();
        compact.as_slice().encode(&mut payload);
        payload.extend_from_slice(&node_ref(child));
        return wrap_list(payload);
    }

    let mut payload = Vec::new();
    let mut idx = 0;
    for digit in 0..16u8 {
        let start = idx;
        while idx < entries.len() && entries[idx].0[depth] == digit {
            idx += 1;
        }
        if idx > start {
            let child = build_node(&entries[start..idx], depth + 1);
            payload.extend_from_slice(&node_ref(child));
        } else {
            payload.push(0x80);
        }
    }
    payload.push(0x80); // the 17th slot stays empty for keyed tries
    wrap_list(payload)
}

/// Root of the node covering `entries` at the given nibble depth.
pub fn subtree_hash(entries: &[(Vec<u8>, Vec<u8>)], depth: usize) -> H256 {
    H256(keccak_hash(&build_node(entries, depth)))
}

/// Root of a trie over `(nibble path, leaf value item)` pairs. The root node
/// is always hashed.
pub fn trie_root(mut entries: Vec<(Vec<u8>, Vec<u8>)>) -> H256 {
    if entries.is_empty() {
        return *EMPTY_TRIE_HASH;
    }
    entries.sort();
    H256(keccak_hash(&build_node(&entries, 0)))
}

/// Root of a storage trie over raw (already zero-trimmed) slot values.
pub fn storage_root(slots: &[(H256, Vec<u8>)]) -> H256 {
    let entries = slots
        .iter()
        .map(|(key_hash, raw)| {
            let inner = raw.as_slice().encode_to_vec();
            let item = inner.as_slice().encode_to_vec();
            (unpack(key_hash.as_bytes()), item)
        })
        .collect();
    trie_root(entries)
}

/// Root of the account trie; storage roots are derived from `slots`.
pub fn state_root(accounts: &[(H256, Account, Vec<(H256, Vec<u8>)>)]) -> H256 {
    let entries = accounts
        .iter()
        .map(|(addr_hash, account, slots)| {
            let mut account = account.clone();
            account.storage_root = storage_root(slots);
            let mut account_rlp = Vec::new();
            account.encode_for_hashing(&mut account_rlp);
            let item = account_rlp.as_slice().encode_to_vec();
            (unpack(addr_hash.as_bytes()), item)
        })
        .collect();
    trie_root(entries)
}

/// Dumps a whole table for equality comparisons.
pub fn dump_table(backend: &InMemoryBackend, table: &str) -> Vec<(Vec<u8>, Vec<u8>)> {
    let view = backend.begin_read().unwrap();
    let mut cursor = view.cursor(table).unwrap();
    let mut out = Vec::new();
    let mut entry = cursor.seek(&[]).unwrap();
    while let Some(kv) = entry {
        out.push(kv.clone());
        entry = cursor.next().unwrap();
    }
    out
}

/// Checks that every cached intermediate hash still matches the flat table
/// underneath it.
pub fn assert_ih_consistent(backend: &InMemoryBackend) {
    let state = dump_table(backend, tables::STATE);
    for (key, value) in dump_table(backend, tables::INTERMEDIATE_HASH) {
        let (entries, depth) = if key.len() >= 40 {
            // storage sub-trie prefix: address ‖ incarnation ‖ partial key
            let mut entries = Vec::new();
            for (row_key, row_value) in &state {
                if row_key.len() > 32 && row_key.starts_with(&key) {
                    let mut path = unpack(&row_key[..32]);
                    path.extend(unpack(&row_key[40..]));
                    let inner = row_value.as_slice().encode_to_vec();
                    entries.push((path, inner.as_slice().encode_to_vec()));
                }
            }
            (entries, 64 + (key.len() - 40) * 2)
        } else {
            // account-trie prefix
            let mut entries = Vec::new();
            for (row_key, row_value) in &state {
                if row_key.len() != 32 || !row_key.starts_with(&key) {
                    continue;
                }
                let mut account = Account::decode_for_storage(row_value).unwrap();
                let mut slots = Vec::new();
                for (k, v) in &state {
                    if k.len() > 32 && k.starts_with(row_key) {
                        slots.push((H256::from_slice(&k[40..]), v.clone()));
                    }
                }
                account.storage_root = storage_root(&slots);
                let mut account_rlp = Vec::new();
                account.encode_for_hashing(&mut account_rlp);
                entries.push((unpack(row_key), account_rlp.as_slice().encode_to_vec()));
            }
            (entries, key.len() * 2)
        };
        if entries.is_empty() {
            continue;
        }
        let mut entries = entries;
        entries.sort();
        let rlp = build_node(&entries, depth);
        assert_eq!(
            H256(keccak_hash(&rlp)),
            H256::from_slice(&value),
            "stale intermediate hash under {key:02x?}"
        );
    }
}
