//! Stack-allocated composite keys for the state and history tables.

use ethereum_types::H256;

/// Byte length of an account row key.
pub const ACCOUNT_KEY_LENGTH: usize = 32;
/// Byte length of the incarnation segment of a storage row key.
pub const INCARNATION_LENGTH: usize = 8;
/// Byte length of a storage row key.
pub const STORAGE_KEY_LENGTH: usize = 72;
/// Byte length of a storage sub-trie prefix: address hash plus incarnation.
pub const STORAGE_PREFIX_LENGTH: usize = 40;

/// Encodes an incarnation for key composition: big-endian one's complement,
/// so that newer incarnations sort first within an account's range.
#[inline]
pub fn encode_incarnation(incarnation: u64) -> [u8; 8] {
    (!incarnation).to_be_bytes()
}

#[inline]
pub fn decode_incarnation(bytes: &[u8; 8]) -> u64 {
    !u64::from_be_bytes(*bytes)
}

/// 72-byte storage row key:
/// address hash (32) ‖ one's-complement incarnation (8, big-endian) ‖
/// storage-key hash (32).
#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct StorageKey([u8; STORAGE_KEY_LENGTH]);

impl StorageKey {
    #[inline]
    pub fn new(address_hash: H256, incarnation: u64, key_hash: H256) -> Self {
        let mut key = [0u8; STORAGE_KEY_LENGTH];
        key[..32].copy_from_slice(address_hash.as_bytes());
        key[32..40].copy_from_slice(&encode_incarnation(incarnation));
        key[40..].copy_from_slice(key_hash.as_bytes());
        Self(key)
    }

    #[inline]
    pub fn address_hash(&self) -> H256 {
        H256::from_slice(&self.0[..32])
    }

    #[inline]
    pub fn incarnation(&self) -> u64 {
        decode_incarnation(self.0[32..40].try_into().expect("fixed layout"))
    }

    #[inline]
    pub fn key_hash(&self) -> H256 {
        H256::from_slice(&self.0[40..])
    }
}

impl AsRef<[u8]> for StorageKey {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// 40-byte prefix covering one incarnation of one account's storage.
#[inline]
pub fn storage_prefix(address_hash: H256, incarnation: u64) -> [u8; STORAGE_PREFIX_LENGTH] {
    let mut prefix = [0u8; STORAGE_PREFIX_LENGTH];
    prefix[..32].copy_from_slice(address_hash.as_bytes());
    prefix[32..].copy_from_slice(&encode_incarnation(incarnation));
    prefix
}

/// History row key: the canonical state key followed by the big-endian block
/// number the pre-image value belongs to.
#[inline]
pub fn history_key(state_key: &[u8], block: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(state_key.len() + 8);
    key.extend_from_slice(state_key);
    key.extend_from_slice(&block.to_be_bytes());
    key
}

/// Splits a history row key back into the state key and the block number.
pub fn split_history_key(key: &[u8]) -> Option<(&[u8], u64)> {
    if key.len() < 8 {
        return None;
    }
    let (state_key, block_bytes) = key.split_at(key.len() - 8);
    let block = u64::from_be_bytes(block_bytes.try_into().ok()?);
    Some((state_key, block))
}
