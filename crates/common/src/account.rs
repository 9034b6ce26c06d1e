use bytes::BufMut;
use ethereum_types::{H256, U256};
use serde::{Deserialize, Serialize};
use strata_rlp::{
    decode::{list_arity, RLPDecode},
    encode::{list_length, RLPEncode},
    error::RLPDecodeError,
    structs::{Decoder, Encoder},
};

use crate::constants::{EMPTY_CODE_HASH, EMPTY_TRIE_HASH};

/// First incarnation of a freshly created account.
pub const INITIAL_INCARNATION: u64 = 1;

/// Largest incarnation a live account may carry. The all-ones value is
/// reserved: its one's complement is the zero prefix, which would make the
/// account's storage rows sort before every other incarnation and break the
/// stale-storage skip.
pub const MAX_INCARNATION: u64 = u64::MAX - 1;

/// State record of a single account.
///
/// The storage root equals the empty-trie root iff the account has no
/// storage; the code hash equals keccak(&[]) iff the account has no code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub nonce: u64,
    pub balance: U256,
    pub storage_root: H256,
    pub code_hash: H256,
    pub incarnation: u64,
    pub storage_size: Option<u64>,
}

impl Default for Account {
    fn default() -> Self {
        Self {
            nonce: 0,
            balance: U256::zero(),
            storage_root: *EMPTY_TRIE_HASH,
            code_hash: *EMPTY_CODE_HASH,
            incarnation: INITIAL_INCARNATION,
            storage_size: None,
        }
    }
}

impl Account {
    pub fn has_code(&self) -> bool {
        self.code_hash != *EMPTY_CODE_HASH
    }

    pub fn has_storage(&self) -> bool {
        self.storage_root != *EMPTY_TRIE_HASH
    }

    fn effective_storage_size(&self) -> Option<u64> {
        self.storage_size.filter(|size| *size != 0)
    }

    /// Encodes the account for the flat state table.
    ///
    /// The encoding is keyed on list arity rather than byte length:
    /// * `0xc0` — empty account,
    /// * 2 items — `(nonce, balance)`, empty root and code hash,
    /// * 4 items — `(nonce, balance, storage_root, code_hash)`,
    /// * 5 items — the above plus `incarnation`,
    /// * 6 items — the above plus `storage_size`.
    pub fn encode_for_storage(&self, buf: &mut dyn BufMut) {
        let storage_size = self.effective_storage_size();
        let plain = !self.has_code()
            && !self.has_storage()
            && self.incarnation == INITIAL_INCARNATION
            && storage_size.is_none();

        if plain && self.nonce == 0 && self.balance.is_zero() {
            // Empty account
            buf.put_u8(0xc0);
            return;
        }
        if plain {
            Encoder::new(buf)
                .encode_field(&self.nonce)
                .encode_field(&self.balance)
                .finish();
            return;
        }

        let encoder = Encoder::new(buf)
            .encode_field(&self.nonce)
            .encode_field(&self.balance)
            .encode_field(&self.storage_root)
            .encode_field(&self.code_hash);
        match (self.incarnation, storage_size) {
            (INITIAL_INCARNATION, None) => encoder.finish(),
            (incarnation, None) => encoder.encode_field(&incarnation).finish(),
            (incarnation, Some(size)) => encoder
                .encode_field(&incarnation)
                .encode_field(&size)
                .finish(),
        }
    }

    pub fn encode_for_storage_to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_for_storage(&mut buf);
        buf
    }

    /// Decodes a flat-table account record; see [`encode_for_storage`](Self::encode_for_storage).
    pub fn decode_for_storage(encoded: &[u8]) -> Result<Self, RLPDecodeError> {
        let mut account = Account::default();
        match list_arity(encoded)? {
            0 => {}
            2 => {
                let decoder = Decoder::new(encoded)?;
                let (nonce, decoder) = decoder.decode_field("nonce")?;
                let (balance, decoder) = decoder.decode_field("balance")?;
                decoder.finish()?;
                account.nonce = nonce;
                account.balance = balance;
            }
            arity @ 4..=6 => {
                let decoder = Decoder::new(encoded)?;
                let (nonce, decoder) = decoder.decode_field("nonce")?;
                let (balance, decoder) = decoder.decode_field("balance")?;
                let (storage_root, decoder) = decoder.decode_field("storage_root")?;
                let (code_hash, mut decoder) = decoder.decode_field("code_hash")?;
                account.nonce = nonce;
                account.balance = balance;
                account.storage_root = storage_root;
                account.code_hash = code_hash;
                if arity >= 5 {
                    let (incarnation, rest) = decoder.decode_field("incarnation")?;
                    account.incarnation = incarnation;
                    decoder = rest;
                }
                if arity == 6 {
                    let (storage_size, rest) = decoder.decode_field::<u64>("storage_size")?;
                    account.storage_size = Some(storage_size);
                    decoder = rest;
                }
                decoder.finish()?;
            }
            arity => {
                return Err(RLPDecodeError::Custom(format!(
                    "invalid account record arity {arity}"
                )));
            }
        }
        Ok(account)
    }

    /// Encodes the account for trie hashing: the canonical 4-field RLP
    /// `(nonce, balance, storage_root, code_hash)`.
    pub fn encode_for_hashing(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.nonce)
            .encode_field(&self.balance)
            .encode_field(&self.storage_root)
            .encode_field(&self.code_hash)
            .finish();
    }

    pub fn encoding_length_for_hashing(&self) -> usize {
        let payload_len =
            self.nonce.length() + self.balance.length() + self.storage_root.length() + self.code_hash.length();
        list_length(payload_len)
    }

    pub fn encoding_length_for_storage(&self) -> usize {
        // Storage records are small; predicting the exact length would just
        // duplicate the arity selection above.
        self.encode_for_storage_to_vec().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn empty_account_is_single_byte() {
        let account = Account::default();
        assert_eq!(account.encode_for_storage_to_vec(), vec![0xc0]);
        assert_eq!(Account::decode_for_storage(&[0xc0]).unwrap(), account);
    }

    #[test]
    fn balance_and_nonce_short_form() {
        let account = Account {
            nonce: 2,
            balance: U256::from(1000),
            ..Default::default()
        };
        let encoded = account.encode_for_storage_to_vec();
        // [nonce, balance] only
        assert_eq!(list_arity(&encoded).unwrap(), 2);
        assert_eq!(Account::decode_for_storage(&encoded).unwrap(), account);
    }

    #[test]
    fn contract_roundtrip() {
        let account = Account {
            nonce: 1,
            balance: U256::from(77),
            storage_root: H256::repeat_byte(0x11),
            code_hash: H256::repeat_byte(0x22),
            incarnation: INITIAL_INCARNATION,
            storage_size: None,
        };
        let encoded = account.encode_for_storage_to_vec();
        assert_eq!(list_arity(&encoded).unwrap(), 4);
        assert_eq!(Account::decode_for_storage(&encoded).unwrap(), account);
    }

    #[test]
    fn recreated_contract_keeps_incarnation() {
        let account = Account {
            nonce: 1,
            balance: U256::zero(),
            storage_root: H256::repeat_byte(0x11),
            code_hash: H256::repeat_byte(0x22),
            incarnation: 3,
            storage_size: None,
        };
        let encoded = account.encode_for_storage_to_vec();
        assert_eq!(list_arity(&encoded).unwrap(), 5);
        assert_eq!(Account::decode_for_storage(&encoded).unwrap(), account);
    }

    #[test]
    fn storage_size_roundtrip() {
        let account = Account {
            nonce: 0,
            balance: U256::zero(),
            storage_root: H256::repeat_byte(0x33),
            code_hash: H256::repeat_byte(0x44),
            incarnation: 2,
            storage_size: Some(12),
        };
        let encoded = account.encode_for_storage_to_vec();
        assert_eq!(list_arity(&encoded).unwrap(), 6);
        assert_eq!(Account::decode_for_storage(&encoded).unwrap(), account);

        // A zero storage size is elided entirely
        let account = Account {
            storage_size: Some(0),
            incarnation: 2,
            ..account
        };
        let encoded = account.encode_for_storage_to_vec();
        assert_eq!(list_arity(&encoded).unwrap(), 5);
        assert_eq!(
            Account::decode_for_storage(&encoded).unwrap().storage_size,
            None
        );
    }

    #[test]
    fn hashing_encoding_of_pristine_account() {
        let account = Account::default();
        let mut buf = Vec::new();
        account.encode_for_hashing(&mut buf);
        // 2 empty scalars + 2 well-known hashes
        let expected = hex::decode(concat!(
            "f8448080",
            "a056e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421",
            "a0c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470",
        ))
        .unwrap();
        assert_eq!(buf, expected);
        assert_eq!(account.encoding_length_for_hashing(), expected.len());
    }

    #[test]
    fn hashing_encoding_ignores_incarnation() {
        let a = Account {
            incarnation: 5,
            ..Default::default()
        };
        let b = Account::default();
        let mut buf_a = Vec::new();
        let mut buf_b = Vec::new();
        a.encode_for_hashing(&mut buf_a);
        b.encode_for_hashing(&mut buf_b);
        assert_eq!(buf_a, buf_b);
    }

    #[test]
    fn decode_rejects_bad_arity() {
        let bad = (1u8, 2u8, 3u8).encode_to_vec();
        assert!(Account::decode_for_storage(&bad).is_err());
    }

    #[test]
    fn well_known_empty_hashes() {
        // Redundant with constants tests, but pins the defaults used above.
        let account = Account::default();
        assert_eq!(
            account.storage_root,
            H256::from_str("56e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421")
                .unwrap()
        );
        assert!(!account.has_code());
        assert!(!account.has_storage());
    }
}
