use ethereum_types::H256;
use lazy_static::lazy_static;
use strata_crypto::keccak_hash;
use strata_rlp::constants::RLP_NULL;

lazy_static! {
    /// Root hash of an empty trie: keccak(rlp("")).
    pub static ref EMPTY_TRIE_HASH: H256 = H256(keccak_hash([RLP_NULL]));
    /// Code hash of an account without code: keccak(&[]).
    pub static ref EMPTY_CODE_HASH: H256 = H256(keccak_hash([]));
}
