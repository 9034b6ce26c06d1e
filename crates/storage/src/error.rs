use ethereum_types::H256;
use strata_rlp::error::RLPDecodeError;
use strata_trie::TrieError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to acquire a database lock")]
    LockError,
    #[error("Unknown table {0}")]
    UnknownTable(String),
    #[error(transparent)]
    RLPDecode(#[from] RLPDecodeError),
    #[error(transparent)]
    Trie(#[from] TrieError),
    #[error("Malformed record under key {key}: {source}")]
    Decode {
        key: String,
        source: RLPDecodeError,
    },
    #[error("Root hash mismatch: expected {expected:#x}, computed {computed:#x}")]
    HashMismatch { expected: H256, computed: H256 },
    #[error("Incarnation {0} is out of range")]
    InvalidIncarnation(u64),
    #[error("Computation cancelled")]
    Cancelled,
    #[error("{0}")]
    Custom(String),
}
