use strata_rlp::error::RLPDecodeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrieError {
    #[error(transparent)]
    RLPDecode(#[from] RLPDecodeError),
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
    #[error("Computation cancelled")]
    Cancelled,
}
