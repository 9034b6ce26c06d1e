use crate::api::StorageBackend;
use crate::error::StoreError;

/// Flat state table: accounts (32-byte keys) and storage (72-byte keys).
pub const STATE: &str = "state";
/// Contract bytecode by code hash.
pub const CODE: &str = "code";
/// Nibble-prefix → 32-byte sub-trie root, for sub-tries that are still
/// current.
pub const INTERMEDIATE_HASH: &str = "intermediate_hash";
/// Companion of [`INTERMEDIATE_HASH`]: prefix → big-endian u64 witness
/// length.
pub const INTERMEDIATE_WITNESS_LEN: &str = "intermediate_witness_len";
/// Pre-image account values keyed by `account key ‖ be64(block)`.
pub const ACCOUNT_HISTORY: &str = "account_history";
/// Pre-image storage values keyed by `storage key ‖ be64(block)`.
pub const STORAGE_HISTORY: &str = "storage_history";
/// Hash → original key bytes.
pub const PREIMAGE: &str = "preimage";

pub const TABLES: [&str; 7] = [
    STATE,
    CODE,
    INTERMEDIATE_HASH,
    INTERMEDIATE_WITNESS_LEN,
    ACCOUNT_HISTORY,
    STORAGE_HISTORY,
    PREIMAGE,
];

/// Creates every table the engine requires.
pub fn create_all(backend: &dyn StorageBackend) -> Result<(), StoreError> {
    for table in TABLES {
        backend.create_table(table)?;
    }
    Ok(())
}
