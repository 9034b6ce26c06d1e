pub mod account;
pub mod cancel;
pub mod constants;

pub use account::{Account, INITIAL_INCARNATION, MAX_INCARNATION};
pub use cancel::CancelToken;
pub use constants::{EMPTY_CODE_HASH, EMPTY_TRIE_HASH};

pub use ethereum_types::{Address, H256, U256};
