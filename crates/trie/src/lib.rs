mod error;
mod hash_builder;
mod nibbles;
mod node;
mod retain;
mod rlputil;
mod struct_gen;

pub use error::TrieError;
pub use hash_builder::{AccountFieldSet, HashBuilder};
pub use nibbles::{bytes_mask, key_is_before, next_account, next_subtree, Nibbles};
pub use node::{Node, NodeArena, NodeId};
pub use retain::{RetainAll, RetainDecider, RetainList, RetainNothing};
pub use rlputil::{RlpEncodedBytes, RlpSerializable, RlpSerializableBytes};
pub use struct_gen::{gen_struct_step, AccountStepData, HashCollector, StepData};

pub use strata_common::{EMPTY_CODE_HASH, EMPTY_TRIE_HASH};
