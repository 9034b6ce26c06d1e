pub mod api;
pub mod backend;
pub mod error;
pub mod keys;
pub mod layering;
pub mod state;
pub mod sub_trie_loader;
pub mod tables;

pub use api::{StorageBackend, StorageCursor, StorageReadView, StorageWriteBatch};
pub use backend::in_memory::InMemoryBackend;
pub use error::StoreError;
pub use layering::{Overlay, OverlayView};
pub use state::{Buffer, DbStateWriter, StateReader, StateWriter, TrieDbState, TrieStateWriter};
pub use sub_trie_loader::{StreamItem, SubTrieLoader, SubTries};
