pub mod keccak;

pub use keccak::{keccak_hash, Keccak256State};
