pub mod error;
pub mod kv_store;
pub mod types;

pub use error::StoreError;
pub use kv_store::KVStore;
pub use types::{KVConfig, KVStats, StoredValue};
