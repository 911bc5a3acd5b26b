mod memory;
mod provider;

pub use memory::{MemoryStore, MemoryStoreError};
pub use provider::{matches_prefix, normalize_prefix, Node, PutCondition, Store, StoreError};
