//! Batch persistence: the store contract plus in-memory and Postgres backends.

mod in_memory;
mod postgres;
mod r#trait;

pub use in_memory::InMemoryBatchStore;
pub use postgres::PostgresBatchStore;
pub use r#trait::{BatchStore, BatchStoreError};
