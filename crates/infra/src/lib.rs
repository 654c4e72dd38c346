//! Infrastructure layer: batch and sales document storage, collaborator
//! lookups, and the ledger that orchestrates stock movements over them.

pub mod batch_store;
pub mod directory;
pub mod ledger;
pub mod sales_store;

pub use batch_store::{BatchStore, BatchStoreError, InMemoryBatchStore, PostgresBatchStore};
pub use directory::{Directory, InMemoryDirectory, PartyDirectory, ProductDirectory};
pub use ledger::{InventoryLedger, LedgerConfig, LedgerError};
pub use sales_store::{InMemorySalesDocumentStore, SalesDocumentStore, SalesStoreError};

#[cfg(test)]
pub(crate) mod testing;
