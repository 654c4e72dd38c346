//! Persistence of finalized sales documents and their allocation lines.

mod in_memory;

use std::sync::Arc;

use thiserror::Error;

use stockledger_core::{ExpectedVersion, TenantId};
use stockledger_inventory::BatchId;
use stockledger_sales::{SalesAllocationLine, SalesDocument, SalesDocumentId};

pub use in_memory::InMemorySalesDocumentStore;

#[derive(Debug, Error)]
pub enum SalesStoreError {
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    #[error("sales document not found: {0}")]
    NotFound(SalesDocumentId),

    #[error("duplicate sales document: {0}")]
    Duplicate(SalesDocumentId),

    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// Tenant-scoped, versioned storage of sales documents.
pub trait SalesDocumentStore: Send + Sync {
    fn get(
        &self,
        tenant_id: TenantId,
        document_id: SalesDocumentId,
    ) -> Result<Option<SalesDocument>, SalesStoreError>;

    /// Store a freshly finalized document. Fails with `Duplicate` if the id is taken.
    fn insert(&self, document: SalesDocument) -> Result<SalesDocument, SalesStoreError>;

    /// Replace a document, provided the stored copy is at `expected_version`.
    fn save(
        &self,
        document: SalesDocument,
        expected_version: ExpectedVersion,
    ) -> Result<SalesDocument, SalesStoreError>;

    /// Allocation lines of finalized (not deleted) documents drawing on a batch.
    fn active_allocations_for_batch(
        &self,
        tenant_id: TenantId,
        batch_id: BatchId,
    ) -> Result<Vec<SalesAllocationLine>, SalesStoreError>;
}

impl<S> SalesDocumentStore for Arc<S>
where
    S: SalesDocumentStore + ?Sized,
{
    fn get(
        &self,
        tenant_id: TenantId,
        document_id: SalesDocumentId,
    ) -> Result<Option<SalesDocument>, SalesStoreError> {
        (**self).get(tenant_id, document_id)
    }

    fn insert(&self, document: SalesDocument) -> Result<SalesDocument, SalesStoreError> {
        (**self).insert(document)
    }

    fn save(
        &self,
        document: SalesDocument,
        expected_version: ExpectedVersion,
    ) -> Result<SalesDocument, SalesStoreError> {
        (**self).save(document, expected_version)
    }

    fn active_allocations_for_batch(
        &self,
        tenant_id: TenantId,
        batch_id: BatchId,
    ) -> Result<Vec<SalesAllocationLine>, SalesStoreError> {
        (**self).active_allocations_for_batch(tenant_id, batch_id)
    }
}
