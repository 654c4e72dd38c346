use std::collections::HashMap;
use std::sync::RwLock;

use stockledger_core::{ExpectedVersion, TenantId, Versioned};
use stockledger_inventory::BatchId;
use stockledger_sales::{SalesAllocationLine, SalesDocument, SalesDocumentId};

use super::{SalesDocumentStore, SalesStoreError};

/// In-memory sales document store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemorySalesDocumentStore {
    documents: RwLock<HashMap<(TenantId, SalesDocumentId), SalesDocument>>,
}

impl InMemorySalesDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> SalesStoreError {
    SalesStoreError::Backend("lock poisoned".to_string())
}

impl SalesDocumentStore for InMemorySalesDocumentStore {
    fn get(
        &self,
        tenant_id: TenantId,
        document_id: SalesDocumentId,
    ) -> Result<Option<SalesDocument>, SalesStoreError> {
        let docs = self.documents.read().map_err(|_| poisoned())?;
        Ok(docs.get(&(tenant_id, document_id)).cloned())
    }

    fn insert(&self, document: SalesDocument) -> Result<SalesDocument, SalesStoreError> {
        let mut docs = self.documents.write().map_err(|_| poisoned())?;
        let key = (document.tenant_id(), document.id_typed());
        if docs.contains_key(&key) {
            return Err(SalesStoreError::Duplicate(document.id_typed()));
        }
        docs.insert(key, document.clone());
        Ok(document)
    }

    fn save(
        &self,
        document: SalesDocument,
        expected_version: ExpectedVersion,
    ) -> Result<SalesDocument, SalesStoreError> {
        let mut docs = self.documents.write().map_err(|_| poisoned())?;
        let key = (document.tenant_id(), document.id_typed());
        let current = docs
            .get(&key)
            .ok_or(SalesStoreError::NotFound(document.id_typed()))?;

        expected_version.check(current.version()).map_err(|e| {
            SalesStoreError::Concurrency(format!("sales document {}: {e}", document.id_typed()))
        })?;
        if document.version() <= current.version() {
            return Err(SalesStoreError::Concurrency(format!(
                "sales document {} must advance past version {}",
                document.id_typed(),
                current.version()
            )));
        }

        docs.insert(key, document.clone());
        Ok(document)
    }

    fn active_allocations_for_batch(
        &self,
        tenant_id: TenantId,
        batch_id: BatchId,
    ) -> Result<Vec<SalesAllocationLine>, SalesStoreError> {
        let docs = self.documents.read().map_err(|_| poisoned())?;
        Ok(docs
            .iter()
            .filter(|((t, _), doc)| *t == tenant_id && doc.is_active())
            .flat_map(|(_, doc)| doc.allocations().iter().copied())
            .filter(|a| a.batch_id == batch_id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use stockledger_core::EntityId;
    use stockledger_inventory::ProductId;
    use stockledger_sales::{CustomerId, SaleLine, SalesRequest};

    fn finalized(tenant_id: TenantId, batch_id: BatchId) -> SalesDocument {
        let product_id = ProductId::new(EntityId::new());
        let request = SalesRequest {
            tenant_id,
            document_id: SalesDocumentId::new(EntityId::new()),
            customer_id: CustomerId::new(EntityId::new()),
            employee_ids: vec![],
            lines: vec![SaleLine::new(product_id, 2, 100)],
            occurred_at: Utc::now(),
        };
        let line = SalesAllocationLine {
            document_id: request.document_id,
            batch_id,
            product_id,
            quantity: 2,
            unit_price: 100,
        };
        SalesDocument::finalize(&request, vec![line]).unwrap()
    }

    #[test]
    fn save_requires_the_expected_version() {
        let store = InMemorySalesDocumentStore::new();
        let tenant_id = TenantId::new();
        let doc = store.insert(finalized(tenant_id, BatchId::new(EntityId::new()))).unwrap();

        let mut deleted = doc.clone();
        deleted.mark_deleted(Utc::now()).unwrap();
        assert!(matches!(
            store.save(deleted.clone(), ExpectedVersion::Exact(2)),
            Err(SalesStoreError::Concurrency(_))
        ));
        assert!(store.save(deleted, ExpectedVersion::Exact(1)).is_ok());
        assert!(matches!(store.insert(doc), Err(SalesStoreError::Duplicate(_))));
    }

    #[test]
    fn deleted_documents_hold_no_allocations() {
        let store = InMemorySalesDocumentStore::new();
        let tenant_id = TenantId::new();
        let batch_id = BatchId::new(EntityId::new());
        let doc = store.insert(finalized(tenant_id, batch_id)).unwrap();
        assert_eq!(store.active_allocations_for_batch(tenant_id, batch_id).unwrap().len(), 1);
        assert!(store
            .active_allocations_for_batch(TenantId::new(), batch_id)
            .unwrap()
            .is_empty());

        let mut deleted = doc;
        deleted.mark_deleted(Utc::now()).unwrap();
        store.save(deleted, ExpectedVersion::Exact(1)).unwrap();
        assert!(store.active_allocations_for_batch(tenant_id, batch_id).unwrap().is_empty());
    }
}
