//! Store wrappers that fail on demand, for exercising rollback paths.
//!
//! Each wrapper forwards to an in-memory store. Arming a [`FaultPlan`] with
//! `fail_nth(n)` makes the n-th matching call from then on fail once with a
//! backend error; every other call goes through untouched.

use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, NaiveDate, Utc};

use stockledger_core::{ExpectedVersion, TenantId};
use stockledger_inventory::{
    AdjustmentRecord, AllocationMode, Batch, BatchId, BatchNumber, InventoryFilter, ProductId,
    StockDelta,
};
use stockledger_sales::{SalesAllocationLine, SalesDocument, SalesDocumentId};

use crate::batch_store::{BatchStore, BatchStoreError, InMemoryBatchStore};
use crate::sales_store::{InMemorySalesDocumentStore, SalesDocumentStore, SalesStoreError};

pub(crate) const CONNECTION_RESET: &str = "connection reset";

/// One-shot failure countdown. Zero means disarmed.
#[derive(Debug, Default)]
pub(crate) struct FaultPlan {
    countdown: AtomicUsize,
}

impl FaultPlan {
    pub(crate) fn fail_nth(&self, nth: usize) {
        self.countdown.store(nth, Ordering::SeqCst);
    }

    fn trips(&self) -> bool {
        self.countdown
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .map(|previous| previous == 1)
            .unwrap_or(false)
    }
}

/// Batch store whose `apply_delta` can be made to fail.
#[derive(Debug, Default)]
pub(crate) struct FlakyBatchStore {
    inner: InMemoryBatchStore,
    pub(crate) writes: FaultPlan,
}

impl FlakyBatchStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }
}

impl BatchStore for FlakyBatchStore {
    fn get(&self, tenant_id: TenantId, batch_id: BatchId) -> Result<Option<Batch>, BatchStoreError> {
        self.inner.get(tenant_id, batch_id)
    }

    fn find_by_product(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
        filter: &InventoryFilter,
        today: NaiveDate,
    ) -> Result<Vec<Batch>, BatchStoreError> {
        self.inner.find_by_product(tenant_id, product_id, filter, today)
    }

    fn find_candidates(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
        mode: AllocationMode,
        today: NaiveDate,
        limit: usize,
    ) -> Result<Vec<Batch>, BatchStoreError> {
        self.inner.find_candidates(tenant_id, product_id, mode, today, limit)
    }

    fn find_by_number(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
        batch_number: &BatchNumber,
    ) -> Result<Option<Batch>, BatchStoreError> {
        self.inner.find_by_number(tenant_id, product_id, batch_number)
    }

    fn list_tenant(
        &self,
        tenant_id: TenantId,
        filter: &InventoryFilter,
        today: NaiveDate,
    ) -> Result<Vec<Batch>, BatchStoreError> {
        self.inner.list_tenant(tenant_id, filter, today)
    }

    fn create(&self, batch: Batch) -> Result<Batch, BatchStoreError> {
        self.inner.create(batch)
    }

    fn apply_delta(
        &self,
        tenant_id: TenantId,
        batch_id: BatchId,
        delta: StockDelta,
        expected_version: ExpectedVersion,
        at: DateTime<Utc>,
    ) -> Result<Batch, BatchStoreError> {
        if self.writes.trips() {
            return Err(BatchStoreError::Backend(CONNECTION_RESET.to_string()));
        }
        self.inner.apply_delta(tenant_id, batch_id, delta, expected_version, at)
    }

    fn apply_adjustment(
        &self,
        record: AdjustmentRecord,
        expected_version: ExpectedVersion,
    ) -> Result<(Batch, AdjustmentRecord), BatchStoreError> {
        self.inner.apply_adjustment(record, expected_version)
    }

    fn adjustments_for_batch(
        &self,
        tenant_id: TenantId,
        batch_id: BatchId,
    ) -> Result<Vec<AdjustmentRecord>, BatchStoreError> {
        self.inner.adjustments_for_batch(tenant_id, batch_id)
    }

    fn update(&self, batch: &Batch, expected_version: ExpectedVersion) -> Result<Batch, BatchStoreError> {
        self.inner.update(batch, expected_version)
    }
}

/// Sales document store whose `insert` and `save` can be made to fail.
#[derive(Debug, Default)]
pub(crate) struct FlakyDocumentStore {
    inner: InMemorySalesDocumentStore,
    pub(crate) inserts: FaultPlan,
    pub(crate) saves: FaultPlan,
}

impl FlakyDocumentStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }
}

impl SalesDocumentStore for FlakyDocumentStore {
    fn get(
        &self,
        tenant_id: TenantId,
        document_id: SalesDocumentId,
    ) -> Result<Option<SalesDocument>, SalesStoreError> {
        self.inner.get(tenant_id, document_id)
    }

    fn insert(&self, document: SalesDocument) -> Result<SalesDocument, SalesStoreError> {
        if self.inserts.trips() {
            return Err(SalesStoreError::Backend(CONNECTION_RESET.to_string()));
        }
        self.inner.insert(document)
    }

    fn save(
        &self,
        document: SalesDocument,
        expected_version: ExpectedVersion,
    ) -> Result<SalesDocument, SalesStoreError> {
        if self.saves.trips() {
            return Err(SalesStoreError::Backend(CONNECTION_RESET.to_string()));
        }
        self.inner.save(document, expected_version)
    }

    fn active_allocations_for_batch(
        &self,
        tenant_id: TenantId,
        batch_id: BatchId,
    ) -> Result<Vec<SalesAllocationLine>, SalesStoreError> {
        self.inner.active_allocations_for_batch(tenant_id, batch_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_plan_trips_exactly_once_on_the_nth_call() {
        let plan = FaultPlan::default();
        assert!(!plan.trips());

        plan.fail_nth(3);
        let calls: Vec<bool> = (0..5).map(|_| plan.trips()).collect();
        assert_eq!(calls, vec![false, false, true, false, false]);
    }
}
