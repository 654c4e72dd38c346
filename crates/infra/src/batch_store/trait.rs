use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;

use stockledger_core::{DomainError, ExpectedVersion, TenantId};
use stockledger_inventory::{
    AdjustmentRecord, AllocationMode, Batch, BatchId, BatchNumber, InventoryFilter, ProductId,
    StockDelta,
};

/// Batch store operation error.
///
/// These are **infrastructure errors** (storage and concurrency).
/// A guarded write that would break the quantity invariants surfaces as
/// `Rejected` carrying the domain reason; nothing is written in that case.
#[derive(Debug, Error)]
pub enum BatchStoreError {
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    #[error("batch not found: {0}")]
    NotFound(BatchId),

    #[error("duplicate batch: {0}")]
    Duplicate(String),

    #[error("write rejected: {0}")]
    Rejected(DomainError),

    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// Tenant-scoped persistence of inventory batches.
///
/// ## Mutation Semantics
///
/// `apply_delta` is the only quantity mutation primitive. It is linearized per
/// batch: the store re-validates `0 <= reserved <= on_hand` against the row as
/// it is at write time, and with `ExpectedVersion::Exact` additionally fails
/// with `Concurrency` if the row changed since it was read. Every successful
/// mutation bumps `version` by one and returns the new row.
///
/// Batches are never deleted.
pub trait BatchStore: Send + Sync {
    fn get(&self, tenant_id: TenantId, batch_id: BatchId) -> Result<Option<Batch>, BatchStoreError>;

    /// Batches of one product that pass `filter` as of `today`, oldest first.
    fn find_by_product(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
        filter: &InventoryFilter,
        today: NaiveDate,
    ) -> Result<Vec<Batch>, BatchStoreError>;

    /// Sellable batches (active, unexpired, `available > 0`) in draw-down
    /// order, at most `limit` of them.
    fn find_candidates(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
        mode: AllocationMode,
        today: NaiveDate,
        limit: usize,
    ) -> Result<Vec<Batch>, BatchStoreError>;

    /// The batch with this number, active or not.
    fn find_by_number(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
        batch_number: &BatchNumber,
    ) -> Result<Option<Batch>, BatchStoreError>;

    /// Every batch of the tenant passing `filter` as of `today`.
    fn list_tenant(
        &self,
        tenant_id: TenantId,
        filter: &InventoryFilter,
        today: NaiveDate,
    ) -> Result<Vec<Batch>, BatchStoreError>;

    /// Insert a new batch. Fails with `Duplicate` if the tenant already has a
    /// batch with the same product and number.
    fn create(&self, batch: Batch) -> Result<Batch, BatchStoreError>;

    fn apply_delta(
        &self,
        tenant_id: TenantId,
        batch_id: BatchId,
        delta: StockDelta,
        expected_version: ExpectedVersion,
        at: DateTime<Utc>,
    ) -> Result<Batch, BatchStoreError>;

    /// Apply `record.delta` to on-hand and append `record` in one atomic step.
    ///
    /// The stored record carries the real `on_hand_after`.
    fn apply_adjustment(
        &self,
        record: AdjustmentRecord,
        expected_version: ExpectedVersion,
    ) -> Result<(Batch, AdjustmentRecord), BatchStoreError>;

    /// Adjustment history of one batch, in insertion order.
    fn adjustments_for_batch(
        &self,
        tenant_id: TenantId,
        batch_id: BatchId,
    ) -> Result<Vec<AdjustmentRecord>, BatchStoreError>;

    /// Replace the non-key fields of a batch (replenish, deactivate, reprice)
    /// under a version guard. The stored version becomes current + 1.
    fn update(&self, batch: &Batch, expected_version: ExpectedVersion) -> Result<Batch, BatchStoreError>;
}

impl<S> BatchStore for Arc<S>
where
    S: BatchStore + ?Sized,
{
    fn get(&self, tenant_id: TenantId, batch_id: BatchId) -> Result<Option<Batch>, BatchStoreError> {
        (**self).get(tenant_id, batch_id)
    }

    fn find_by_product(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
        filter: &InventoryFilter,
        today: NaiveDate,
    ) -> Result<Vec<Batch>, BatchStoreError> {
        (**self).find_by_product(tenant_id, product_id, filter, today)
    }

    fn find_candidates(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
        mode: AllocationMode,
        today: NaiveDate,
        limit: usize,
    ) -> Result<Vec<Batch>, BatchStoreError> {
        (**self).find_candidates(tenant_id, product_id, mode, today, limit)
    }

    fn find_by_number(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
        batch_number: &BatchNumber,
    ) -> Result<Option<Batch>, BatchStoreError> {
        (**self).find_by_number(tenant_id, product_id, batch_number)
    }

    fn list_tenant(
        &self,
        tenant_id: TenantId,
        filter: &InventoryFilter,
        today: NaiveDate,
    ) -> Result<Vec<Batch>, BatchStoreError> {
        (**self).list_tenant(tenant_id, filter, today)
    }

    fn create(&self, batch: Batch) -> Result<Batch, BatchStoreError> {
        (**self).create(batch)
    }

    fn apply_delta(
        &self,
        tenant_id: TenantId,
        batch_id: BatchId,
        delta: StockDelta,
        expected_version: ExpectedVersion,
        at: DateTime<Utc>,
    ) -> Result<Batch, BatchStoreError> {
        (**self).apply_delta(tenant_id, batch_id, delta, expected_version, at)
    }

    fn apply_adjustment(
        &self,
        record: AdjustmentRecord,
        expected_version: ExpectedVersion,
    ) -> Result<(Batch, AdjustmentRecord), BatchStoreError> {
        (**self).apply_adjustment(record, expected_version)
    }

    fn adjustments_for_batch(
        &self,
        tenant_id: TenantId,
        batch_id: BatchId,
    ) -> Result<Vec<AdjustmentRecord>, BatchStoreError> {
        (**self).adjustments_for_batch(tenant_id, batch_id)
    }

    fn update(&self, batch: &Batch, expected_version: ExpectedVersion) -> Result<Batch, BatchStoreError> {
        (**self).update(batch, expected_version)
    }
}
