use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, NaiveDate, Utc};

use stockledger_core::{DomainError, ExpectedVersion, TenantId};
use stockledger_inventory::{
    AdjustmentRecord, AllocationMode, Batch, BatchId, BatchNumber, InventoryFilter, ProductId,
    StockDelta, sort_candidates,
};

use super::r#trait::{BatchStore, BatchStoreError};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct NumberKey {
    tenant_id: TenantId,
    product_id: ProductId,
    batch_number: BatchNumber,
}

#[derive(Debug, Default)]
struct State {
    batches: HashMap<(TenantId, BatchId), Batch>,
    numbers: HashMap<NumberKey, BatchId>,
    adjustments: HashMap<(TenantId, BatchId), Vec<AdjustmentRecord>>,
}

/// In-memory batch store.
///
/// Intended for tests/dev. A single lock serializes writers, which gives the
/// same per-batch linearization the Postgres guarded update provides.
#[derive(Debug, Default)]
pub struct InMemoryBatchStore {
    state: RwLock<State>,
}

impl InMemoryBatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>, BatchStoreError> {
        self.state
            .read()
            .map_err(|_| BatchStoreError::Backend("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, BatchStoreError> {
        self.state
            .write()
            .map_err(|_| BatchStoreError::Backend("lock poisoned".to_string()))
    }

    fn sorted(mut batches: Vec<Batch>) -> Vec<Batch> {
        batches.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        batches
    }
}

fn check_version(expected: ExpectedVersion, batch: &Batch) -> Result<(), BatchStoreError> {
    expected
        .check(batch.version)
        .map_err(|e| BatchStoreError::Concurrency(format!("batch {}: {e}", batch.id)))
}

impl BatchStore for InMemoryBatchStore {
    fn get(&self, tenant_id: TenantId, batch_id: BatchId) -> Result<Option<Batch>, BatchStoreError> {
        Ok(self.read()?.batches.get(&(tenant_id, batch_id)).cloned())
    }

    fn find_by_product(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
        filter: &InventoryFilter,
        today: NaiveDate,
    ) -> Result<Vec<Batch>, BatchStoreError> {
        let state = self.read()?;
        let batches = state
            .batches
            .values()
            .filter(|b| b.tenant_id == tenant_id && b.product_id == product_id)
            .filter(|b| filter.matches(b, today))
            .cloned()
            .collect();
        Ok(Self::sorted(batches))
    }

    fn find_candidates(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
        mode: AllocationMode,
        today: NaiveDate,
        limit: usize,
    ) -> Result<Vec<Batch>, BatchStoreError> {
        let state = self.read()?;
        let mut candidates: Vec<Batch> = state
            .batches
            .values()
            .filter(|b| b.tenant_id == tenant_id && b.product_id == product_id)
            .filter(|b| b.is_sellable(today))
            .cloned()
            .collect();
        sort_candidates(&mut candidates, mode);
        candidates.truncate(limit);
        Ok(candidates)
    }

    fn find_by_number(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
        batch_number: &BatchNumber,
    ) -> Result<Option<Batch>, BatchStoreError> {
        let state = self.read()?;
        let key = NumberKey {
            tenant_id,
            product_id,
            batch_number: batch_number.clone(),
        };
        Ok(state
            .numbers
            .get(&key)
            .and_then(|id| state.batches.get(&(tenant_id, *id)))
            .cloned())
    }

    fn list_tenant(
        &self,
        tenant_id: TenantId,
        filter: &InventoryFilter,
        today: NaiveDate,
    ) -> Result<Vec<Batch>, BatchStoreError> {
        let state = self.read()?;
        let batches = state
            .batches
            .values()
            .filter(|b| b.tenant_id == tenant_id && filter.matches(b, today))
            .cloned()
            .collect();
        Ok(Self::sorted(batches))
    }

    fn create(&self, batch: Batch) -> Result<Batch, BatchStoreError> {
        batch.check_invariants().map_err(BatchStoreError::Rejected)?;

        let mut state = self.write()?;
        let key = NumberKey {
            tenant_id: batch.tenant_id,
            product_id: batch.product_id,
            batch_number: batch.batch_number.clone(),
        };
        if state.numbers.contains_key(&key) {
            return Err(BatchStoreError::Duplicate(format!(
                "batch number '{}' already exists for product {}",
                batch.batch_number, batch.product_id
            )));
        }
        if state.batches.contains_key(&(batch.tenant_id, batch.id)) {
            return Err(BatchStoreError::Duplicate(format!("batch id {} already exists", batch.id)));
        }

        state.numbers.insert(key, batch.id);
        state.batches.insert((batch.tenant_id, batch.id), batch.clone());
        Ok(batch)
    }

    fn apply_delta(
        &self,
        tenant_id: TenantId,
        batch_id: BatchId,
        delta: StockDelta,
        expected_version: ExpectedVersion,
        at: DateTime<Utc>,
    ) -> Result<Batch, BatchStoreError> {
        let mut state = self.write()?;
        let batch = state
            .batches
            .get_mut(&(tenant_id, batch_id))
            .ok_or(BatchStoreError::NotFound(batch_id))?;

        check_version(expected_version, batch)?;
        batch.apply_delta(delta, at).map_err(BatchStoreError::Rejected)?;
        Ok(batch.clone())
    }

    fn apply_adjustment(
        &self,
        mut record: AdjustmentRecord,
        expected_version: ExpectedVersion,
    ) -> Result<(Batch, AdjustmentRecord), BatchStoreError> {
        let mut state = self.write()?;
        let key = (record.tenant_id, record.batch_id);
        let batch = state
            .batches
            .get_mut(&key)
            .ok_or(BatchStoreError::NotFound(record.batch_id))?;

        if batch.product_id != record.product_id {
            return Err(BatchStoreError::Rejected(DomainError::invariant(
                "adjustment product does not match batch",
            )));
        }
        check_version(expected_version, batch)?;
        batch
            .apply_delta(StockDelta::on_hand(record.delta), record.occurred_at)
            .map_err(BatchStoreError::Rejected)?;

        record.on_hand_after = batch.on_hand;
        let updated = batch.clone();
        state.adjustments.entry(key).or_default().push(record.clone());
        Ok((updated, record))
    }

    fn adjustments_for_batch(
        &self,
        tenant_id: TenantId,
        batch_id: BatchId,
    ) -> Result<Vec<AdjustmentRecord>, BatchStoreError> {
        Ok(self
            .read()?
            .adjustments
            .get(&(tenant_id, batch_id))
            .cloned()
            .unwrap_or_default())
    }

    fn update(&self, batch: &Batch, expected_version: ExpectedVersion) -> Result<Batch, BatchStoreError> {
        batch.check_invariants().map_err(BatchStoreError::Rejected)?;

        let mut state = self.write()?;
        let current = state
            .batches
            .get_mut(&(batch.tenant_id, batch.id))
            .ok_or(BatchStoreError::NotFound(batch.id))?;

        if current.product_id != batch.product_id || current.batch_number != batch.batch_number {
            return Err(BatchStoreError::Rejected(DomainError::invariant(
                "batch product and number cannot change",
            )));
        }
        check_version(expected_version, current)?;

        let version = current.version + 1;
        *current = Batch {
            version,
            created_at: current.created_at,
            ..batch.clone()
        };
        Ok(current.clone())
    }
}
