//! `InventoryLedger`: the operation surface of the batch ledger.
//!
//! Every mutating call collects the movements it committed and publishes
//! them on the event bus once it returns, rollbacks included.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use tracing::{debug, info, instrument};

use stockledger_core::{DomainResult, ExpectedVersion, TenantId, UserId};
use stockledger_events::{EventBus, EventEnvelope};
use stockledger_inventory::{
    AdjustmentRecord, Allocation, Batch, BatchId, BatchPricing, InventoryFilter, InventorySummary,
    MovementKind, ProductId, StockDelta, StockMovement,
};
use stockledger_purchasing::{IntakeReversal, PurchaseIntake};
use stockledger_sales::{SaleLine, SalesDocument, SalesDocumentId, SalesRequest};

use crate::batch_store::{BatchStore, BatchStoreError};
use crate::directory::Directory;
use crate::sales_store::SalesDocumentStore;

use super::adjustment::{AdjustmentService, BatchAdjustment};
use super::allocation::{AllocationEngine, OperationContext};
use super::config::LedgerConfig;
use super::error::LedgerError;
use super::feed::{MovementLog, publish_all};
use super::purchase_intake::PurchaseIntakeCoordinator;
use super::sales_consumption::SalesConsumptionCoordinator;

pub struct InventoryLedger<S, D, Q, B> {
    sales: SalesConsumptionCoordinator<S, D, Q>,
    intake: PurchaseIntakeCoordinator<S>,
    adjustments: AdjustmentService<S>,
    bus: B,
}

impl<S, D, Q, B> InventoryLedger<S, D, Q, B>
where
    S: BatchStore + Clone,
    D: Directory,
    Q: SalesDocumentStore,
    B: EventBus<EventEnvelope<StockMovement>>,
{
    pub fn new(store: S, directory: D, documents: Q, bus: B, config: LedgerConfig) -> Self {
        let engine = AllocationEngine::new(store.clone(), config.clone());
        Self {
            sales: SalesConsumptionCoordinator::new(engine, directory, documents),
            intake: PurchaseIntakeCoordinator::new(store.clone(), config.clone()),
            adjustments: AdjustmentService::new(store, config),
            bus,
        }
    }

    pub fn config(&self) -> &LedgerConfig {
        self.sales.engine().config()
    }

    pub fn store(&self) -> &S {
        self.sales.engine().store()
    }

    pub fn documents(&self) -> &Q {
        self.sales.documents()
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    fn publish<T>(&self, log: MovementLog, result: Result<T, LedgerError>) -> Result<T, LedgerError> {
        publish_all(&self.bus, log);
        result
    }

    // Purchasing

    pub fn create_or_merge_batch(&self, tenant_id: TenantId, intake: &PurchaseIntake) -> Result<Batch, LedgerError> {
        same_tenant(tenant_id, intake.tenant_id)?;
        let mut log = MovementLog::new();
        let result = self.intake.create_or_merge(intake, &mut log);
        self.publish(log, result)
    }

    pub fn reverse_intake(&self, tenant_id: TenantId, reversal: &IntakeReversal) -> Result<Batch, LedgerError> {
        same_tenant(tenant_id, reversal.tenant_id)?;
        let mut log = MovementLog::new();
        let result = self.intake.reverse_intake(reversal, &mut log);
        self.publish(log, result)
    }

    // Adjustments

    pub fn adjust_batch(
        &self,
        tenant_id: TenantId,
        batch_id: BatchId,
        delta: i64,
        reason: &str,
        actor: UserId,
        at: DateTime<Utc>,
    ) -> Result<AdjustmentRecord, LedgerError> {
        let cmd = BatchAdjustment {
            tenant_id,
            batch_id,
            delta,
            reason: reason.to_string(),
            actor,
            occurred_at: at,
        };
        let mut log = MovementLog::new();
        let result = self.adjustments.adjust(&cmd, &mut log);
        self.publish(log, result)
    }

    pub fn adjustments_for_batch(
        &self,
        tenant_id: TenantId,
        batch_id: BatchId,
    ) -> Result<Vec<AdjustmentRecord>, LedgerError> {
        self.adjustments.history(tenant_id, batch_id)
    }

    // Batch maintenance

    /// Take a batch out of circulation. It stays readable for history.
    #[instrument(skip(self), fields(tenant_id = %tenant_id.as_uuid(), batch_id = %batch_id), err)]
    pub fn deactivate_batch(
        &self,
        tenant_id: TenantId,
        batch_id: BatchId,
        at: DateTime<Utc>,
    ) -> Result<Batch, LedgerError> {
        let mut log = MovementLog::new();
        let result = self.rewrite(tenant_id, batch_id, at, MovementKind::Deactivated, &mut log, |batch| {
            batch.deactivate(at)
        });
        self.publish(log, result)
    }

    #[instrument(skip(self, pricing), fields(tenant_id = %tenant_id.as_uuid(), batch_id = %batch_id), err)]
    pub fn update_batch_pricing(
        &self,
        tenant_id: TenantId,
        batch_id: BatchId,
        pricing: BatchPricing,
        at: DateTime<Utc>,
    ) -> Result<Batch, LedgerError> {
        let mut log = MovementLog::new();
        let result = self.rewrite(tenant_id, batch_id, at, MovementKind::Repriced, &mut log, |batch| {
            batch.reprice(pricing, at)
        });
        self.publish(log, result)
    }

    /// Read, change and write back a batch under its version, re-reading on
    /// a lost race.
    fn rewrite(
        &self,
        tenant_id: TenantId,
        batch_id: BatchId,
        at: DateTime<Utc>,
        kind: MovementKind,
        log: &mut MovementLog,
        change: impl Fn(&mut Batch) -> DomainResult<()>,
    ) -> Result<Batch, LedgerError> {
        let mut retries = 0;
        loop {
            let mut batch = self
                .store()
                .get(tenant_id, batch_id)?
                .ok_or(LedgerError::BatchNotFound(batch_id))?;
            let expected = ExpectedVersion::Exact(batch.version);
            change(&mut batch)?;

            match self.store().update(&batch, expected) {
                Ok(stored) => {
                    log.record(kind, &stored, StockDelta::default(), None, at);
                    info!(?kind, version = stored.version, "batch updated");
                    return Ok(stored);
                }
                Err(BatchStoreError::Concurrency(_)) if retries < self.config().max_retries_per_candidate => {
                    retries += 1;
                    debug!(attempt = retries, "batch changed before update, retrying");
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    // Queries

    /// Stock position of one product as of `at`, over the batches `filter`
    /// admits.
    pub fn get_available_inventory(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
        filter: &InventoryFilter,
        at: DateTime<Utc>,
    ) -> Result<InventorySummary, LedgerError> {
        let today = at.date_naive();
        let batches = self.store().find_by_product(tenant_id, product_id, filter, today)?;
        Ok(InventorySummary::from_batches(product_id, batches, today))
    }

    /// Active batches with stock that expire before `before`, including ones
    /// already past their date.
    pub fn find_expiring(
        &self,
        tenant_id: TenantId,
        before: NaiveDate,
        at: DateTime<Utc>,
    ) -> Result<Vec<Batch>, LedgerError> {
        let filter = InventoryFilter::default().expiring_before(before).including_expired();
        Ok(self.store().list_tenant(tenant_id, &filter, at.date_naive())?)
    }

    /// Products whose sellable quantity is below `threshold`.
    pub fn low_stock(
        &self,
        tenant_id: TenantId,
        threshold: i64,
        at: DateTime<Utc>,
    ) -> Result<Vec<InventorySummary>, LedgerError> {
        let today = at.date_naive();
        let mut by_product: BTreeMap<ProductId, Vec<Batch>> = BTreeMap::new();
        for batch in self.store().list_tenant(tenant_id, &InventoryFilter::all(), today)? {
            by_product.entry(batch.product_id).or_default().push(batch);
        }
        Ok(by_product
            .into_iter()
            .map(|(product_id, batches)| InventorySummary::from_batches(product_id, batches, today))
            .filter(|summary| summary.is_below(threshold))
            .collect())
    }

    // Standing reservations

    pub fn reserve(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
        quantity: i64,
        at: DateTime<Utc>,
    ) -> Result<Vec<Allocation>, LedgerError> {
        let ctx = OperationContext::new(tenant_id, at);
        let mode = self.config().allocation_mode;
        let mut log = MovementLog::new();
        let result = self
            .sales
            .engine()
            .select_and_reserve(&ctx, product_id, quantity, mode, &mut log);
        self.publish(log, result)
    }

    pub fn release(
        &self,
        tenant_id: TenantId,
        allocations: &[Allocation],
        at: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let ctx = OperationContext::new(tenant_id, at);
        let mut log = MovementLog::new();
        let result = self.sales.engine().release(&ctx, allocations, &mut log);
        self.publish(log, result)
    }

    pub fn consume(
        &self,
        tenant_id: TenantId,
        allocations: &[Allocation],
        at: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let ctx = OperationContext::new(tenant_id, at);
        let mut log = MovementLog::new();
        let result = self.sales.engine().consume(&ctx, allocations, &mut log);
        self.publish(log, result)
    }

    // Sales

    pub fn allocate_for_sale(&self, tenant_id: TenantId, request: &SalesRequest) -> Result<SalesDocument, LedgerError> {
        same_tenant(tenant_id, request.tenant_id)?;
        let mut log = MovementLog::new();
        let result = self.sales.allocate_for_sale(request, &mut log);
        self.publish(log, result)
    }

    pub fn update_sale_allocation(
        &self,
        tenant_id: TenantId,
        document_id: SalesDocumentId,
        lines: Vec<SaleLine>,
        at: DateTime<Utc>,
    ) -> Result<SalesDocument, LedgerError> {
        let mut log = MovementLog::new();
        let result = self
            .sales
            .update_sale_allocation(tenant_id, document_id, lines, at, &mut log);
        self.publish(log, result)
    }

    pub fn release_sale_allocation(
        &self,
        tenant_id: TenantId,
        document_id: SalesDocumentId,
        at: DateTime<Utc>,
    ) -> Result<SalesDocument, LedgerError> {
        let mut log = MovementLog::new();
        let result = self
            .sales
            .release_sale_allocation(tenant_id, document_id, at, &mut log);
        self.publish(log, result)
    }
}

fn same_tenant(tenant_id: TenantId, command_tenant: TenantId) -> Result<(), LedgerError> {
    if tenant_id != command_tenant {
        return Err(LedgerError::Validation(
            "command belongs to a different tenant".to_string(),
        ));
    }
    Ok(())
}
