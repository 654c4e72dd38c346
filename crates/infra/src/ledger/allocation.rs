//! Allocation engine: batch selection and the reserve / consume / release
//! primitives every stock flow goes through.
//!
//! ## Concurrency
//!
//! The engine holds no locks. Candidate reservations are written with
//! `ExpectedVersion::Exact` so a candidate that changed since it was read is
//! detected, re-read and retried a bounded number of times. Follow-up writes
//! against stock the caller already holds (consume, release, rollbacks) use
//! `ExpectedVersion::Any`: the store still re-checks the quantity bounds
//! atomically, so they cannot overdraw.
//!
//! ## Failure atomicity
//!
//! Every public operation either completes or undoes its own partial writes
//! before returning the error.

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, instrument, warn};

use stockledger_core::{ExpectedVersion, TenantId};
use stockledger_inventory::{
    Allocation, AllocationMode, Batch, BatchId, MovementKind, MovementReference, ProductId,
    StockDelta, coalesce, total_quantity,
};

use crate::batch_store::{BatchStore, BatchStoreError};

use super::config::LedgerConfig;
use super::error::LedgerError;
use super::feed::MovementLog;

/// Who is acting, when, and on behalf of which document.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct OperationContext {
    pub tenant_id: TenantId,
    pub at: DateTime<Utc>,
    pub reference: Option<MovementReference>,
}

impl OperationContext {
    pub fn new(tenant_id: TenantId, at: DateTime<Utc>) -> Self {
        Self {
            tenant_id,
            at,
            reference: None,
        }
    }

    pub fn with_reference(mut self, reference: MovementReference) -> Self {
        self.reference = Some(reference);
        self
    }
}

enum CandidateError {
    /// Lost the race on this candidate more often than allowed.
    Exhausted,
    Fatal(LedgerError),
}

pub struct AllocationEngine<S> {
    store: S,
    config: LedgerConfig,
}

impl<S> AllocationEngine<S>
where
    S: BatchStore,
{
    pub fn new(store: S, config: LedgerConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Reserve `quantity` units of a product across its sellable batches in
    /// `mode` order.
    ///
    /// All-or-nothing: if the quantity cannot be fully reserved, every
    /// reservation taken so far is released and the call fails with
    /// `InsufficientStock` (or `ConcurrencyConflict` when a candidate kept
    /// changing under us or the candidate bound was hit).
    #[instrument(
        skip(self, log),
        fields(tenant_id = %ctx.tenant_id.as_uuid(), product_id = %product_id, quantity),
        err
    )]
    pub fn select_and_reserve(
        &self,
        ctx: &OperationContext,
        product_id: ProductId,
        quantity: i64,
        mode: AllocationMode,
        log: &mut MovementLog,
    ) -> Result<Vec<Allocation>, LedgerError> {
        if quantity <= 0 {
            return Err(LedgerError::Validation(format!(
                "requested quantity must be positive, got {quantity}"
            )));
        }

        let today = ctx.at.date_naive();
        let limit = self.config.max_candidates_per_product;
        let mut candidates =
            self.store
                .find_candidates(ctx.tenant_id, product_id, mode, today, limit.saturating_add(1))?;
        let truncated = candidates.len() > limit;
        candidates.truncate(limit);

        let mut taken: Vec<Allocation> = Vec::new();
        let mut remaining = quantity;
        let mut contended = false;

        for candidate in candidates {
            if remaining == 0 {
                break;
            }
            match self.reserve_candidate(ctx, candidate, remaining, log) {
                Ok(Some(allocation)) => {
                    remaining -= allocation.quantity;
                    taken.push(allocation);
                }
                Ok(None) => {}
                Err(CandidateError::Exhausted) => contended = true,
                Err(CandidateError::Fatal(err)) => {
                    self.rollback_reservations(ctx, &taken, log);
                    return Err(err);
                }
            }
        }

        if remaining > 0 {
            let reserved = quantity - remaining;
            warn!(requested = quantity, reserved, contended, truncated, "allocation short, rolling back");
            self.rollback_reservations(ctx, &taken, log);

            if contended {
                return Err(LedgerError::ConcurrencyConflict(format!(
                    "product {product_id}: candidate batches kept changing"
                )));
            }
            if truncated {
                return Err(LedgerError::ConcurrencyConflict(format!(
                    "product {product_id}: more than {limit} candidate batches needed"
                )));
            }
            return Err(LedgerError::InsufficientStock {
                product_id,
                requested: quantity,
                available: reserved,
            });
        }

        info!(batches = taken.len(), "stock reserved");
        Ok(taken)
    }

    /// Reserve up to `wanted` units from one candidate, re-reading it after
    /// each lost race. `Ok(None)` means the candidate has nothing left to give.
    fn reserve_candidate(
        &self,
        ctx: &OperationContext,
        mut batch: Batch,
        wanted: i64,
        log: &mut MovementLog,
    ) -> Result<Option<Allocation>, CandidateError> {
        let today = ctx.at.date_naive();
        let mut retries = 0;

        loop {
            if !batch.is_sellable(today) {
                return Ok(None);
            }
            let n = wanted.min(batch.available());
            let delta = StockDelta::reserve(n);

            match self.store.apply_delta(
                ctx.tenant_id,
                batch.id,
                delta,
                ExpectedVersion::Exact(batch.version),
                ctx.at,
            ) {
                Ok(after) => {
                    log.record(MovementKind::Reserved, &after, delta, ctx.reference, ctx.at);
                    return Ok(Some(Allocation::new(after.id, after.product_id, n)));
                }
                Err(BatchStoreError::Concurrency(_)) | Err(BatchStoreError::Rejected(_)) => {
                    retries += 1;
                    if retries > self.config.max_retries_per_candidate {
                        warn!(batch_id = %batch.id, retries, "giving up on contended batch");
                        return Err(CandidateError::Exhausted);
                    }
                    debug!(batch_id = %batch.id, attempt = retries, "batch changed since read, retrying");
                    batch = match self.store.get(ctx.tenant_id, batch.id) {
                        Ok(Some(b)) => b,
                        Ok(None) => return Ok(None),
                        Err(e) => return Err(CandidateError::Fatal(e.into())),
                    };
                }
                Err(e) => return Err(CandidateError::Fatal(e.into())),
            }
        }
    }

    /// Reserve from one specific batch (a sale line pinned to a batch).
    #[instrument(
        skip(self, log),
        fields(tenant_id = %ctx.tenant_id.as_uuid(), product_id = %product_id, batch_id = %batch_id, quantity),
        err
    )]
    pub fn reserve_from_batch(
        &self,
        ctx: &OperationContext,
        product_id: ProductId,
        batch_id: BatchId,
        quantity: i64,
        log: &mut MovementLog,
    ) -> Result<Allocation, LedgerError> {
        if quantity <= 0 {
            return Err(LedgerError::Validation(format!(
                "requested quantity must be positive, got {quantity}"
            )));
        }

        let today = ctx.at.date_naive();
        let mut batch = self.load(ctx.tenant_id, batch_id)?;
        if batch.product_id != product_id {
            return Err(LedgerError::Validation(format!(
                "batch {batch_id} does not hold product {product_id}"
            )));
        }

        let mut retries = 0;
        loop {
            if !batch.is_active {
                return Err(LedgerError::Validation(format!("batch {batch_id} is inactive")));
            }
            if batch.is_expired(today) {
                return Err(LedgerError::Validation(format!("batch {batch_id} has expired")));
            }
            if batch.available() < quantity {
                return Err(LedgerError::InsufficientStock {
                    product_id,
                    requested: quantity,
                    available: batch.available().max(0),
                });
            }

            let delta = StockDelta::reserve(quantity);
            match self.store.apply_delta(
                ctx.tenant_id,
                batch_id,
                delta,
                ExpectedVersion::Exact(batch.version),
                ctx.at,
            ) {
                Ok(after) => {
                    log.record(MovementKind::Reserved, &after, delta, ctx.reference, ctx.at);
                    return Ok(Allocation::new(batch_id, product_id, quantity));
                }
                Err(BatchStoreError::Concurrency(_)) | Err(BatchStoreError::Rejected(_)) => {
                    retries += 1;
                    if retries > self.config.max_retries_per_candidate {
                        return Err(LedgerError::ConcurrencyConflict(format!(
                            "batch {batch_id} kept changing"
                        )));
                    }
                    debug!(attempt = retries, "pinned batch changed since read, retrying");
                    batch = self.load(ctx.tenant_id, batch_id)?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Turn held reservations into permanent removals.
    #[instrument(
        skip(self, allocations, log),
        fields(tenant_id = %ctx.tenant_id.as_uuid(), quantity = total_quantity(allocations)),
        err
    )]
    pub fn consume(
        &self,
        ctx: &OperationContext,
        allocations: &[Allocation],
        log: &mut MovementLog,
    ) -> Result<(), LedgerError> {
        let allocations = self.check_reserved(ctx.tenant_id, allocations)?;

        let mut done: Vec<Allocation> = Vec::with_capacity(allocations.len());
        for a in &allocations {
            match self.apply(ctx, a.batch_id, StockDelta::consume(a.quantity), MovementKind::Consumed, log) {
                Ok(_) => done.push(*a),
                Err(err) => {
                    warn!(batch_id = %a.batch_id, "consumption failed, restoring reservations");
                    for d in done.iter().rev() {
                        self.compensate(ctx, d.batch_id, StockDelta::unconsume(d.quantity), MovementKind::ConsumptionReversed, log);
                    }
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Drop held reservations.
    #[instrument(
        skip(self, allocations, log),
        fields(tenant_id = %ctx.tenant_id.as_uuid(), quantity = total_quantity(allocations)),
        err
    )]
    pub fn release(
        &self,
        ctx: &OperationContext,
        allocations: &[Allocation],
        log: &mut MovementLog,
    ) -> Result<(), LedgerError> {
        let allocations = self.check_reserved(ctx.tenant_id, allocations)?;

        let mut done: Vec<Allocation> = Vec::with_capacity(allocations.len());
        for a in &allocations {
            match self.apply(ctx, a.batch_id, StockDelta::release(a.quantity), MovementKind::Released, log) {
                Ok(_) => done.push(*a),
                Err(err) => {
                    warn!(batch_id = %a.batch_id, "release failed, re-taking released stock");
                    for d in done.iter().rev() {
                        self.compensate(ctx, d.batch_id, StockDelta::reserve(d.quantity), MovementKind::Reserved, log);
                    }
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Give consumed stock back: re-hold it, then release the hold.
    /// Net effect per allocation is `on_hand += n`.
    #[instrument(
        skip(self, allocations, log),
        fields(tenant_id = %ctx.tenant_id.as_uuid(), quantity = total_quantity(allocations)),
        err
    )]
    pub fn reverse_consumption(
        &self,
        ctx: &OperationContext,
        allocations: &[Allocation],
        log: &mut MovementLog,
    ) -> Result<(), LedgerError> {
        let allocations = coalesce(allocations);
        for a in &allocations {
            if a.quantity < 0 {
                return Err(LedgerError::Validation(format!(
                    "cannot reverse a negative quantity on batch {}",
                    a.batch_id
                )));
            }
            let batch = self.load(ctx.tenant_id, a.batch_id)?;
            if batch.product_id != a.product_id {
                return Err(LedgerError::Validation(format!(
                    "batch {} does not hold product {}",
                    a.batch_id, a.product_id
                )));
            }
        }

        let mut done: Vec<Allocation> = Vec::with_capacity(allocations.len());
        for a in &allocations {
            if let Err(err) = self.apply(
                ctx,
                a.batch_id,
                StockDelta::unconsume(a.quantity),
                MovementKind::ConsumptionReversed,
                log,
            ) {
                warn!(batch_id = %a.batch_id, "returning stock failed, consuming it again");
                self.reconsume(ctx, &done, log);
                return Err(err);
            }
            if let Err(err) = self.apply(ctx, a.batch_id, StockDelta::release(a.quantity), MovementKind::Released, log) {
                warn!(batch_id = %a.batch_id, "returning stock failed, consuming it again");
                // The re-held units are still reserved here, so consuming them cannot overdraw.
                self.compensate(ctx, a.batch_id, StockDelta::consume(a.quantity), MovementKind::Consumed, log);
                self.reconsume(ctx, &done, log);
                return Err(err);
            }
            done.push(*a);
        }
        Ok(())
    }

    /// Take back stock a failed reversal already returned, newest first.
    fn reconsume(&self, ctx: &OperationContext, returned: &[Allocation], log: &mut MovementLog) {
        for d in returned.iter().rev() {
            match self.apply(ctx, d.batch_id, StockDelta::reserve(d.quantity), MovementKind::Reserved, log) {
                Ok(_) => self.compensate(ctx, d.batch_id, StockDelta::consume(d.quantity), MovementKind::Consumed, log),
                Err(err) => error!(batch_id = %d.batch_id, error = %err, "returned stock was taken before it could be consumed again"),
            }
        }
    }

    /// Release reservations taken by a failed operation. Best effort: a
    /// failure here is logged, the original error is what the caller sees.
    pub fn rollback_reservations(&self, ctx: &OperationContext, allocations: &[Allocation], log: &mut MovementLog) {
        for a in allocations.iter().rev() {
            self.compensate(ctx, a.batch_id, StockDelta::release(a.quantity), MovementKind::Released, log);
        }
    }

    fn compensate(
        &self,
        ctx: &OperationContext,
        batch_id: BatchId,
        delta: StockDelta,
        kind: MovementKind,
        log: &mut MovementLog,
    ) {
        if let Err(err) = self.apply(ctx, batch_id, delta, kind, log) {
            error!(batch_id = %batch_id, ?delta, error = %err, "compensating write failed");
        }
    }

    /// Guarded write against stock the caller already accounts for.
    fn apply(
        &self,
        ctx: &OperationContext,
        batch_id: BatchId,
        delta: StockDelta,
        kind: MovementKind,
        log: &mut MovementLog,
    ) -> Result<Batch, LedgerError> {
        let mut retries = 0;
        loop {
            match self
                .store
                .apply_delta(ctx.tenant_id, batch_id, delta, ExpectedVersion::Any, ctx.at)
            {
                Ok(after) => {
                    log.record(kind, &after, delta, ctx.reference, ctx.at);
                    return Ok(after);
                }
                Err(BatchStoreError::Concurrency(msg)) => {
                    retries += 1;
                    if retries > self.config.max_retries_per_candidate {
                        return Err(LedgerError::ConcurrencyConflict(msg));
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn load(&self, tenant_id: TenantId, batch_id: BatchId) -> Result<Batch, LedgerError> {
        self.store
            .get(tenant_id, batch_id)?
            .ok_or(LedgerError::BatchNotFound(batch_id))
    }

    /// Coalesce `allocations` per batch and verify each batch holds at least
    /// that much in reserve.
    fn check_reserved(&self, tenant_id: TenantId, allocations: &[Allocation]) -> Result<Vec<Allocation>, LedgerError> {
        if let Some(bad) = allocations.iter().find(|a| a.quantity <= 0) {
            return Err(LedgerError::Validation(format!(
                "allocation quantity must be positive (batch {})",
                bad.batch_id
            )));
        }
        let allocations = coalesce(allocations);

        for a in &allocations {
            let batch = self.load(tenant_id, a.batch_id)?;
            if batch.product_id != a.product_id {
                return Err(LedgerError::Validation(format!(
                    "batch {} does not hold product {}",
                    a.batch_id, a.product_id
                )));
            }
            if batch.reserved < a.quantity {
                return Err(LedgerError::InvariantViolation(format!(
                    "batch {} holds {} reserved units, {} requested",
                    a.batch_id, batch.reserved, a.quantity
                )));
            }
        }
        debug!(batches = allocations.len(), "reservations verified");
        Ok(allocations)
    }
}
