//! Purchase intake: receiving goods into batches and sending them back.

use tracing::{debug, info, instrument};

use stockledger_core::{DomainError, EntityId, ExpectedVersion};
use stockledger_inventory::{Batch, BatchId, MovementKind, MovementReference, StockDelta};
use stockledger_purchasing::{IntakeDecision, IntakeReversal, PurchaseIntake, plan_reversal};

use crate::batch_store::{BatchStore, BatchStoreError};

use super::config::LedgerConfig;
use super::error::LedgerError;
use super::feed::MovementLog;

pub struct PurchaseIntakeCoordinator<S> {
    store: S,
    config: LedgerConfig,
}

impl<S> PurchaseIntakeCoordinator<S>
where
    S: BatchStore,
{
    pub fn new(store: S, config: LedgerConfig) -> Self {
        Self { store, config }
    }

    /// Land an intake: a new batch for an unseen batch number, otherwise a
    /// merge into the existing one with a recomputed average cost.
    ///
    /// Racing intakes for the same number are resolved by re-reading: the
    /// loser of a concurrent create merges into the winner's batch.
    #[instrument(
        skip(self, intake, log),
        fields(
            tenant_id = %intake.tenant_id.as_uuid(),
            product_id = %intake.product_id,
            batch_number = %intake.batch_number,
            quantity = intake.quantity
        ),
        err
    )]
    pub fn create_or_merge(&self, intake: &PurchaseIntake, log: &mut MovementLog) -> Result<Batch, LedgerError> {
        intake.validate()?;
        let reference = intake.purchase_id.map(MovementReference::PurchaseDocument);

        let mut retries = 0;
        loop {
            let existing = self
                .store
                .find_by_number(intake.tenant_id, intake.product_id, &intake.batch_number)?;

            match self.land(intake, existing, reference, log) {
                Err(err) if err.is_retryable() && retries < self.config.max_retries_per_candidate => {
                    retries += 1;
                    debug!(attempt = retries, error = %err, "intake raced another writer, retrying");
                }
                result => return result,
            }
        }
    }

    fn land(
        &self,
        intake: &PurchaseIntake,
        existing: Option<Batch>,
        reference: Option<MovementReference>,
        log: &mut MovementLog,
    ) -> Result<Batch, LedgerError> {
        let at = intake.occurred_at;

        match intake.decide(existing.as_ref())? {
            IntakeDecision::Create(new) => {
                let batch = Batch::create(BatchId::new(EntityId::new()), new)?;
                let created = self.store.create(batch)?;
                log.record(
                    MovementKind::BatchCreated,
                    &created,
                    StockDelta::on_hand(created.on_hand),
                    reference,
                    at,
                );
                info!(batch_id = %created.id, on_hand = created.on_hand, "batch created");
                Ok(created)
            }
            IntakeDecision::Merge {
                expected_version,
                quantity,
                unit_cost,
                average_cost,
                pricing,
                reactivates,
                ..
            } => {
                let mut batch = existing
                    .ok_or_else(|| DomainError::invariant("merge decided without an existing batch"))?;
                batch.replenish(quantity, unit_cost, average_cost, at)?;
                if let Some(pricing) = pricing {
                    batch.reprice(pricing, at)?;
                }

                let stored = self.store.update(&batch, expected_version)?;
                log.record(
                    MovementKind::BatchReplenished,
                    &stored,
                    StockDelta::on_hand(quantity),
                    reference,
                    at,
                );
                info!(
                    batch_id = %stored.id,
                    on_hand = stored.on_hand,
                    average_cost = stored.average_cost,
                    reactivated = reactivates,
                    "intake merged into batch"
                );
                Ok(stored)
            }
        }
    }

    /// Take back `reversal.quantity` units of a previous intake. Only
    /// unreserved stock can leave; average cost stays as it is.
    #[instrument(
        skip(self, reversal, log),
        fields(
            tenant_id = %reversal.tenant_id.as_uuid(),
            batch_id = %reversal.batch_id,
            quantity = reversal.quantity
        ),
        err
    )]
    pub fn reverse_intake(&self, reversal: &IntakeReversal, log: &mut MovementLog) -> Result<Batch, LedgerError> {
        let reference = reversal.purchase_id.map(MovementReference::PurchaseDocument);

        let mut retries = 0;
        loop {
            let batch = self
                .store
                .get(reversal.tenant_id, reversal.batch_id)?
                .ok_or(LedgerError::BatchNotFound(reversal.batch_id))?;

            let delta = plan_reversal(&batch, reversal.quantity).map_err(|err| match err {
                DomainError::InvariantViolation(_) => LedgerError::InsufficientStock {
                    product_id: batch.product_id,
                    requested: reversal.quantity,
                    available: batch.available().max(0),
                },
                other => other.into(),
            })?;

            match self.store.apply_delta(
                reversal.tenant_id,
                batch.id,
                delta,
                ExpectedVersion::Exact(batch.version),
                reversal.occurred_at,
            ) {
                Ok(after) => {
                    log.record(MovementKind::IntakeReversed, &after, delta, reference, reversal.occurred_at);
                    info!(on_hand = after.on_hand, "intake reversed");
                    return Ok(after);
                }
                Err(BatchStoreError::Concurrency(_)) | Err(BatchStoreError::Rejected(_))
                    if retries < self.config.max_retries_per_candidate =>
                {
                    retries += 1;
                    debug!(attempt = retries, "batch changed during reversal, retrying");
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}
