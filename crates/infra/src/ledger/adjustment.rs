//! Manual stock corrections (counts, breakage, write-offs) with an audit trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use stockledger_core::{EntityId, ExpectedVersion, TenantId, UserId};
use stockledger_inventory::{
    AdjustmentId, AdjustmentReason, AdjustmentRecord, BatchId, MovementKind, MovementReference,
    StockDelta, plan_adjustment,
};

use crate::batch_store::{BatchStore, BatchStoreError};

use super::config::LedgerConfig;
use super::error::LedgerError;
use super::feed::MovementLog;

/// Command: correct the on-hand quantity of one batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchAdjustment {
    pub tenant_id: TenantId,
    pub batch_id: BatchId,
    pub delta: i64,
    pub reason: String,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

pub struct AdjustmentService<S> {
    store: S,
    config: LedgerConfig,
}

impl<S> AdjustmentService<S>
where
    S: BatchStore,
{
    pub fn new(store: S, config: LedgerConfig) -> Self {
        Self { store, config }
    }

    /// Apply the adjustment and append its record in one store write.
    ///
    /// Removals may only take unreserved stock. Expired and inactive batches
    /// can still be adjusted.
    #[instrument(
        skip(self, cmd, log),
        fields(tenant_id = %cmd.tenant_id.as_uuid(), batch_id = %cmd.batch_id, delta = cmd.delta),
        err
    )]
    pub fn adjust(&self, cmd: &BatchAdjustment, log: &mut MovementLog) -> Result<AdjustmentRecord, LedgerError> {
        let reason = AdjustmentReason::parse(&cmd.reason)?;

        let mut retries = 0;
        loop {
            let batch = self
                .store
                .get(cmd.tenant_id, cmd.batch_id)?
                .ok_or(LedgerError::BatchNotFound(cmd.batch_id))?;

            // Taking more than the unreserved stock is an invariant failure.
            plan_adjustment(&batch, cmd.delta)?;

            let record = AdjustmentRecord {
                id: AdjustmentId::new(EntityId::new()),
                tenant_id: cmd.tenant_id,
                batch_id: batch.id,
                product_id: batch.product_id,
                delta: cmd.delta,
                reason: reason.clone(),
                actor: cmd.actor,
                on_hand_after: batch.on_hand + cmd.delta,
                occurred_at: cmd.occurred_at,
            };

            match self.store.apply_adjustment(record, ExpectedVersion::Exact(batch.version)) {
                Ok((after, record)) => {
                    log.record(
                        MovementKind::Adjusted,
                        &after,
                        StockDelta::on_hand(record.delta),
                        Some(MovementReference::Adjustment(record.id)),
                        record.occurred_at,
                    );
                    info!(on_hand = after.on_hand, reason = record.reason.as_str(), "batch adjusted");
                    return Ok(record);
                }
                Err(BatchStoreError::Concurrency(_)) | Err(BatchStoreError::Rejected(_))
                    if retries < self.config.max_retries_per_candidate =>
                {
                    retries += 1;
                    debug!(attempt = retries, "batch changed during adjustment, retrying");
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    pub fn history(&self, tenant_id: TenantId, batch_id: BatchId) -> Result<Vec<AdjustmentRecord>, LedgerError> {
        if self.store.get(tenant_id, batch_id)?.is_none() {
            return Err(LedgerError::BatchNotFound(batch_id));
        }
        Ok(self.store.adjustments_for_batch(tenant_id, batch_id)?)
    }
}
