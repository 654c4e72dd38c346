use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::{DomainError, DomainResult, EntityId, ExpectedVersion, TenantId};
use stockledger_inventory::{Batch, BatchId, BatchNumber, BatchPricing, NewBatch, ProductId, StockDelta};

/// Command: receive purchased goods into a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseIntake {
    pub tenant_id: TenantId,
    pub product_id: ProductId,
    pub batch_number: BatchNumber,
    pub expiry_date: Option<NaiveDate>,
    pub quantity: i64,
    /// Unit cost in smallest currency unit.
    pub unit_cost: u64,
    /// Prices for a new batch; when merging, replaces the batch's prices if set.
    pub pricing: Option<BatchPricing>,
    /// Purchase document that carried this line, if any.
    pub purchase_id: Option<EntityId>,
    pub occurred_at: DateTime<Utc>,
}

impl PurchaseIntake {
    pub fn validate(&self) -> DomainResult<()> {
        if self.quantity <= 0 {
            return Err(DomainError::validation("intake quantity must be positive"));
        }
        if let Some(pricing) = &self.pricing {
            pricing.validate()?;
        }
        Ok(())
    }
}

/// How an intake lands in the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntakeDecision {
    /// No batch with this number yet.
    Create(NewBatch),
    /// Add to the existing batch, guarded by the version it was read at.
    Merge {
        batch_id: BatchId,
        expected_version: ExpectedVersion,
        quantity: i64,
        unit_cost: u64,
        average_cost: u64,
        pricing: Option<BatchPricing>,
        /// The batch was inactive and comes back into circulation.
        reactivates: bool,
    },
}

impl PurchaseIntake {
    /// Decide between creating a batch and merging into `existing`.
    ///
    /// `existing` must be the batch with the same tenant, product and batch
    /// number, if one exists (active or not: the number stays unique).
    pub fn decide(&self, existing: Option<&Batch>) -> DomainResult<IntakeDecision> {
        self.validate()?;

        let Some(batch) = existing else {
            return Ok(IntakeDecision::Create(NewBatch {
                tenant_id: self.tenant_id,
                product_id: self.product_id,
                batch_number: self.batch_number.clone(),
                expiry_date: self.expiry_date,
                quantity: self.quantity,
                unit_cost: self.unit_cost,
                pricing: self.pricing.unwrap_or_default(),
                occurred_at: self.occurred_at,
            }));
        };

        if batch.tenant_id != self.tenant_id {
            return Err(DomainError::invariant("tenant mismatch"));
        }
        if batch.product_id != self.product_id || batch.batch_number != self.batch_number {
            return Err(DomainError::invariant("intake does not target this batch"));
        }
        if let (Some(incoming), Some(current)) = (self.expiry_date, batch.expiry_date) {
            if incoming != current {
                return Err(DomainError::validation(format!(
                    "batch {} already expires on {current}, intake says {incoming}",
                    batch.batch_number
                )));
            }
        }

        Ok(IntakeDecision::Merge {
            batch_id: batch.id,
            expected_version: ExpectedVersion::Exact(batch.version),
            quantity: self.quantity,
            unit_cost: self.unit_cost,
            average_cost: weighted_average_cost(
                batch.on_hand,
                batch.average_cost,
                self.quantity,
                self.unit_cost,
            ),
            pricing: self.pricing,
            reactivates: !batch.is_active,
        })
    }
}

/// `(old_on_hand * old_avg + q * c) / (old_on_hand + q)`, rounded half-up to
/// the nearest minor unit.
///
/// Depleted (or malformed negative) stock contributes no weight, so the new
/// cost wins outright.
pub fn weighted_average_cost(old_on_hand: i64, old_avg: u64, quantity: i64, unit_cost: u64) -> u64 {
    let old_qty = old_on_hand.max(0) as u128;
    let new_qty = quantity.max(0) as u128;
    let total_qty = old_qty + new_qty;
    if total_qty == 0 {
        return unit_cost;
    }
    let total_value = old_qty * old_avg as u128 + new_qty * unit_cost as u128;
    let rounded = (total_value + total_qty / 2) / total_qty;
    u64::try_from(rounded).unwrap_or(u64::MAX)
}

/// Command: undo (part of) a purchase intake, e.g. a deleted purchase line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntakeReversal {
    pub tenant_id: TenantId,
    pub batch_id: BatchId,
    pub quantity: i64,
    pub purchase_id: Option<EntityId>,
    pub occurred_at: DateTime<Utc>,
}

/// Quantity change for reversing `quantity` units of intake on `batch`.
///
/// Only unreserved stock can be sent back. Average cost is left as is.
pub fn plan_reversal(batch: &Batch, quantity: i64) -> DomainResult<StockDelta> {
    if quantity <= 0 {
        return Err(DomainError::validation("reversal quantity must be positive"));
    }
    if batch.available() < quantity {
        return Err(DomainError::invariant(format!(
            "cannot reverse {quantity} units, only {} available",
            batch.available()
        )));
    }
    let delta = StockDelta::on_hand(-quantity);
    batch.preview(delta)?;
    Ok(delta)
}
