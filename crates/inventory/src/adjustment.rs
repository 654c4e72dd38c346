//! Manual stock corrections and their audit trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::{DomainError, DomainResult, EntityId, TenantId, UserId};

use crate::batch::{Batch, BatchId, ProductId, StockDelta};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AdjustmentId(pub EntityId);

impl AdjustmentId {
    pub fn new(id: EntityId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for AdjustmentId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Free-text justification for a correction ("damaged", "stock count").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AdjustmentReason(String);

impl AdjustmentReason {
    pub const MAX_LEN: usize = 500;

    pub fn parse(raw: impl AsRef<str>) -> DomainResult<Self> {
        let trimmed = raw.as_ref().trim();
        if trimmed.is_empty() {
            return Err(DomainError::validation("adjustment reason cannot be empty"));
        }
        if trimmed.chars().count() > Self::MAX_LEN {
            return Err(DomainError::validation(format!(
                "adjustment reason cannot exceed {} characters",
                Self::MAX_LEN
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for AdjustmentReason {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<AdjustmentReason> for String {
    fn from(value: AdjustmentReason) -> Self {
        value.0
    }
}

/// Append-only audit entry for a manual stock change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustmentRecord {
    pub id: AdjustmentId,
    pub tenant_id: TenantId,
    pub batch_id: BatchId,
    pub product_id: ProductId,
    pub delta: i64,
    pub reason: AdjustmentReason,
    pub actor: UserId,
    /// On-hand quantity right after the adjustment was applied.
    pub on_hand_after: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Decide the quantity change for a manual adjustment of `batch`.
///
/// Removals may only take unreserved stock; additions are unconditioned.
/// Expired or inactive batches can still be adjusted.
pub fn plan_adjustment(batch: &Batch, delta: i64) -> DomainResult<StockDelta> {
    if delta == 0 {
        return Err(DomainError::validation("adjustment delta cannot be zero"));
    }
    if delta < 0 && batch.available() + delta < 0 {
        return Err(DomainError::invariant(format!(
            "adjustment of {delta} exceeds available quantity {} (reserved stock cannot be adjusted away)",
            batch.available()
        )));
    }
    let planned = StockDelta::on_hand(delta);
    batch.preview(planned)?;
    Ok(planned)
}
