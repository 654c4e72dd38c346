//! Stock movements: the committed-change feed published by the ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::{EntityId, TenantId};
use stockledger_events::Event;

use crate::adjustment::AdjustmentId;
use crate::batch::{Batch, BatchId, ProductId, StockDelta};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementKind {
    BatchCreated,
    BatchReplenished,
    IntakeReversed,
    Reserved,
    Released,
    Consumed,
    ConsumptionReversed,
    Adjusted,
    Deactivated,
    Repriced,
}

/// Business document that caused a movement.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum MovementReference {
    SalesDocument(EntityId),
    PurchaseDocument(EntityId),
    Adjustment(AdjustmentId),
}

/// Event: one committed change to one batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockMovement {
    pub tenant_id: TenantId,
    pub batch_id: BatchId,
    pub product_id: ProductId,
    pub kind: MovementKind,
    pub delta: StockDelta,
    pub on_hand_after: i64,
    pub reserved_after: i64,
    /// Batch version produced by this change.
    pub batch_version: u64,
    pub reference: Option<MovementReference>,
    pub occurred_at: DateTime<Utc>,
}

impl StockMovement {
    /// Describe the change that produced `after`.
    pub fn of(
        kind: MovementKind,
        after: &Batch,
        delta: StockDelta,
        reference: Option<MovementReference>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            tenant_id: after.tenant_id,
            batch_id: after.id,
            product_id: after.product_id,
            kind,
            delta,
            on_hand_after: after.on_hand,
            reserved_after: after.reserved,
            batch_version: after.version,
            reference,
            occurred_at,
        }
    }
}

impl Event for StockMovement {
    fn event_type(&self) -> &'static str {
        match self.kind {
            MovementKind::BatchCreated => "batch.created",
            MovementKind::BatchReplenished => "batch.replenished",
            MovementKind::IntakeReversed => "intake.reversed",
            MovementKind::Reserved => "stock.reserved",
            MovementKind::Released => "stock.released",
            MovementKind::Consumed => "stock.consumed",
            MovementKind::ConsumptionReversed => "stock.consumption_reversed",
            MovementKind::Adjusted => "batch.adjusted",
            MovementKind::Deactivated => "batch.deactivated",
            MovementKind::Repriced => "batch.repriced",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}
