//! Stock movement feed.
//!
//! Operations record every committed batch change in a [`MovementLog`]. The
//! ledger publishes the log once the operation returns, whether it succeeded
//! or rolled back: compensating changes are real changes too, and consumers
//! track each batch by its version sequence.

use chrono::{DateTime, Utc};
use tracing::error;
use uuid::Uuid;

use stockledger_events::{EventBus, EventEnvelope};
use stockledger_inventory::{Batch, MovementKind, MovementReference, StockDelta, StockMovement};

pub const BATCH_STREAM: &str = "batch";

/// Committed movements of one ledger operation, in commit order.
#[derive(Debug, Default)]
pub struct MovementLog {
    movements: Vec<StockMovement>,
}

impl MovementLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &mut self,
        kind: MovementKind,
        after: &Batch,
        delta: StockDelta,
        reference: Option<MovementReference>,
        at: DateTime<Utc>,
    ) {
        self.movements
            .push(StockMovement::of(kind, after, delta, reference, at));
    }

    pub fn len(&self) -> usize {
        self.movements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.movements.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StockMovement> {
        self.movements.iter()
    }

    pub fn into_inner(self) -> Vec<StockMovement> {
        self.movements
    }
}

pub fn envelope(movement: StockMovement) -> EventEnvelope<StockMovement> {
    EventEnvelope::new(
        Uuid::now_v7(),
        movement.tenant_id,
        movement.batch_id.0,
        BATCH_STREAM,
        movement.batch_version,
        movement,
    )
}

/// Publish every movement of `log`. The batch store is the source of truth,
/// so a failed publish is logged and does not undo the operation.
pub fn publish_all<B>(bus: &B, log: MovementLog)
where
    B: EventBus<EventEnvelope<StockMovement>>,
{
    for movement in log.into_inner() {
        let batch_id = movement.batch_id;
        let version = movement.batch_version;
        if let Err(err) = bus.publish(envelope(movement)) {
            error!(batch_id = %batch_id, batch_version = version, error = ?err, "stock movement publication failed");
        }
    }
}
