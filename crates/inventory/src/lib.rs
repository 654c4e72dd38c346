//! Batch inventory domain module.
//!
//! Business rules for per-product, per-batch stock: quantity arithmetic and
//! its invariants, candidate ordering (FEFO/FIFO), inventory queries and
//! manual adjustments. Implemented purely as deterministic domain logic
//! (no IO, no storage).

pub mod adjustment;
pub mod allocation;
pub mod batch;
pub mod filter;
pub mod movement;

pub use adjustment::{AdjustmentId, AdjustmentReason, AdjustmentRecord, plan_adjustment};
pub use allocation::{Allocation, AllocationMode, coalesce, sort_candidates, total_quantity};
pub use batch::{Batch, BatchId, BatchNumber, BatchPricing, NewBatch, ProductId, StockDelta};
pub use filter::{InventoryFilter, InventorySummary};
pub use movement::{MovementKind, MovementReference, StockMovement};
