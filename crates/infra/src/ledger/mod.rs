//! Ledger orchestration: the allocation engine, the coordinators built on
//! it, and the `InventoryLedger` facade.

pub mod adjustment;
pub mod allocation;
pub mod config;
pub mod error;
pub mod feed;
pub mod purchase_intake;
pub mod sales_consumption;
pub mod service;

pub use adjustment::{AdjustmentService, BatchAdjustment};
pub use allocation::{AllocationEngine, OperationContext};
pub use config::LedgerConfig;
pub use error::LedgerError;
pub use feed::{BATCH_STREAM, MovementLog, envelope, publish_all};
pub use purchase_intake::PurchaseIntakeCoordinator;
pub use sales_consumption::SalesConsumptionCoordinator;
pub use service::InventoryLedger;
