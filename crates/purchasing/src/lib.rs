//! Purchasing domain module (stock intake).
//!
//! Decides how purchased goods land in the batch ledger: a new batch, or a
//! merge into the existing batch with the same number at a re-weighted
//! average cost. Pure domain logic (no IO, no storage).

pub mod intake;

pub use intake::{
    IntakeDecision, IntakeReversal, PurchaseIntake, plan_reversal, weighted_average_cost,
};
