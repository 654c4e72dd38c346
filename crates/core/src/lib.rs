//! `stockledger-core` - domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives shared by the ledger crates
//! (no infrastructure concerns).

pub mod entity;
pub mod error;
pub mod id;
pub mod version;

pub use entity::{Entity, Versioned};
pub use error::{DomainError, DomainResult};
pub use id::{EntityId, TenantId, UserId};
pub use version::ExpectedVersion;
