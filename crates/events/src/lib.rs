//! Ledger event mechanics: event trait, envelopes and pub/sub.
//!
//! Business crates define their event payloads; infrastructure publishes them
//! after the corresponding mutation has been committed.

pub mod bus;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;
pub mod tenant;

pub use bus::{EventBus, Subscription};
pub use envelope::EventEnvelope;
pub use event::Event;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use tenant::TenantScoped;
