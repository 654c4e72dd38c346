use chrono::{DateTime, Utc};

/// A domain-agnostic event.
///
/// Events are immutable facts about a committed change. They are versioned so
/// consumers can evolve alongside the payload schema.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name/type identifier (e.g. "stock.reserved").
    fn event_type(&self) -> &'static str;

    /// Schema version for this event type.
    fn version(&self) -> u32;

    /// When the event occurred (business time).
    fn occurred_at(&self) -> DateTime<Utc>;
}
