//! Entity traits: identity + continuity across state changes.

/// Entity marker + minimal interface.
pub trait Entity {
    /// Strongly-typed entity identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the entity identifier.
    fn id(&self) -> &Self::Id;
}

/// An entity whose persisted state carries an optimistic concurrency token.
///
/// The version starts at 1 when the row is first stored and is bumped by the
/// store on every successful mutation.
pub trait Versioned: Entity {
    fn version(&self) -> u64;
}
