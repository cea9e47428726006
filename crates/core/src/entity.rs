//! Entity trait: identity + continuity across state changes.

/// Entity marker + minimal interface.
///
/// Users and products are entities: a user keeps its identity while its status
/// and assigned products change with every committed action.
pub trait Entity {
    /// Strongly-typed entity identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the entity identifier.
    fn id(&self) -> &Self::Id;
}
