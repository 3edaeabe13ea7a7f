//! Entity trait: identity + continuity across state changes.

/// Entity marker + minimal interface.
///
/// Items, cart lines, ordered items and addresses are all entities: two
/// records with the same id are the same record even if their quantities differ.
pub trait Entity {
    /// Strongly-typed entity identifier.
    type Id: Copy + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the entity identifier.
    fn id(&self) -> &Self::Id;
}
