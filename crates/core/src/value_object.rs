//! Value object trait: equality by value, not identity.

/// Marker trait for value objects.
///
/// Value objects have no identity and are immutable: two instances holding
/// the same attributes are interchangeable. "Modifying" one yields a new value
/// (see [`crate::Amount::checked_add`]).
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
