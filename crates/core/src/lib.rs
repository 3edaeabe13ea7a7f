//! `shipyard-core`: identifiers and the domain error model shared by the
//! marketplace crates.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod entity;
pub mod error;
pub mod id;

pub use entity::Entity;
pub use error::{DomainError, DomainResult};
pub use id::{AddressId, CartItemId, ItemId, OrderedItemId, UserId};
