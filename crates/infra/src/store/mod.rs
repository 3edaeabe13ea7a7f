//! Transactional storage boundary.
//!
//! The marketplace keeps three kinds of state (items, cart lines, ordered
//! items) plus the addresses orders point at. Each store contract below is
//! implemented by a *transaction* type: every read and write happens inside the
//! caller's scope, and nothing becomes visible until [`MarketTx::commit`].
//!
//! ## Scope lifecycle
//!
//! ```text
//! TransactionCoordinator::begin()   (may wait until storage grants the scope)
//!   ↓
//! reads / checks / writes through InventoryStore, CartStore, OrderLedger, AddressBook
//!   ↓
//! commit()  → all writes visible at once
//! rollback() or drop → no observable effect
//! ```
//!
//! Dropping a transaction without committing rolls it back. Cancelling the
//! future that owns a transaction therefore leaves storage untouched.
//!
//! ## Stock guard
//!
//! `adjust_remaining` is a relative update and returns the post-write item so
//! callers can detect a lost race. Backends additionally refuse to *commit* a
//! negative remaining quantity ([`StoreError::StockExhausted`]).

pub mod in_memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use shipyard_core::{AddressId, CartItemId, ItemId, UserId};
use shipyard_marketplace::{
    Address, CartItem, CartLine, Item, ItemPatch, NewOrderedItem, OrderedItem,
};

pub use in_memory::{InMemoryMarketStore, InMemoryTx};
pub use postgres::{PostgresMarketStore, PostgresTx};

/// Storage operation error.
///
/// These are **infrastructure errors** as opposed to domain errors
/// (validation, stock checks).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),

    /// A write would have left an item's remaining quantity negative.
    #[error("stock exhausted: {0}")]
    StockExhausted(String),

    /// The engine aborted the transaction to preserve isolation
    /// (serialization failure, deadlock).
    #[error("transaction aborted by storage: {0}")]
    Serialization(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("connection pool closed")]
    PoolClosed,

    #[error("timed out: {0}")]
    Timeout(String),
}

/// Item records and their remaining quantity.
#[async_trait]
pub trait InventoryStore: Send {
    /// Item with `remaining_quantity >= min_quantity`, locked for the rest of
    /// the scope. `None` if the item is missing or short.
    async fn find_available(
        &mut self,
        item_id: ItemId,
        min_quantity: i64,
    ) -> Result<Option<Item>, StoreError>;

    /// Item by id, locked for the rest of the scope.
    async fn find_item(&mut self, item_id: ItemId) -> Result<Option<Item>, StoreError>;

    /// Add `delta` (may be negative) to the remaining quantity and return the
    /// post-write item.
    async fn adjust_remaining(&mut self, item_id: ItemId, delta: i64)
    -> Result<Item, StoreError>;

    async fn insert_item(&mut self, item: &Item) -> Result<(), StoreError>;

    /// Apply a patch to an item owned by `owner`. `None` if no such item.
    async fn update_item_details(
        &mut self,
        item_id: ItemId,
        owner: UserId,
        patch: &ItemPatch,
    ) -> Result<Option<Item>, StoreError>;

    async fn list_items(&mut self) -> Result<Vec<Item>, StoreError>;
}

/// Cart lines, at most one per (user, item).
///
/// Callers must check [`CartStore::find_cart_item`] before
/// [`CartStore::create_cart_item`]; a duplicate create fails with
/// [`StoreError::UniqueViolation`].
#[async_trait]
pub trait CartStore: Send {
    async fn find_cart_item(
        &mut self,
        user_id: UserId,
        item_id: ItemId,
    ) -> Result<Option<CartItem>, StoreError>;

    async fn create_cart_item(
        &mut self,
        user_id: UserId,
        item_id: ItemId,
        quantity: i64,
    ) -> Result<CartItem, StoreError>;

    async fn set_cart_quantity(
        &mut self,
        cart_item_id: CartItemId,
        quantity: i64,
    ) -> Result<(), StoreError>;

    async fn delete_cart_item(&mut self, cart_item_id: CartItemId) -> Result<(), StoreError>;

    /// The user's cart, oldest line first.
    async fn list_cart(&mut self, user_id: UserId) -> Result<Vec<CartLine>, StoreError>;

    /// Units of `item_id` reserved across all carts.
    async fn reserved_quantity(&mut self, item_id: ItemId) -> Result<i64, StoreError>;
}

/// Append-only record of purchases.
#[async_trait]
pub trait OrderLedger: Send {
    async fn create_ordered_item(
        &mut self,
        row: NewOrderedItem,
    ) -> Result<OrderedItem, StoreError>;

    /// The user's purchases, oldest first.
    async fn list_orders(&mut self, user_id: UserId) -> Result<Vec<OrderedItem>, StoreError>;

    /// Units of `item_id` ever ordered.
    async fn ordered_quantity(&mut self, item_id: ItemId) -> Result<i64, StoreError>;
}

/// Delivery addresses referenced by orders.
#[async_trait]
pub trait AddressBook: Send {
    async fn insert_address(&mut self, address: &Address) -> Result<(), StoreError>;

    /// Address `address_id` if it belongs to `user_id`.
    async fn find_address(
        &mut self,
        user_id: UserId,
        address_id: AddressId,
    ) -> Result<Option<Address>, StoreError>;
}

/// One atomic scope over all marketplace stores.
#[async_trait]
pub trait MarketTx: InventoryStore + CartStore + OrderLedger + AddressBook + Send + Sized {
    async fn commit(self) -> Result<(), StoreError>;

    async fn rollback(self) -> Result<(), StoreError>;
}

/// Hands out atomic scopes.
#[async_trait]
pub trait TransactionCoordinator: Send + Sync {
    type Tx: MarketTx + 'static;

    /// Open a scope. May wait until the storage grants it.
    async fn begin(&self) -> Result<Self::Tx, StoreError>;
}

#[async_trait]
impl<C> TransactionCoordinator for Arc<C>
where
    C: TransactionCoordinator + ?Sized,
{
    type Tx = C::Tx;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        (**self).begin().await
    }
}
