use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use shipyard_core::{AddressId, CartItemId, ItemId, OrderedItemId, UserId};
use shipyard_marketplace::{
    Address, CartItem, CartLine, Item, ItemPatch, NewOrderedItem, OrderedItem,
};

use super::{
    AddressBook, CartStore, InventoryStore, MarketTx, OrderLedger, StoreError,
    TransactionCoordinator,
};

#[derive(Debug, Clone, Default)]
struct MarketState {
    items: HashMap<ItemId, Item>,
    cart_items: HashMap<CartItemId, CartItem>,
    ordered_items: Vec<OrderedItem>,
    addresses: HashMap<AddressId, Address>,
}

impl MarketState {
    fn cart_item_mut(&mut self, cart_item_id: CartItemId) -> Result<&mut CartItem, StoreError> {
        self.cart_items
            .get_mut(&cart_item_id)
            .ok_or(StoreError::NotFound("cart item"))
    }
}

/// In-memory marketplace storage.
///
/// Scopes are fully serialized: `begin()` waits for an async mutex and works on
/// a private copy of the state, which replaces the shared state on commit.
/// Dropping the scope discards the copy.
///
/// Intended for tests/dev. Not optimized for performance.
#[derive(Debug, Clone, Default)]
pub struct InMemoryMarketStore {
    state: Arc<Mutex<MarketState>>,
}

impl InMemoryMarketStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransactionCoordinator for InMemoryMarketStore {
    type Tx = InMemoryTx;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(InMemoryTx { guard, working })
    }
}

/// Scope over [`InMemoryMarketStore`]. Holds the store lock until dropped.
pub struct InMemoryTx {
    guard: OwnedMutexGuard<MarketState>,
    working: MarketState,
}

#[async_trait]
impl MarketTx for InMemoryTx {
    async fn commit(self) -> Result<(), StoreError> {
        let InMemoryTx { mut guard, working } = self;

        if let Some(item) = working.items.values().find(|i| i.remaining_quantity < 0) {
            return Err(StoreError::StockExhausted(format!(
                "item {} would have remaining quantity {}",
                item.id, item.remaining_quantity
            )));
        }

        *guard = working;
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl InventoryStore for InMemoryTx {
    async fn find_available(
        &mut self,
        item_id: ItemId,
        min_quantity: i64,
    ) -> Result<Option<Item>, StoreError> {
        Ok(self
            .working
            .items
            .get(&item_id)
            .filter(|item| item.has_available(min_quantity))
            .cloned())
    }

    async fn find_item(&mut self, item_id: ItemId) -> Result<Option<Item>, StoreError> {
        Ok(self.working.items.get(&item_id).cloned())
    }

    async fn adjust_remaining(
        &mut self,
        item_id: ItemId,
        delta: i64,
    ) -> Result<Item, StoreError> {
        let item = self
            .working
            .items
            .get_mut(&item_id)
            .ok_or(StoreError::NotFound("item"))?;
        item.remaining_quantity += delta;
        Ok(item.clone())
    }

    async fn insert_item(&mut self, item: &Item) -> Result<(), StoreError> {
        if self.working.items.contains_key(&item.id) {
            return Err(StoreError::UniqueViolation(format!("item {}", item.id)));
        }
        self.working.items.insert(item.id, item.clone());
        Ok(())
    }

    async fn update_item_details(
        &mut self,
        item_id: ItemId,
        owner: UserId,
        patch: &ItemPatch,
    ) -> Result<Option<Item>, StoreError> {
        match self.working.items.get_mut(&item_id) {
            Some(item) if item.is_owned_by(owner) => {
                item.apply_patch(patch);
                Ok(Some(item.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn list_items(&mut self) -> Result<Vec<Item>, StoreError> {
        let mut items: Vec<Item> = self.working.items.values().cloned().collect();
        items.sort_by_key(|i| (i.created_at, i.id));
        Ok(items)
    }
}

#[async_trait]
impl CartStore for InMemoryTx {
    async fn find_cart_item(
        &mut self,
        user_id: UserId,
        item_id: ItemId,
    ) -> Result<Option<CartItem>, StoreError> {
        Ok(self
            .working
            .cart_items
            .values()
            .find(|c| c.user_id == user_id && c.item_id == item_id)
            .cloned())
    }

    async fn create_cart_item(
        &mut self,
        user_id: UserId,
        item_id: ItemId,
        quantity: i64,
    ) -> Result<CartItem, StoreError> {
        if !self.working.items.contains_key(&item_id) {
            return Err(StoreError::NotFound("item"));
        }
        let duplicate = self
            .working
            .cart_items
            .values()
            .any(|c| c.user_id == user_id && c.item_id == item_id);
        if duplicate {
            return Err(StoreError::UniqueViolation(format!(
                "cart item for user {user_id} and item {item_id}"
            )));
        }

        let cart_item = CartItem {
            id: CartItemId::new(),
            user_id,
            item_id,
            quantity,
            created_at: Utc::now(),
        };
        self.working.cart_items.insert(cart_item.id, cart_item.clone());
        Ok(cart_item)
    }

    async fn set_cart_quantity(
        &mut self,
        cart_item_id: CartItemId,
        quantity: i64,
    ) -> Result<(), StoreError> {
        self.working.cart_item_mut(cart_item_id)?.quantity = quantity;
        Ok(())
    }

    async fn delete_cart_item(&mut self, cart_item_id: CartItemId) -> Result<(), StoreError> {
        self.working
            .cart_items
            .remove(&cart_item_id)
            .map(|_| ())
            .ok_or(StoreError::NotFound("cart item"))
    }

    async fn list_cart(&mut self, user_id: UserId) -> Result<Vec<CartLine>, StoreError> {
        let mut lines: Vec<&CartItem> = self
            .working
            .cart_items
            .values()
            .filter(|c| c.user_id == user_id)
            .collect();
        lines.sort_by_key(|c| (c.created_at, c.id));
        Ok(lines.into_iter().map(CartLine::from).collect())
    }

    async fn reserved_quantity(&mut self, item_id: ItemId) -> Result<i64, StoreError> {
        Ok(self
            .working
            .cart_items
            .values()
            .filter(|c| c.item_id == item_id)
            .map(|c| c.quantity)
            .sum())
    }
}

#[async_trait]
impl OrderLedger for InMemoryTx {
    async fn create_ordered_item(
        &mut self,
        row: NewOrderedItem,
    ) -> Result<OrderedItem, StoreError> {
        if !self.working.items.contains_key(&row.item_id) {
            return Err(StoreError::NotFound("item"));
        }
        if !self.working.addresses.contains_key(&row.address_id) {
            return Err(StoreError::NotFound("address"));
        }

        let ordered = row.into_ordered_item(OrderedItemId::new(), Utc::now());
        self.working.ordered_items.push(ordered.clone());
        Ok(ordered)
    }

    async fn list_orders(&mut self, user_id: UserId) -> Result<Vec<OrderedItem>, StoreError> {
        Ok(self
            .working
            .ordered_items
            .iter()
            .filter(|o| o.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn ordered_quantity(&mut self, item_id: ItemId) -> Result<i64, StoreError> {
        Ok(self
            .working
            .ordered_items
            .iter()
            .filter(|o| o.item_id == item_id)
            .map(|o| o.quantity)
            .sum())
    }
}

#[async_trait]
impl AddressBook for InMemoryTx {
    async fn insert_address(&mut self, address: &Address) -> Result<(), StoreError> {
        if self.working.addresses.contains_key(&address.id) {
            return Err(StoreError::UniqueViolation(format!("address {}", address.id)));
        }
        self.working.addresses.insert(address.id, address.clone());
        Ok(())
    }

    async fn find_address(
        &mut self,
        user_id: UserId,
        address_id: AddressId,
    ) -> Result<Option<Address>, StoreError> {
        Ok(self
            .working
            .addresses
            .get(&address_id)
            .filter(|a| a.user_id == user_id)
            .cloned())
    }
}
