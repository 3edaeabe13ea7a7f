use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use shipyard_core::{
    AddressId, DomainError, DomainResult, Entity, ItemId, OrderedItemId, UserId,
};

use crate::address::Address;
use crate::cart::CartItem;
use crate::item::Item;

/// A committed purchase. Price is frozen at order time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderedItem {
    pub id: OrderedItemId,
    pub user_id: UserId,
    pub item_id: ItemId,
    pub address_id: AddressId,
    pub quantity: i64,
    /// Unit price in smallest currency unit, as it was when the order committed.
    pub price: i64,
    pub delivered: bool,
    pub created_at: DateTime<Utc>,
}

impl Entity for OrderedItem {
    type Id = OrderedItemId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

/// Row handed to the order ledger. The caller supplies the price.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOrderedItem {
    pub user_id: UserId,
    pub item_id: ItemId,
    pub address_id: AddressId,
    pub quantity: i64,
    pub price: i64,
}

impl NewOrderedItem {
    /// Convert a cart reservation into a purchase at the item's current price.
    ///
    /// The line must claim exactly the reserved quantity; anything else would
    /// leave units unaccounted for once the cart line is deleted.
    pub fn freeze(
        line: &OrderLine,
        cart_item: &CartItem,
        item: &Item,
        address: &Address,
    ) -> DomainResult<Self> {
        if cart_item.item_id != item.id || line.item_id != item.id {
            return Err(DomainError::not_found("cart item"));
        }
        if address.id != line.address_id || address.user_id != cart_item.user_id {
            return Err(DomainError::not_found("address"));
        }
        if line.quantity != cart_item.quantity {
            return Err(DomainError::validation(format!(
                "order quantity {} does not match the {} reserved in the cart",
                line.quantity, cart_item.quantity
            )));
        }

        Ok(Self {
            user_id: cart_item.user_id,
            item_id: item.id,
            address_id: address.id,
            quantity: cart_item.quantity,
            price: item.price,
        })
    }

    pub fn into_ordered_item(self, id: OrderedItemId, created_at: DateTime<Utc>) -> OrderedItem {
        OrderedItem {
            id,
            user_id: self.user_id,
            item_id: self.item_id,
            address_id: self.address_id,
            quantity: self.quantity,
            price: self.price,
            delivered: false,
            created_at,
        }
    }
}

/// One line of an order request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub item_id: ItemId,
    pub address_id: AddressId,
    pub quantity: i64,
}

/// Command: purchase the listed cart reservations, all or nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceOrder {
    pub lines: Vec<OrderLine>,
}

impl PlaceOrder {
    pub fn validate(&self) -> DomainResult<()> {
        if self.lines.is_empty() {
            return Err(DomainError::validation("an order needs at least one line"));
        }
        for (idx, line) in self.lines.iter().enumerate() {
            if line.quantity < 1 {
                return Err(DomainError::validation(format!(
                    "order line {idx} has quantity {}",
                    line.quantity
                )));
            }
        }
        Ok(())
    }
}
