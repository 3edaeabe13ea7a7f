use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use shipyard_core::{CartItemId, DomainError, DomainResult, Entity, ItemId, UserId};

/// A user's reservation of some units of one item.
///
/// At most one exists per (user, item); a quantity of zero is never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartItem {
    pub id: CartItemId,
    pub user_id: UserId,
    pub item_id: ItemId,
    pub quantity: i64,
    pub created_at: DateTime<Utc>,
}

impl Entity for CartItem {
    type Id = CartItemId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

/// One row of a cart listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartLine {
    pub item_id: ItemId,
    pub quantity: i64,
}

impl From<&CartItem> for CartLine {
    fn from(value: &CartItem) -> Self {
        Self {
            item_id: value.item_id,
            quantity: value.quantity,
        }
    }
}

/// Command: reserve `quantity` more units of `item_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddToCart {
    pub item_id: ItemId,
    pub quantity: i64,
}

impl AddToCart {
    pub fn validate(&self) -> DomainResult<()> {
        if self.quantity < 1 {
            return Err(DomainError::validation(
                "can't add less than 1 thing to your cart",
            ));
        }
        Ok(())
    }
}

/// Command: set the reserved quantity of the cart line holding `item_id`.
///
/// The line is located by the item it references, not by its own id: a user
/// has at most one line per item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateCart {
    pub item_id: ItemId,
    pub quantity: i64,
}

impl UpdateCart {
    pub fn validate(&self) -> DomainResult<()> {
        if self.quantity < 0 {
            return Err(DomainError::validation("cart quantity cannot be negative"));
        }
        Ok(())
    }
}
