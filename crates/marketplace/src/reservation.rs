//! Reservation planning.
//!
//! Given the state read inside a transaction, decide what the cart line and the
//! item's remaining quantity must become. Planning is pure: it never mutates
//! and it never observes anything beyond its arguments. The caller writes the
//! plan and then runs [`ensure_committable`] against the post-write item.
//!
//! Every plan moves units between exactly two places, so
//! `stock_delta == -(new cart quantity - old cart quantity)` always holds.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use shipyard_core::{CartItemId, DomainError, DomainResult};

use crate::cart::CartItem;
use crate::item::Item;

/// What happens to the user's cart line for the item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CartLineChange {
    /// Nothing to write.
    Keep,
    /// No line exists yet; create one.
    Create { quantity: i64 },
    /// Overwrite the quantity of an existing line.
    SetQuantity { cart_item_id: CartItemId, quantity: i64 },
    /// Delete the line (its quantity dropped to zero).
    Remove { cart_item_id: CartItemId },
}

/// Writes required to move stock between an item and a cart line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationPlan {
    pub line: CartLineChange,
    /// Change to the item's remaining quantity. Negative reserves units,
    /// positive releases them.
    pub stock_delta: i64,
}

impl ReservationPlan {
    pub fn is_noop(&self) -> bool {
        matches!(self.line, CartLineChange::Keep) && self.stock_delta == 0
    }
}

/// Plan an AddToCart: reserve `requested` units, merging into an existing line.
pub fn plan_add_to_cart(
    item: &Item,
    existing: Option<&CartItem>,
    requested: i64,
) -> DomainResult<ReservationPlan> {
    if requested < 1 {
        return Err(DomainError::validation(
            "can't add less than 1 thing to your cart",
        ));
    }
    if !item.has_available(requested) {
        return Err(DomainError::insufficient_stock("not enough items left"));
    }

    let line = match existing {
        Some(cart_item) => {
            if cart_item.item_id != item.id {
                return Err(DomainError::not_found("cart item"));
            }
            let quantity = cart_item
                .quantity
                .checked_add(requested)
                .ok_or_else(|| DomainError::validation("cart quantity overflow"))?;
            CartLineChange::SetQuantity {
                cart_item_id: cart_item.id,
                quantity,
            }
        }
        None => CartLineChange::Create {
            quantity: requested,
        },
    };

    Ok(ReservationPlan {
        line,
        stock_delta: -requested,
    })
}

/// Plan an UpdateCart: move the line from its current quantity to `desired`.
pub fn plan_update_cart(
    item: &Item,
    cart_item: &CartItem,
    desired: i64,
) -> DomainResult<ReservationPlan> {
    if desired < 0 {
        return Err(DomainError::validation("cart quantity cannot be negative"));
    }
    if cart_item.item_id != item.id {
        return Err(DomainError::not_found("cart item"));
    }

    let current = cart_item.quantity;
    let plan = match desired.cmp(&current) {
        Ordering::Equal => ReservationPlan {
            line: CartLineChange::Keep,
            stock_delta: 0,
        },
        Ordering::Less => {
            let line = if desired == 0 {
                CartLineChange::Remove {
                    cart_item_id: cart_item.id,
                }
            } else {
                CartLineChange::SetQuantity {
                    cart_item_id: cart_item.id,
                    quantity: desired,
                }
            };
            ReservationPlan {
                line,
                stock_delta: current - desired,
            }
        }
        Ordering::Greater => {
            let required = desired - current;
            if !item.has_available(required) {
                return Err(DomainError::insufficient_stock(format!(
                    "only {} items remain. not enough",
                    item.remaining_quantity
                )));
            }
            ReservationPlan {
                line: CartLineChange::SetQuantity {
                    cart_item_id: cart_item.id,
                    quantity: desired,
                },
                stock_delta: -required,
            }
        }
    };

    Ok(plan)
}

/// Post-write check: a negative remaining quantity means another transaction
/// committed between our read and our write. The scope must abort.
pub fn ensure_committable(item: &Item) -> DomainResult<()> {
    if item.remaining_quantity < 0 {
        return Err(DomainError::conflict("this item is no longer available"));
    }
    Ok(())
}
