//! Marketplace domain module.
//!
//! Records (items, cart lines, ordered items, addresses) and the deterministic
//! decision logic that moves quantity between "remaining", "reserved in a cart"
//! and "ordered". Nothing here performs IO; the infrastructure layer executes
//! the decisions inside a storage transaction.

pub mod address;
pub mod audit;
pub mod cart;
pub mod item;
pub mod order;
pub mod reservation;

pub use address::{Address, NewAddress};
pub use audit::StockAudit;
pub use cart::{AddToCart, CartItem, CartLine, UpdateCart};
pub use item::{Item, ItemPatch, NewItem};
pub use order::{NewOrderedItem, OrderLine, OrderedItem, PlaceOrder};
pub use reservation::{
    CartLineChange, ReservationPlan, ensure_committable, plan_add_to_cart, plan_update_cart,
};
