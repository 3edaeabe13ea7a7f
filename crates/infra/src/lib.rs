//! Infrastructure layer: storage backends, storage configuration and the
//! marketplace operations that compose them inside one transaction.

pub mod config;
pub mod market_service;
pub mod store;

pub use config::{ConfigError, StoreConfig};
pub use market_service::{ErrorKind, MarketError, MarketService};
pub use store::{
    AddressBook, CartStore, InMemoryMarketStore, InventoryStore, MarketTx, OrderLedger,
    PostgresMarketStore, StoreError, TransactionCoordinator,
};
