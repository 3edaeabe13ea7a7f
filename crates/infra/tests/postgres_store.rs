//! Postgres-backed flows. Require a reachable database:
//!
//! ```text
//! DATABASE_URL=postgres://localhost/shipyard_test cargo test -p shipyard-infra -- --ignored
//! ```

use std::sync::Arc;

use anyhow::Context;

use shipyard_core::UserId;
use shipyard_infra::{
    ErrorKind, InventoryStore, MarketService, MarketTx, PostgresMarketStore, StoreConfig,
    StoreError, TransactionCoordinator,
};
use shipyard_marketplace::{AddToCart, NewAddress, NewItem, OrderLine, PlaceOrder, UpdateCart};

async fn connect() -> anyhow::Result<PostgresMarketStore> {
    let config = StoreConfig::from_env().context("DATABASE_URL must point at a test database")?;
    let store = PostgresMarketStore::connect(&config).await?;
    store.migrate().await?;
    Ok(store)
}

fn new_item(quantity: i64, price: i64) -> NewItem {
    NewItem {
        price,
        remaining_quantity: quantity,
        description: "Anchor chain".to_string(),
        image_url: String::new(),
    }
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn cart_and_order_round_trip() -> anyhow::Result<()> {
    let service = MarketService::new(connect().await?);
    let item = service.list_item(UserId::new(), new_item(5, 1250)).await?;
    let buyer = UserId::new();
    let address = service.add_address(buyer, NewAddress::default()).await?;

    service
        .add_to_cart(buyer, AddToCart { item_id: item.id, quantity: 2 })
        .await?;
    let err = service
        .update_cart(buyer, UpdateCart { item_id: item.id, quantity: 6 })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InsufficientStock);
    assert!(err.to_string().contains("3 items remain"));

    let ordered = service
        .place_order(
            buyer,
            PlaceOrder {
                lines: vec![OrderLine {
                    item_id: item.id,
                    address_id: address.id,
                    quantity: 2,
                }],
            },
        )
        .await?;
    assert_eq!(ordered[0].price, 1250);

    let audit = service.stock_audit(item.id).await?;
    assert_eq!((audit.remaining, audit.reserved, audit.ordered), (3, 0, 2));
    Ok(())
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn stock_constraint_refuses_negative_remaining() -> anyhow::Result<()> {
    let store = connect().await?;
    let service = MarketService::new(store.clone());
    let item = service.list_item(UserId::new(), new_item(1, 10)).await?;

    let mut tx = store.begin().await?;
    let err = tx.adjust_remaining(item.id, -2).await.unwrap_err();
    assert!(matches!(err, StoreError::StockExhausted(_)), "{err:?}");
    tx.rollback().await?;

    assert_eq!(service.stock_audit(item.id).await?.remaining, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires DATABASE_URL"]
async fn concurrent_buyers_never_oversell() -> anyhow::Result<()> {
    let service = Arc::new(MarketService::new(connect().await?));
    let item = service.list_item(UserId::new(), new_item(3, 10)).await?;
    let item_id = item.id;

    let mut handles = Vec::new();
    for _ in 0..10 {
        let service = service.clone();
        handles.push(tokio::spawn(async move {
            service
                .add_to_cart(UserId::new(), AddToCart { item_id, quantity: 1 })
                .await
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await?.is_ok() {
            winners += 1;
        }
    }
    assert_eq!(winners, 3);

    let audit = service.stock_audit(item_id).await?;
    assert!(audit.is_conserved(3));
    assert_eq!(audit.remaining, 0);
    Ok(())
}
