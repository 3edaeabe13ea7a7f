//! Concurrent callers, lost races, cancellation and reporting.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use shipyard_core::{AddressId, CartItemId, ItemId, UserId};
use shipyard_infra::store::InMemoryTx;
use shipyard_infra::{
    AddressBook, CartStore, ErrorKind, InMemoryMarketStore, InventoryStore, MarketError,
    MarketService, MarketTx, OrderLedger, StoreError, TransactionCoordinator,
};
use shipyard_marketplace::{
    AddToCart, Address, CartItem, CartLine, Item, ItemPatch, NewAddress, NewItem,
    NewOrderedItem, OrderLine, OrderedItem, PlaceOrder, UpdateCart,
};
use shipyard_observability::{OperationReporter, TracingReporter};

fn new_item(quantity: i64) -> NewItem {
    NewItem {
        price: 75,
        remaining_quantity: quantity,
        description: "Mooring line".to_string(),
        image_url: String::new(),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn last_unit_goes_to_exactly_one_buyer() {
    let service = Arc::new(MarketService::new(InMemoryMarketStore::new()));
    let item = service.list_item(UserId::new(), new_item(1)).await.unwrap();

    let item_id = item.id;
    let mut handles = Vec::new();
    for _ in 0..8 {
        let service = service.clone();
        handles.push(tokio::spawn(async move {
            service
                .add_to_cart(
                    UserId::new(),
                    AddToCart {
                        item_id,
                        quantity: 1,
                    },
                )
                .await
        }));
    }

    let mut winners = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(cart) => {
                winners += 1;
                assert_eq!(cart, vec![CartLine { item_id: item.id, quantity: 1 }]);
            }
            Err(err) => assert!(
                matches!(err.kind(), ErrorKind::InsufficientStock | ErrorKind::Conflict),
                "unexpected error {err:?}"
            ),
        }
    }
    assert_eq!(winners, 1);

    let audit = service.stock_audit(item.id).await.unwrap();
    assert_eq!(audit.remaining, 0);
    assert_eq!(audit.reserved, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mixed_traffic_conserves_every_item() {
    const LISTED: i64 = 12;

    let service = Arc::new(MarketService::new(InMemoryMarketStore::new()));
    let mut items = Vec::new();
    for _ in 0..3 {
        items.push(service.list_item(UserId::new(), new_item(LISTED)).await.unwrap());
    }
    let items = Arc::new(items);

    let mut handles = Vec::new();
    for worker in 0..10i64 {
        let service = service.clone();
        let items = items.clone();
        handles.push(tokio::spawn(async move {
            let user = UserId::new();
            let address = service.add_address(user, NewAddress::default()).await.unwrap();

            for step in 0..12i64 {
                let item = &items[((worker + step) % 3) as usize];
                match (worker + step) % 4 {
                    0 | 1 => {
                        let _ = service
                            .add_to_cart(
                                user,
                                AddToCart {
                                    item_id: item.id,
                                    quantity: 1 + step % 3,
                                },
                            )
                            .await;
                    }
                    2 => {
                        let _ = service
                            .update_cart(
                                user,
                                UpdateCart {
                                    item_id: item.id,
                                    quantity: step % 4,
                                },
                            )
                            .await;
                    }
                    _ => {
                        let cart = service.list_cart(user).await.unwrap();
                        if let Some(line) = cart.first() {
                            let _ = service
                                .place_order(
                                    user,
                                    PlaceOrder {
                                        lines: vec![OrderLine {
                                            item_id: line.item_id,
                                            address_id: address.id,
                                            quantity: line.quantity,
                                        }],
                                    },
                                )
                                .await;
                        }
                    }
                }
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    for item in items.iter() {
        let audit = service.stock_audit(item.id).await.unwrap();
        assert!(audit.is_conserved(LISTED), "{audit:?}");
    }
}

#[tokio::test]
async fn timed_out_operation_leaves_no_effect() {
    let store = InMemoryMarketStore::new();
    let service = MarketService::new(store.clone()).with_timeout(Duration::from_millis(50));
    let item = service.list_item(UserId::new(), new_item(3)).await.unwrap();
    let buyer = UserId::new();

    let held = store.begin().await.unwrap();
    let err = service
        .add_to_cart(
            buyer,
            AddToCart {
                item_id: item.id,
                quantity: 1,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Internal);
    assert!(err.to_string().contains("timed out"), "{err}");
    drop(held);

    assert!(service.list_cart(buyer).await.unwrap().is_empty());
    assert_eq!(service.stock_audit(item.id).await.unwrap().remaining, 3);
}

#[tokio::test]
async fn dropped_operation_future_rolls_back() {
    let store = InMemoryMarketStore::new();
    let service = MarketService::new(store.clone());
    let item = service.list_item(UserId::new(), new_item(2)).await.unwrap();

    let mut tx = store.begin().await.unwrap();
    tx.adjust_remaining(item.id, -2).await.unwrap();
    tx.create_cart_item(UserId::new(), item.id, 2).await.unwrap();
    drop(tx);

    let audit = service.stock_audit(item.id).await.unwrap();
    assert_eq!(audit.remaining, 2);
    assert_eq!(audit.reserved, 0);
}

/// Storage whose stock reads lag behind: `find_available` and `find_item`
/// report more units than are actually left, as if another scope committed
/// right after the read.
#[derive(Clone, Default)]
struct StaleReads {
    inner: InMemoryMarketStore,
}

struct StaleTx(InMemoryTx);

const PHANTOM_UNITS: i64 = 10;

#[async_trait]
impl TransactionCoordinator for StaleReads {
    type Tx = StaleTx;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        Ok(StaleTx(self.inner.begin().await?))
    }
}

#[async_trait]
impl MarketTx for StaleTx {
    async fn commit(self) -> Result<(), StoreError> {
        self.0.commit().await
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.0.rollback().await
    }
}

#[async_trait]
impl InventoryStore for StaleTx {
    async fn find_available(
        &mut self,
        item_id: ItemId,
        min_quantity: i64,
    ) -> Result<Option<Item>, StoreError> {
        Ok(self
            .find_item(item_id)
            .await?
            .filter(|item| item.has_available(min_quantity)))
    }

    async fn find_item(&mut self, item_id: ItemId) -> Result<Option<Item>, StoreError> {
        Ok(self.0.find_item(item_id).await?.map(|mut item| {
            item.remaining_quantity += PHANTOM_UNITS;
            item
        }))
    }

    async fn adjust_remaining(&mut self, item_id: ItemId, delta: i64) -> Result<Item, StoreError> {
        self.0.adjust_remaining(item_id, delta).await
    }

    async fn insert_item(&mut self, item: &Item) -> Result<(), StoreError> {
        self.0.insert_item(item).await
    }

    async fn update_item_details(
        &mut self,
        item_id: ItemId,
        owner: UserId,
        patch: &ItemPatch,
    ) -> Result<Option<Item>, StoreError> {
        self.0.update_item_details(item_id, owner, patch).await
    }

    async fn list_items(&mut self) -> Result<Vec<Item>, StoreError> {
        self.0.list_items().await
    }
}

#[async_trait]
impl CartStore for StaleTx {
    async fn find_cart_item(
        &mut self,
        user_id: UserId,
        item_id: ItemId,
    ) -> Result<Option<CartItem>, StoreError> {
        self.0.find_cart_item(user_id, item_id).await
    }

    async fn create_cart_item(
        &mut self,
        user_id: UserId,
        item_id: ItemId,
        quantity: i64,
    ) -> Result<CartItem, StoreError> {
        self.0.create_cart_item(user_id, item_id, quantity).await
    }

    async fn set_cart_quantity(
        &mut self,
        cart_item_id: CartItemId,
        quantity: i64,
    ) -> Result<(), StoreError> {
        self.0.set_cart_quantity(cart_item_id, quantity).await
    }

    async fn delete_cart_item(&mut self, cart_item_id: CartItemId) -> Result<(), StoreError> {
        self.0.delete_cart_item(cart_item_id).await
    }

    async fn list_cart(&mut self, user_id: UserId) -> Result<Vec<CartLine>, StoreError> {
        self.0.list_cart(user_id).await
    }

    async fn reserved_quantity(&mut self, item_id: ItemId) -> Result<i64, StoreError> {
        self.0.reserved_quantity(item_id).await
    }
}

#[async_trait]
impl OrderLedger for StaleTx {
    async fn create_ordered_item(
        &mut self,
        row: NewOrderedItem,
    ) -> Result<OrderedItem, StoreError> {
        self.0.create_ordered_item(row).await
    }

    async fn list_orders(&mut self, user_id: UserId) -> Result<Vec<OrderedItem>, StoreError> {
        self.0.list_orders(user_id).await
    }

    async fn ordered_quantity(&mut self, item_id: ItemId) -> Result<i64, StoreError> {
        self.0.ordered_quantity(item_id).await
    }
}

#[async_trait]
impl AddressBook for StaleTx {
    async fn insert_address(&mut self, address: &Address) -> Result<(), StoreError> {
        self.0.insert_address(address).await
    }

    async fn find_address(
        &mut self,
        user_id: UserId,
        address_id: AddressId,
    ) -> Result<Option<Address>, StoreError> {
        self.0.find_address(user_id, address_id).await
    }
}

#[tokio::test]
async fn lost_race_is_a_conflict_and_writes_nothing() {
    let store = StaleReads::default();
    let service = MarketService::new(store.clone());
    let item = service.list_item(UserId::new(), new_item(1)).await.unwrap();
    let buyer = UserId::new();

    let err = service
        .add_to_cart(
            buyer,
            AddToCart {
                item_id: item.id,
                quantity: 3,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert!(err.is_retryable());
    assert_eq!(err.kind().status_code(), 500);

    let honest = MarketService::new(store.inner.clone());
    assert!(honest.list_cart(buyer).await.unwrap().is_empty());
    let audit = honest.stock_audit(item.id).await.unwrap();
    assert_eq!(audit.remaining, 1);
    assert_eq!(audit.reserved, 0);
}

#[tokio::test]
async fn lost_race_on_update_is_a_conflict() {
    let store = StaleReads::default();
    let honest = MarketService::new(store.inner.clone());
    let item = honest.list_item(UserId::new(), new_item(2)).await.unwrap();
    let buyer = UserId::new();
    honest
        .add_to_cart(
            buyer,
            AddToCart {
                item_id: item.id,
                quantity: 1,
            },
        )
        .await
        .unwrap();

    let err = MarketService::new(store)
        .update_cart(
            buyer,
            UpdateCart {
                item_id: item.id,
                quantity: 4,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    assert_eq!(
        honest.list_cart(buyer).await.unwrap(),
        vec![CartLine { item_id: item.id, quantity: 1 }]
    );
    assert_eq!(honest.stock_audit(item.id).await.unwrap().remaining, 1);
}

#[derive(Default)]
struct Recording {
    listed: Mutex<usize>,
    purchases: Mutex<usize>,
    failures: Mutex<Vec<(&'static str, &'static str)>>,
    timed: Mutex<Vec<&'static str>>,
}

impl OperationReporter for Recording {
    fn item_listed(&self) {
        *self.listed.lock().unwrap() += 1;
    }

    fn purchases_recorded(&self, lines: usize) {
        *self.purchases.lock().unwrap() += lines;
    }

    fn transaction_latency(&self, operation: &'static str, _elapsed: Duration) {
        self.timed.lock().unwrap().push(operation);
    }

    fn operation_failed(&self, operation: &'static str, kind: &'static str) {
        self.failures.lock().unwrap().push((operation, kind));
    }
}

#[tokio::test]
async fn reporter_sees_listings_purchases_and_failures() {
    let reporter = Arc::new(Recording::default());
    let service = MarketService::new(InMemoryMarketStore::new()).with_reporter(reporter.clone());

    let item = service.list_item(UserId::new(), new_item(2)).await.unwrap();
    let buyer = UserId::new();
    let address = service.add_address(buyer, NewAddress::default()).await.unwrap();
    service
        .add_to_cart(
            buyer,
            AddToCart {
                item_id: item.id,
                quantity: 2,
            },
        )
        .await
        .unwrap();
    let err: MarketError = service
        .add_to_cart(
            buyer,
            AddToCart {
                item_id: item.id,
                quantity: 1,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InsufficientStock);

    service
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
        .await
        .unwrap();

    assert_eq!(*reporter.listed.lock().unwrap(), 1);
    assert_eq!(*reporter.purchases.lock().unwrap(), 1);
    assert_eq!(
        *reporter.failures.lock().unwrap(),
        vec![("add_to_cart", "insufficient_stock")]
    );
    assert!(reporter.timed.lock().unwrap().contains(&"place_order"));
}

#[tokio::test]
async fn tracing_reporter_drives_a_full_flow() {
    shipyard_observability::init();
    let service = MarketService::new(InMemoryMarketStore::new()).with_reporter(TracingReporter);

    let item = service.list_item(UserId::new(), new_item(1)).await.unwrap();
    let buyer = UserId::new();
    service
        .add_to_cart(
            buyer,
            AddToCart {
                item_id: item.id,
                quantity: 1,
            },
        )
        .await
        .unwrap();
    let err = service
        .add_to_cart(
            UserId::new(),
            AddToCart {
                item_id: item.id,
                quantity: 1,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InsufficientStock);

    let audit = service.stock_audit(item.id).await.unwrap();
    assert!(audit.is_conserved(1));
    assert_eq!(audit.reserved, 1);
}
