//! Cart and order operations.
//!
//! Every public operation runs inside exactly one storage scope:
//!
//! ```text
//! request (UserId + command)
//!   ↓
//! 1. Validate input (no scope opened on failure)
//!   ↓
//! 2. begin()
//!   ↓
//! 3. Read + lock the rows involved, plan the change (pure)
//!   ↓
//! 4. Write the plan, re-check the post-write item
//!   ↓
//! 5. commit() on success, rollback() on any error
//! ```
//!
//! A timeout (if configured) cancels the whole operation; the dropped scope rolls
//! back. Nothing is retried here: [`MarketError::is_retryable`] tells the
//! caller whether retrying makes sense.

use std::future::Future;
use std::time::{Duration, Instant};

use chrono::Utc;
use thiserror::Error;
use tracing::{instrument, warn};

use shipyard_core::{AddressId, DomainError, ItemId, UserId};
use shipyard_marketplace::{
    AddToCart, Address, CartLine, CartLineChange, Item, ItemPatch, NewAddress, NewItem,
    NewOrderedItem, OrderedItem, PlaceOrder, ReservationPlan, StockAudit, UpdateCart,
    ensure_committable, plan_add_to_cart, plan_update_cart,
};
use shipyard_observability::{NoopReporter, OperationReporter};

use crate::store::{
    AddressBook, CartStore, InventoryStore, MarketTx, OrderLedger, StoreError,
    TransactionCoordinator,
};

/// Stable classification of a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    InsufficientStock,
    Conflict,
    NotFound,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::InsufficientStock => "insufficient_stock",
            ErrorKind::Conflict => "conflict",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Internal => "internal",
        }
    }

    /// HTTP status a transport layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            ErrorKind::Validation | ErrorKind::InsufficientStock => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict | ErrorKind::Internal => 500,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MarketError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("insufficient stock: {0}")]
    InsufficientStock(String),

    /// A concurrent commit won the race for the same units.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("internal error: {0}")]
    Internal(String),
}

impl MarketError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MarketError::Validation(_) => ErrorKind::Validation,
            MarketError::InsufficientStock(_) => ErrorKind::InsufficientStock,
            MarketError::Conflict(_) => ErrorKind::Conflict,
            MarketError::NotFound(_) => ErrorKind::NotFound,
            MarketError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Only lost races are worth retrying unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MarketError::Conflict(_))
    }
}

impl From<DomainError> for MarketError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) => MarketError::Validation(msg),
            DomainError::InsufficientStock(msg) => MarketError::InsufficientStock(msg),
            DomainError::Conflict(msg) => MarketError::Conflict(msg),
            DomainError::NotFound(what) => MarketError::NotFound(what),
            DomainError::InvalidId(msg) => MarketError::Validation(msg),
        }
    }
}

impl From<StoreError> for MarketError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::UniqueViolation(msg)
            | StoreError::StockExhausted(msg)
            | StoreError::Serialization(msg) => MarketError::Conflict(msg),
            StoreError::NotFound(what) => MarketError::NotFound(what),
            other => MarketError::Internal(other.to_string()),
        }
    }
}

/// The marketplace's transactional operations.
///
/// ## Generic Parameters
///
/// - `C`: storage backend handing out atomic scopes
/// - `R`: observer notified after each operation (defaults to [`NoopReporter`])
#[derive(Debug, Clone)]
pub struct MarketService<C, R = NoopReporter> {
    coordinator: C,
    reporter: R,
    timeout: Option<Duration>,
}

impl<C> MarketService<C, NoopReporter>
where
    C: TransactionCoordinator,
{
    pub fn new(coordinator: C) -> Self {
        Self {
            coordinator,
            reporter: NoopReporter,
            timeout: None,
        }
    }
}

impl<C, R> MarketService<C, R>
where
    C: TransactionCoordinator,
    R: OperationReporter,
{
    pub fn with_reporter<R2: OperationReporter>(self, reporter: R2) -> MarketService<C, R2> {
        MarketService {
            coordinator: self.coordinator,
            reporter,
            timeout: self.timeout,
        }
    }

    /// Bound every operation (including waiting for its scope) by `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn coordinator(&self) -> &C {
        &self.coordinator
    }

    /// Reserve `cmd.quantity` more units of an item in the user's cart.
    #[instrument(
        skip(self, cmd),
        fields(user_id = %user_id, item_id = %cmd.item_id, quantity = cmd.quantity),
        err
    )]
    pub async fn add_to_cart(
        &self,
        user_id: UserId,
        cmd: AddToCart,
    ) -> Result<Vec<CartLine>, MarketError> {
        self.observe("add_to_cart", async {
            cmd.validate()?;
            let mut tx = self.coordinator.begin().await?;
            let result = reserve(&mut tx, user_id, &cmd).await;
            settle(tx, result).await
        })
        .await
    }

    /// Set the user's cart line for an item to `cmd.quantity`, releasing or
    /// reserving the difference. Zero removes the line.
    #[instrument(
        skip(self, cmd),
        fields(user_id = %user_id, item_id = %cmd.item_id, quantity = cmd.quantity),
        err
    )]
    pub async fn update_cart(
        &self,
        user_id: UserId,
        cmd: UpdateCart,
    ) -> Result<Vec<CartLine>, MarketError> {
        self.observe("update_cart", async {
            cmd.validate()?;
            let mut tx = self.coordinator.begin().await?;
            let result = adjust_reservation(&mut tx, user_id, &cmd).await;
            settle(tx, result).await
        })
        .await
    }

    /// Turn cart reservations into purchases, all lines or none.
    #[instrument(skip(self, cmd), fields(user_id = %user_id, lines = cmd.lines.len()), err)]
    pub async fn place_order(
        &self,
        user_id: UserId,
        cmd: PlaceOrder,
    ) -> Result<Vec<OrderedItem>, MarketError> {
        let ordered = self
            .observe("place_order", async {
                cmd.validate()?;
                let mut tx = self.coordinator.begin().await?;
                let result = purchase(&mut tx, user_id, &cmd).await;
                settle(tx, result).await
            })
            .await?;

        self.reporter.purchases_recorded(ordered.len());
        Ok(ordered)
    }

    #[instrument(skip(self, new_item), fields(owner = %owner), err)]
    pub async fn list_item(&self, owner: UserId, new_item: NewItem) -> Result<Item, MarketError> {
        let item = self
            .observe("list_item", async {
                new_item.validate()?;
                let item = new_item.into_item(ItemId::new(), owner, Utc::now());
                let mut tx = self.coordinator.begin().await?;
                let result = tx.insert_item(&item).await.map_err(MarketError::from);
                settle(tx, result).await?;
                Ok(item)
            })
            .await?;

        self.reporter.item_listed();
        Ok(item)
    }

    /// Edit price or presentation of an item the caller owns. Items owned by
    /// someone else are reported as not found.
    #[instrument(skip(self, patch), fields(owner = %owner, item_id = %item_id), err)]
    pub async fn update_item(
        &self,
        owner: UserId,
        item_id: ItemId,
        patch: ItemPatch,
    ) -> Result<Item, MarketError> {
        self.observe("update_item", async {
            patch.validate()?;
            if patch.is_empty() {
                return Err(MarketError::Validation("nothing to update".to_string()));
            }
            let mut tx = self.coordinator.begin().await?;
            let result = match tx.update_item_details(item_id, owner, &patch).await {
                Ok(Some(item)) => Ok(item),
                Ok(None) => Err(MarketError::NotFound("item")),
                Err(err) => Err(err.into()),
            };
            settle(tx, result).await
        })
        .await
    }

    pub async fn list_items(&self) -> Result<Vec<Item>, MarketError> {
        self.observe("list_items", async {
            let mut tx = self.coordinator.begin().await?;
            let result = tx.list_items().await.map_err(MarketError::from);
            settle(tx, result).await
        })
        .await
    }

    pub async fn list_cart(&self, user_id: UserId) -> Result<Vec<CartLine>, MarketError> {
        self.observe("list_cart", async {
            let mut tx = self.coordinator.begin().await?;
            let result = tx.list_cart(user_id).await.map_err(MarketError::from);
            settle(tx, result).await
        })
        .await
    }

    pub async fn list_orders(&self, user_id: UserId) -> Result<Vec<OrderedItem>, MarketError> {
        self.observe("list_orders", async {
            let mut tx = self.coordinator.begin().await?;
            let result = tx.list_orders(user_id).await.map_err(MarketError::from);
            settle(tx, result).await
        })
        .await
    }

    #[instrument(skip(self, new_address), fields(user_id = %user_id), err)]
    pub async fn add_address(
        &self,
        user_id: UserId,
        new_address: NewAddress,
    ) -> Result<Address, MarketError> {
        self.observe("add_address", async {
            let address = new_address.into_address(AddressId::new(), user_id);
            let mut tx = self.coordinator.begin().await?;
            let result = tx.insert_address(&address).await.map_err(MarketError::from);
            settle(tx, result).await?;
            Ok(address)
        })
        .await
    }

    /// Remaining, reserved and ordered units of an item, read in one scope.
    #[instrument(skip(self), fields(item_id = %item_id), err)]
    pub async fn stock_audit(&self, item_id: ItemId) -> Result<StockAudit, MarketError> {
        self.observe("stock_audit", async {
            let mut tx = self.coordinator.begin().await?;
            let result = audit(&mut tx, item_id).await;
            settle(tx, result).await
        })
        .await
    }

    async fn observe<T, F>(&self, operation: &'static str, fut: F) -> Result<T, MarketError>
    where
        F: Future<Output = Result<T, MarketError>>,
    {
        let started = Instant::now();
        let result = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(result) => result,
                Err(_) => Err(MarketError::Internal(format!(
                    "transaction timed out after {}ms",
                    limit.as_millis()
                ))),
            },
            None => fut.await,
        };

        self.reporter.transaction_latency(operation, started.elapsed());
        if let Err(err) = &result {
            self.reporter.operation_failed(operation, err.kind().as_str());
        }
        result
    }
}

/// Commit on success; otherwise roll back and hand back the operation error.
async fn settle<Tx, T>(tx: Tx, result: Result<T, MarketError>) -> Result<T, MarketError>
where
    Tx: MarketTx,
{
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, cause = %err, "rollback failed");
            }
            Err(err)
        }
    }
}

async fn reserve<Tx: MarketTx>(
    tx: &mut Tx,
    user_id: UserId,
    cmd: &AddToCart,
) -> Result<Vec<CartLine>, MarketError> {
    let item = tx
        .find_available(cmd.item_id, cmd.quantity)
        .await?
        .ok_or_else(|| DomainError::insufficient_stock("not enough items left"))?;
    let existing = tx.find_cart_item(user_id, item.id).await?;

    let plan = plan_add_to_cart(&item, existing.as_ref(), cmd.quantity)?;
    apply_plan(tx, user_id, item.id, &plan).await?;

    Ok(tx.list_cart(user_id).await?)
}

async fn adjust_reservation<Tx: MarketTx>(
    tx: &mut Tx,
    user_id: UserId,
    cmd: &UpdateCart,
) -> Result<Vec<CartLine>, MarketError> {
    // Item first: it is the row other users contend on.
    let item = tx
        .find_item(cmd.item_id)
        .await?
        .ok_or(MarketError::NotFound("item"))?;
    let cart_item = tx
        .find_cart_item(user_id, item.id)
        .await?
        .ok_or(MarketError::NotFound("cart item"))?;

    let plan = plan_update_cart(&item, &cart_item, cmd.quantity)?;
    if !plan.is_noop() {
        apply_plan(tx, user_id, item.id, &plan).await?;
    }

    Ok(tx.list_cart(user_id).await?)
}

async fn apply_plan<Tx: MarketTx>(
    tx: &mut Tx,
    user_id: UserId,
    item_id: ItemId,
    plan: &ReservationPlan,
) -> Result<(), MarketError> {
    match plan.line {
        CartLineChange::Keep => {}
        CartLineChange::Create { quantity } => {
            tx.create_cart_item(user_id, item_id, quantity).await?;
        }
        CartLineChange::SetQuantity {
            cart_item_id,
            quantity,
        } => tx.set_cart_quantity(cart_item_id, quantity).await?,
        CartLineChange::Remove { cart_item_id } => tx.delete_cart_item(cart_item_id).await?,
    }

    if plan.stock_delta != 0 {
        let after = tx.adjust_remaining(item_id, plan.stock_delta).await?;
        ensure_committable(&after)?;
    }
    Ok(())
}

async fn purchase<Tx: MarketTx>(
    tx: &mut Tx,
    user_id: UserId,
    cmd: &PlaceOrder,
) -> Result<Vec<OrderedItem>, MarketError> {
    // Lock every item up front in id order so two orders over the same items
    // cannot deadlock.
    let mut item_ids: Vec<ItemId> = cmd.lines.iter().map(|l| l.item_id).collect();
    item_ids.sort();
    item_ids.dedup();

    let mut items = Vec::with_capacity(item_ids.len());
    for item_id in item_ids {
        let item = tx
            .find_item(item_id)
            .await?
            .ok_or(MarketError::NotFound("item"))?;
        items.push(item);
    }

    let mut ordered = Vec::with_capacity(cmd.lines.len());
    for line in &cmd.lines {
        let item = items
            .iter()
            .find(|i| i.id == line.item_id)
            .ok_or(MarketError::NotFound("item"))?;
        let cart_item = tx
            .find_cart_item(user_id, line.item_id)
            .await?
            .ok_or(MarketError::NotFound("cart item"))?;
        let address = tx
            .find_address(user_id, line.address_id)
            .await?
            .ok_or(MarketError::NotFound("address"))?;

        let row = NewOrderedItem::freeze(line, &cart_item, item, &address)?;
        ordered.push(tx.create_ordered_item(row).await?);
        tx.delete_cart_item(cart_item.id).await?;
    }

    Ok(ordered)
}

async fn audit<Tx: MarketTx>(tx: &mut Tx, item_id: ItemId) -> Result<StockAudit, MarketError> {
    let item = tx
        .find_item(item_id)
        .await?
        .ok_or(MarketError::NotFound("item"))?;
    let reserved = tx.reserved_quantity(item_id).await?;
    let ordered = tx.ordered_quantity(item_id).await?;

    Ok(StockAudit {
        item_id,
        remaining: item.remaining_quantity,
        reserved,
        ordered,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_stable_statuses() {
        assert_eq!(ErrorKind::Validation.status_code(), 400);
        assert_eq!(ErrorKind::InsufficientStock.status_code(), 400);
        assert_eq!(ErrorKind::NotFound.status_code(), 404);
        assert_eq!(ErrorKind::Conflict.status_code(), 500);
        assert_eq!(ErrorKind::Internal.status_code(), 500);
    }

    #[test]
    fn domain_errors_keep_their_kind() {
        let err: MarketError = DomainError::insufficient_stock("not enough items left").into();
        assert_eq!(err.kind(), ErrorKind::InsufficientStock);
        assert_eq!(err.to_string(), "insufficient stock: not enough items left");

        let err: MarketError = DomainError::invalid_id("ItemId: bad").into();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn storage_races_become_conflicts() {
        let err: MarketError = StoreError::StockExhausted("items".to_string()).into();
        assert!(err.is_retryable());
        let err: MarketError = StoreError::UniqueViolation("cart_items".to_string()).into();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        let err: MarketError = StoreError::PoolClosed.into();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(!err.is_retryable());
    }
}
