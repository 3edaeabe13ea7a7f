//! Postgres-backed marketplace storage.
//!
//! Every [`PostgresTx`] wraps one database transaction at the server's default
//! isolation level (READ COMMITTED). Correctness under concurrency comes from
//! row locks rather than from the isolation level:
//!
//! - `find_item` / `find_available` / `find_cart_item` take `FOR UPDATE` locks,
//!   so a second scope touching the same item waits for the first to finish.
//! - `adjust_remaining` is a relative update (`remaining_quantity + $delta`),
//!   never a read-modify-write of a value computed in Rust.
//! - `items_remaining_quantity_non_negative` is the last line of defence: a
//!   write that would leave stock below zero fails inside the statement.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `UniqueViolation` |
//! | Database (foreign key violation) | `23503` | `NotFound` |
//! | Database (check violation on stock) | `23514` | `StockExhausted` |
//! | Database (serialization failure / deadlock) | `40001` / `40P01` | `Serialization` |
//! | Database (other) | Any other | `Database` |
//! | PoolClosed | N/A | `PoolClosed` |
//! | PoolTimedOut | N/A | `Timeout` |
//! | Other | N/A | `Database` |

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::{ConnectOptions, FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{info, instrument};

use shipyard_core::{AddressId, CartItemId, ItemId, OrderedItemId, UserId};
use shipyard_marketplace::{
    Address, CartItem, CartLine, Item, ItemPatch, NewOrderedItem, OrderedItem,
};

use super::{
    AddressBook, CartStore, InventoryStore, MarketTx, OrderLedger, StoreError,
    TransactionCoordinator,
};
use crate::config::StoreConfig;

const SCHEMA: &str = include_str!("../../migrations/0001_marketplace.sql");

const IDLE_TIMEOUT: Duration = Duration::from_secs(600);

const STOCK_CONSTRAINT: &str = "items_remaining_quantity_non_negative";

const ITEM_COLUMNS: &str =
    "id, owner_id, price, remaining_quantity, description, image_url, created_at";

/// Postgres-backed marketplace store.
///
/// Cheap to clone: the pool is reference-counted internally.
#[derive(Debug, Clone)]
pub struct PostgresMarketStore {
    pool: PgPool,
}

impl PostgresMarketStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool sized by `config`.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let mut options = PgConnectOptions::from_str(&config.database_url)
            .map_err(|e| map_sqlx_error("connect", e))?;
        if !config.log_statements {
            options = options.disable_statement_logging();
        }

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout())
            .idle_timeout(IDLE_TIMEOUT)
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;

        info!(
            url = %config.redacted_url(),
            max_connections = config.max_connections,
            "connected to database"
        );
        Ok(Self::new(pool))
    }

    /// Create the marketplace tables if they do not exist yet.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TransactionCoordinator for PostgresMarketStore {
    type Tx = PostgresTx;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;
        Ok(PostgresTx { tx })
    }
}

/// One database transaction. Dropping it without commit rolls back.
pub struct PostgresTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl MarketTx for PostgresTx {
    async fn commit(self) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

#[async_trait]
impl InventoryStore for PostgresTx {
    #[instrument(skip(self), fields(item_id = %item_id), err)]
    async fn find_available(
        &mut self,
        item_id: ItemId,
        min_quantity: i64,
    ) -> Result<Option<Item>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM items \
             WHERE id = $1 AND remaining_quantity >= $2 \
             FOR UPDATE"
        ))
        .bind(item_id.as_uuid())
        .bind(min_quantity)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("find_available", e))?;

        row.map(|r| decode::<ItemRow>(&r, "find_available").map(Item::from))
            .transpose()
    }

    #[instrument(skip(self), fields(item_id = %item_id), err)]
    async fn find_item(&mut self, item_id: ItemId) -> Result<Option<Item>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM items WHERE id = $1 FOR UPDATE"
        ))
        .bind(item_id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("find_item", e))?;

        row.map(|r| decode::<ItemRow>(&r, "find_item").map(Item::from))
            .transpose()
    }

    #[instrument(skip(self), fields(item_id = %item_id), err)]
    async fn adjust_remaining(
        &mut self,
        item_id: ItemId,
        delta: i64,
    ) -> Result<Item, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE items SET remaining_quantity = remaining_quantity + $2 \
             WHERE id = $1 \
             RETURNING {ITEM_COLUMNS}"
        ))
        .bind(item_id.as_uuid())
        .bind(delta)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("adjust_remaining", e))?
        .ok_or(StoreError::NotFound("item"))?;

        decode::<ItemRow>(&row, "adjust_remaining").map(Item::from)
    }

    #[instrument(skip(self, item), fields(item_id = %item.id), err)]
    async fn insert_item(&mut self, item: &Item) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO items
                (id, owner_id, price, remaining_quantity, description, image_url, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(item.id.as_uuid())
        .bind(item.owner.as_uuid())
        .bind(item.price)
        .bind(item.remaining_quantity)
        .bind(&item.description)
        .bind(&item.image_url)
        .bind(item.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_item", e))?;
        Ok(())
    }

    #[instrument(skip(self, patch), fields(item_id = %item_id), err)]
    async fn update_item_details(
        &mut self,
        item_id: ItemId,
        owner: UserId,
        patch: &ItemPatch,
    ) -> Result<Option<Item>, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE items SET \
                 price = COALESCE($3, price), \
                 description = COALESCE($4, description), \
                 image_url = COALESCE($5, image_url) \
             WHERE id = $1 AND owner_id = $2 \
             RETURNING {ITEM_COLUMNS}"
        ))
        .bind(item_id.as_uuid())
        .bind(owner.as_uuid())
        .bind(patch.price)
        .bind(patch.description.as_deref())
        .bind(patch.image_url.as_deref())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update_item_details", e))?;

        row.map(|r| decode::<ItemRow>(&r, "update_item_details").map(Item::from))
            .transpose()
    }

    async fn list_items(&mut self) -> Result<Vec<Item>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM items ORDER BY created_at ASC, id ASC"
        ))
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("list_items", e))?;

        rows.iter()
            .map(|r| decode::<ItemRow>(r, "list_items").map(Item::from))
            .collect()
    }
}

#[async_trait]
impl CartStore for PostgresTx {
    #[instrument(skip(self), fields(user_id = %user_id, item_id = %item_id), err)]
    async fn find_cart_item(
        &mut self,
        user_id: UserId,
        item_id: ItemId,
    ) -> Result<Option<CartItem>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, item_id, quantity, created_at
            FROM cart_items
            WHERE user_id = $1 AND item_id = $2
            FOR UPDATE
            "#,
        )
        .bind(user_id.as_uuid())
        .bind(item_id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("find_cart_item", e))?;

        row.map(|r| decode::<CartItemRow>(&r, "find_cart_item").map(CartItem::from))
            .transpose()
    }

    #[instrument(skip(self), fields(user_id = %user_id, item_id = %item_id), err)]
    async fn create_cart_item(
        &mut self,
        user_id: UserId,
        item_id: ItemId,
        quantity: i64,
    ) -> Result<CartItem, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO cart_items (id, user_id, item_id, quantity, created_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, user_id, item_id, quantity, created_at
            "#,
        )
        .bind(CartItemId::new().as_uuid())
        .bind(user_id.as_uuid())
        .bind(item_id.as_uuid())
        .bind(quantity)
        .bind(Utc::now())
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("create_cart_item", e))?;

        decode::<CartItemRow>(&row, "create_cart_item").map(CartItem::from)
    }

    async fn set_cart_quantity(
        &mut self,
        cart_item_id: CartItemId,
        quantity: i64,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE cart_items SET quantity = $2 WHERE id = $1")
            .bind(cart_item_id.as_uuid())
            .bind(quantity)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("set_cart_quantity", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("cart item"));
        }
        Ok(())
    }

    async fn delete_cart_item(&mut self, cart_item_id: CartItemId) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM cart_items WHERE id = $1")
            .bind(cart_item_id.as_uuid())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("delete_cart_item", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("cart item"));
        }
        Ok(())
    }

    async fn list_cart(&mut self, user_id: UserId) -> Result<Vec<CartLine>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT item_id, quantity
            FROM cart_items
            WHERE user_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(user_id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("list_cart", e))?;

        rows.iter()
            .map(|r| {
                let item_id: uuid::Uuid = r
                    .try_get("item_id")
                    .map_err(|e| map_sqlx_error("list_cart", e))?;
                let quantity: i64 = r
                    .try_get("quantity")
                    .map_err(|e| map_sqlx_error("list_cart", e))?;
                Ok(CartLine {
                    item_id: ItemId::from_uuid(item_id),
                    quantity,
                })
            })
            .collect()
    }

    async fn reserved_quantity(&mut self, item_id: ItemId) -> Result<i64, StoreError> {
        sqlx::query_scalar::<_, i64>(
            "SELECT COALESCE(SUM(quantity), 0)::BIGINT FROM cart_items WHERE item_id = $1",
        )
        .bind(item_id.as_uuid())
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("reserved_quantity", e))
    }
}

#[async_trait]
impl OrderLedger for PostgresTx {
    #[instrument(skip(self, row), fields(user_id = %row.user_id, item_id = %row.item_id), err)]
    async fn create_ordered_item(
        &mut self,
        row: NewOrderedItem,
    ) -> Result<OrderedItem, StoreError> {
        let ordered = row.into_ordered_item(OrderedItemId::new(), Utc::now());

        sqlx::query(
            r#"
            INSERT INTO ordered_items
                (id, user_id, item_id, address_id, quantity, price, delivered, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(ordered.id.as_uuid())
        .bind(ordered.user_id.as_uuid())
        .bind(ordered.item_id.as_uuid())
        .bind(ordered.address_id.as_uuid())
        .bind(ordered.quantity)
        .bind(ordered.price)
        .bind(ordered.delivered)
        .bind(ordered.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("create_ordered_item", e))?;

        Ok(ordered)
    }

    async fn list_orders(&mut self, user_id: UserId) -> Result<Vec<OrderedItem>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, item_id, address_id, quantity, price, delivered, created_at
            FROM ordered_items
            WHERE user_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(user_id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("list_orders", e))?;

        rows.iter()
            .map(|r| decode::<OrderedItemRow>(r, "list_orders").map(OrderedItem::from))
            .collect()
    }

    async fn ordered_quantity(&mut self, item_id: ItemId) -> Result<i64, StoreError> {
        sqlx::query_scalar::<_, i64>(
            "SELECT COALESCE(SUM(quantity), 0)::BIGINT FROM ordered_items WHERE item_id = $1",
        )
        .bind(item_id.as_uuid())
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("ordered_quantity", e))
    }
}

#[async_trait]
impl AddressBook for PostgresTx {
    async fn insert_address(&mut self, address: &Address) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO addresses
                (id, user_id, line1, line2, line3, country, state, city, zip, phone, notes)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(address.id.as_uuid())
        .bind(address.user_id.as_uuid())
        .bind(&address.line1)
        .bind(&address.line2)
        .bind(&address.line3)
        .bind(&address.country)
        .bind(&address.state)
        .bind(&address.city)
        .bind(&address.zip)
        .bind(&address.phone)
        .bind(&address.notes)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_address", e))?;
        Ok(())
    }

    async fn find_address(
        &mut self,
        user_id: UserId,
        address_id: AddressId,
    ) -> Result<Option<Address>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, line1, line2, line3, country, state, city, zip, phone, notes
            FROM addresses
            WHERE id = $1 AND user_id = $2
            "#,
        )
        .bind(address_id.as_uuid())
        .bind(user_id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("find_address", e))?;

        row.map(|r| decode::<AddressRow>(&r, "find_address").map(Address::from))
            .transpose()
    }
}

fn decode<T>(row: &PgRow, operation: &str) -> Result<T, StoreError>
where
    T: for<'r> FromRow<'r, PgRow>,
{
    T::from_row(row)
        .map_err(|e| StoreError::Database(format!("failed to decode row in {operation}: {e}")))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());

            match db_err.code().as_deref() {
                Some("23505") => StoreError::UniqueViolation(msg),
                Some("23503") => StoreError::NotFound("referenced record"),
                Some("23514") if db_err.constraint() == Some(STOCK_CONSTRAINT) => {
                    StoreError::StockExhausted(msg)
                }
                Some("40001") | Some("40P01") => StoreError::Serialization(msg),
                _ => StoreError::Database(msg),
            }
        }
        sqlx::Error::PoolClosed => StoreError::PoolClosed,
        sqlx::Error::PoolTimedOut => {
            StoreError::Timeout(format!("waiting for a connection in {operation}"))
        }
        _ => StoreError::Database(format!("sqlx error in {}: {}", operation, err)),
    }
}

// SQLx row types

#[derive(Debug)]
struct ItemRow {
    id: uuid::Uuid,
    owner_id: uuid::Uuid,
    price: i64,
    remaining_quantity: i64,
    description: String,
    image_url: String,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for ItemRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(ItemRow {
            id: row.try_get("id")?,
            owner_id: row.try_get("owner_id")?,
            price: row.try_get("price")?,
            remaining_quantity: row.try_get("remaining_quantity")?,
            description: row.try_get("description")?,
            image_url: row.try_get("image_url")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl From<ItemRow> for Item {
    fn from(row: ItemRow) -> Self {
        Item {
            id: ItemId::from_uuid(row.id),
            owner: UserId::from_uuid(row.owner_id),
            price: row.price,
            remaining_quantity: row.remaining_quantity,
            description: row.description,
            image_url: row.image_url,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug)]
struct CartItemRow {
    id: uuid::Uuid,
    user_id: uuid::Uuid,
    item_id: uuid::Uuid,
    quantity: i64,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for CartItemRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(CartItemRow {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            item_id: row.try_get("item_id")?,
            quantity: row.try_get("quantity")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl From<CartItemRow> for CartItem {
    fn from(row: CartItemRow) -> Self {
        CartItem {
            id: CartItemId::from_uuid(row.id),
            user_id: UserId::from_uuid(row.user_id),
            item_id: ItemId::from_uuid(row.item_id),
            quantity: row.quantity,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug)]
struct OrderedItemRow {
    id: uuid::Uuid,
    user_id: uuid::Uuid,
    item_id: uuid::Uuid,
    address_id: uuid::Uuid,
    quantity: i64,
    price: i64,
    delivered: bool,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for OrderedItemRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(OrderedItemRow {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            item_id: row.try_get("item_id")?,
            address_id: row.try_get("address_id")?,
            quantity: row.try_get("quantity")?,
            price: row.try_get("price")?,
            delivered: row.try_get("delivered")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl From<OrderedItemRow> for OrderedItem {
    fn from(row: OrderedItemRow) -> Self {
        OrderedItem {
            id: OrderedItemId::from_uuid(row.id),
            user_id: UserId::from_uuid(row.user_id),
            item_id: ItemId::from_uuid(row.item_id),
            address_id: AddressId::from_uuid(row.address_id),
            quantity: row.quantity,
            price: row.price,
            delivered: row.delivered,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug)]
struct AddressRow {
    id: uuid::Uuid,
    user_id: uuid::Uuid,
    line1: String,
    line2: String,
    line3: String,
    country: String,
    state: String,
    city: String,
    zip: String,
    phone: String,
    notes: String,
}

impl<'r> FromRow<'r, PgRow> for AddressRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(AddressRow {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            line1: row.try_get("line1")?,
            line2: row.try_get("line2")?,
            line3: row.try_get("line3")?,
            country: row.try_get("country")?,
            state: row.try_get("state")?,
            city: row.try_get("city")?,
            zip: row.try_get("zip")?,
            phone: row.try_get("phone")?,
            notes: row.try_get("notes")?,
        })
    }
}

impl From<AddressRow> for Address {
    fn from(row: AddressRow) -> Self {
        Address {
            id: AddressId::from_uuid(row.id),
            user_id: UserId::from_uuid(row.user_id),
            line1: row.line1,
            line2: row.line2,
            line3: row.line3,
            country: row.country,
            state: row.state,
            city: row.city,
            zip: row.zip,
            phone: row.phone,
            notes: row.notes,
        }
    }
}
