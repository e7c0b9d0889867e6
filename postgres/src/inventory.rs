//! Inventory store on `products.stock`.
//!
//! Row locks are taken with `SELECT ... FOR UPDATE` inside the adjustment's
//! transaction, so concurrent consumers and direct edits on one product
//! serialize their read-modify-write. A transaction dropped without commit is
//! rolled back by sqlx when its connection returns to the pool.

use sqlx::{PgPool, Postgres, Transaction};
use stocksync_core::event::{ProductId, SaleId};
use stocksync_core::inventory::{InventoryStore, InventoryTransaction, StockError};

/// `PostgreSQL` inventory store.
#[derive(Clone)]
pub struct PostgresInventoryStore {
    pool: PgPool,
}

impl PostgresInventoryStore {
    /// Create a store over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert a product row and return its id.
    ///
    /// # Errors
    ///
    /// Returns [`StockError::Database`] if the insert fails.
    pub async fn insert_product(&self, name: &str, stock: i64) -> Result<ProductId, StockError> {
        let id: i64 = sqlx::query_scalar("INSERT INTO products (name, stock) VALUES ($1, $2) RETURNING id")
            .bind(name)
            .bind(stock)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StockError::Database(format!("Failed to insert product: {e}")))?;
        Ok(ProductId::new(id))
    }
}

impl InventoryStore for PostgresInventoryStore {
    type Transaction = PostgresInventoryTransaction;

    async fn begin(&self) -> Result<PostgresInventoryTransaction, StockError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StockError::Transaction(format!("Failed to start transaction: {e}")))?;
        Ok(PostgresInventoryTransaction { tx })
    }

    async fn stock_level(&self, product_id: ProductId) -> Result<Option<i64>, StockError> {
        sqlx::query_scalar("SELECT stock FROM products WHERE id = $1")
            .bind(product_id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StockError::Database(format!("Failed to read stock: {e}")))
    }
}

/// Open inventory transaction.
pub struct PostgresInventoryTransaction {
    tx: Transaction<'static, Postgres>,
}

impl InventoryTransaction for PostgresInventoryTransaction {
    async fn lock_stock(&mut self, product_id: ProductId) -> Result<Option<i64>, StockError> {
        sqlx::query_scalar("SELECT stock FROM products WHERE id = $1 FOR UPDATE")
            .bind(product_id.get())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| StockError::Database(format!("Failed to lock product {product_id}: {e}")))
    }

    async fn write_stock(&mut self, product_id: ProductId, stock: i64) -> Result<(), StockError> {
        let result = sqlx::query("UPDATE products SET stock = $2 WHERE id = $1")
            .bind(product_id.get())
            .bind(stock)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| {
                StockError::Database(format!("Failed to update stock of product {product_id}: {e}"))
            })?;

        if result.rows_affected() == 0 {
            return Err(StockError::Database(format!(
                "Product {product_id} disappeared while locked"
            )));
        }
        Ok(())
    }

    async fn claim_sale(&mut self, sale_id: SaleId) -> Result<bool, StockError> {
        // Blocks on a concurrent uncommitted claim of the same sale.
        let result = sqlx::query(
            "INSERT INTO applied_sales (sale_id) VALUES ($1) ON CONFLICT (sale_id) DO NOTHING",
        )
        .bind(sale_id.get())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| StockError::Database(format!("Failed to claim sale {sale_id}: {e}")))?;

        Ok(result.rows_affected() == 1)
    }

    async fn commit(self) -> Result<(), StockError> {
        self.tx
            .commit()
            .await
            .map_err(|e| StockError::Transaction(format!("Failed to commit: {e}")))
    }

    async fn rollback(self) -> Result<(), StockError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| StockError::Transaction(format!("Failed to roll back: {e}")))
    }
}
