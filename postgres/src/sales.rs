//! Sale store on `sales` and `sale_items`.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use stocksync_core::event::{LineItem, SaleId};
use stocksync_core::sale::{SaleError, SaleReceipt, SaleStore};

/// `PostgreSQL` sale store.
#[derive(Clone)]
pub struct PostgresSaleStore {
    pool: PgPool,
}

impl PostgresSaleStore {
    /// Create a store over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn database(context: &str) -> impl Fn(sqlx::Error) -> SaleError + '_ {
    move |e| SaleError::Database(format!("{context}: {e}"))
}

impl SaleStore for PostgresSaleStore {
    async fn record_sale(&self, line_items: &[LineItem]) -> Result<SaleReceipt, SaleError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(database("Failed to start transaction"))?;

        let (id, recorded_at): (i64, DateTime<Utc>) =
            sqlx::query_as("INSERT INTO sales DEFAULT VALUES RETURNING id, recorded_at")
                .fetch_one(&mut *tx)
                .await
                .map_err(database("Failed to insert sale"))?;

        for (line_no, item) in (1_i32..).zip(line_items) {
            sqlx::query(
                "INSERT INTO sale_items (sale_id, line_no, product_id, quantity) VALUES ($1, $2, $3, $4)",
            )
            .bind(id)
            .bind(line_no)
            .bind(item.product_id.get())
            .bind(item.quantity)
            .execute(&mut *tx)
            .await
            .map_err(database("Failed to insert sale item"))?;
        }

        tx.commit().await.map_err(database("Failed to commit sale"))?;

        Ok(SaleReceipt {
            sale_id: SaleId::new(id),
            recorded_at,
        })
    }
}
