//! `PostgreSQL` stores for stock reconciliation.
//!
//! - [`PostgresInventoryStore`]: row-locked stock adjustments and the
//!   applied-sales ledger
//! - [`PostgresSaleStore`]: sales and their line items
//! - [`migrate`]: creates the tables both stores use
//!
//! Queries are checked at runtime (`sqlx::query`), so building the crate does
//! not need a database.
//!
//! # Example
//!
//! ```ignore
//! use stocksync_postgres::{PostgresInventoryStore, connect, migrate};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = connect("postgres://localhost/inventario", 10).await?;
//!     migrate(&pool).await?;
//!     let store = PostgresInventoryStore::new(pool);
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod inventory;
mod sales;

pub use inventory::{PostgresInventoryStore, PostgresInventoryTransaction};
pub use sales::PostgresSaleStore;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Open a connection pool.
///
/// # Errors
///
/// Returns the driver error if no connection can be established.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}

/// Create or upgrade the schema.
///
/// # Errors
///
/// Returns the migration error if any migration fails.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("Database migrations applied");
    Ok(())
}
