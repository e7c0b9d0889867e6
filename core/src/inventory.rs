//! Transactional inventory store.
//!
//! The stock adjuster needs exactly one primitive from the store: lock a
//! product row for the rest of the transaction, read its stock, write the new
//! stock, then commit or roll back everything at once. Dropping a transaction
//! without committing must behave like a rollback.
//!
//! The store also keeps a ledger of sales whose adjustments were committed
//! ([`InventoryTransaction::claim_sale`]) so replayed events can be detected.

use crate::event::{ProductId, SaleId};
use std::future::Future;
use thiserror::Error;

/// Errors raised by an inventory store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StockError {
    /// The database rejected a statement.
    #[error("Database error: {0}")]
    Database(String),

    /// Beginning, committing or rolling back failed.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// The new stock does not fit the stock column.
    #[error("Stock of product {product_id} overflows: {stock} + {delta}")]
    Overflow {
        /// Product whose stock would overflow
        product_id: ProductId,
        /// Stock before the change
        stock: i64,
        /// Signed change that was refused
        delta: i64,
    },
}

/// A store of per-product stock levels.
pub trait InventoryStore: Send + Sync {
    /// Transaction handle returned by [`begin`](Self::begin).
    type Transaction: InventoryTransaction;

    /// Open a transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StockError::Transaction`] if no connection is available.
    fn begin(&self) -> impl Future<Output = Result<Self::Transaction, StockError>> + Send;

    /// Read the committed stock of a product without locking.
    ///
    /// # Errors
    ///
    /// Returns [`StockError::Database`] if the query fails.
    fn stock_level(
        &self,
        product_id: ProductId,
    ) -> impl Future<Output = Result<Option<i64>, StockError>> + Send;
}

/// One open inventory transaction.
pub trait InventoryTransaction: Send {
    /// Lock the product row until the transaction ends and return its stock.
    ///
    /// Returns `Ok(None)` if the product does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StockError::Database`] if the row cannot be locked.
    fn lock_stock(
        &mut self,
        product_id: ProductId,
    ) -> impl Future<Output = Result<Option<i64>, StockError>> + Send;

    /// Overwrite the stock of a row previously locked by this transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StockError::Database`] if the update fails.
    fn write_stock(
        &mut self,
        product_id: ProductId,
        stock: i64,
    ) -> impl Future<Output = Result<(), StockError>> + Send;

    /// Record that this transaction applies `sale_id`.
    ///
    /// Returns `Ok(false)` when the sale was already applied by a committed
    /// transaction. The claim is released if this transaction rolls back.
    ///
    /// # Errors
    ///
    /// Returns [`StockError::Database`] if the ledger cannot be written.
    fn claim_sale(
        &mut self,
        sale_id: SaleId,
    ) -> impl Future<Output = Result<bool, StockError>> + Send;

    /// Make every change of this transaction durable and release its locks.
    ///
    /// # Errors
    ///
    /// Returns [`StockError::Transaction`] if the commit fails; the changes are
    /// then discarded.
    fn commit(self) -> impl Future<Output = Result<(), StockError>> + Send;

    /// Discard every change of this transaction and release its locks.
    ///
    /// # Errors
    ///
    /// Returns [`StockError::Transaction`] if the rollback could not be sent.
    fn rollback(self) -> impl Future<Output = Result<(), StockError>> + Send;
}
