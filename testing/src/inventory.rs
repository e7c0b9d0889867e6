//! In-memory inventory store with real row locks.
//!
//! Each product has an async mutex standing in for the row lock. A
//! transaction holds the owned guards of every row it locked and stages its
//! writes; commit publishes the staged values, while rollback or drop simply
//! discards them. Sale claims use the same scheme so two transactions claiming
//! one sale serialize like a primary key insert would.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use stocksync_core::event::{ProductId, SaleId};
use stocksync_core::inventory::{InventoryStore, InventoryTransaction, StockError};
use tokio::sync::{Mutex as RowLock, OwnedMutexGuard};

#[derive(Default)]
struct Tables {
    stock: HashMap<ProductId, i64>,
    row_locks: HashMap<ProductId, Arc<RowLock<()>>>,
    applied_sales: HashSet<SaleId>,
    sale_locks: HashMap<SaleId, Arc<RowLock<()>>>,
    failing_products: HashSet<ProductId>,
    fail_commits: bool,
}

/// Inventory store double.
#[derive(Clone, Default)]
pub struct InMemoryInventoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl InMemoryInventoryStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A store seeded with `(product, stock)` rows.
    #[must_use]
    pub fn with_products(products: impl IntoIterator<Item = (ProductId, i64)>) -> Self {
        let store = Self::new();
        for (product_id, stock) in products {
            store.insert_product(product_id, stock);
        }
        store
    }

    /// Insert or overwrite a product row.
    pub fn insert_product(&self, product_id: ProductId, stock: i64) {
        let mut tables = self.tables.lock().unwrap();
        tables.stock.insert(product_id, stock);
        tables
            .row_locks
            .entry(product_id)
            .or_insert_with(|| Arc::new(RowLock::new(())));
    }

    /// Committed stock of a product.
    #[must_use]
    pub fn stock(&self, product_id: ProductId) -> Option<i64> {
        self.tables.lock().unwrap().stock.get(&product_id).copied()
    }

    /// Whether a committed transaction claimed `sale_id`.
    #[must_use]
    pub fn is_sale_applied(&self, sale_id: SaleId) -> bool {
        self.tables.lock().unwrap().applied_sales.contains(&sale_id)
    }

    /// Transactions holding or waiting for the row lock of `product_id`.
    #[must_use]
    pub fn row_lock_users(&self, product_id: ProductId) -> usize {
        self.tables
            .lock()
            .unwrap()
            .row_locks
            .get(&product_id)
            .map_or(0, |lock| Arc::strong_count(lock) - 1)
    }

    /// Make locking `product_id` fail with a database error.
    pub fn fail_on_lock(&self, product_id: ProductId) {
        self.tables.lock().unwrap().failing_products.insert(product_id);
    }

    /// Make every commit fail.
    pub fn fail_commits(&self, fail: bool) {
        self.tables.lock().unwrap().fail_commits = fail;
    }

    /// Remove every injected failure.
    pub fn clear_failures(&self) {
        let mut tables = self.tables.lock().unwrap();
        tables.failing_products.clear();
        tables.fail_commits = false;
    }
}

impl InventoryStore for InMemoryInventoryStore {
    type Transaction = InMemoryTransaction;

    async fn begin(&self) -> Result<InMemoryTransaction, StockError> {
        Ok(InMemoryTransaction {
            tables: Arc::clone(&self.tables),
            locked: HashMap::new(),
            staged: HashMap::new(),
            claims: Vec::new(),
        })
    }

    async fn stock_level(&self, product_id: ProductId) -> Result<Option<i64>, StockError> {
        Ok(self.stock(product_id))
    }
}

/// Open transaction on an [`InMemoryInventoryStore`].
pub struct InMemoryTransaction {
    tables: Arc<Mutex<Tables>>,
    locked: HashMap<ProductId, OwnedMutexGuard<()>>,
    staged: HashMap<ProductId, i64>,
    claims: Vec<(SaleId, OwnedMutexGuard<()>)>,
}

impl InventoryTransaction for InMemoryTransaction {
    async fn lock_stock(&mut self, product_id: ProductId) -> Result<Option<i64>, StockError> {
        if let Some(stock) = self.staged.get(&product_id) {
            return Ok(Some(*stock));
        }

        let row_lock = {
            let tables = self.tables.lock().unwrap();
            if tables.failing_products.contains(&product_id) {
                return Err(StockError::Database(format!(
                    "could not lock row for product {product_id}"
                )));
            }
            match tables.row_locks.get(&product_id) {
                Some(lock) => Arc::clone(lock),
                None => return Ok(None),
            }
        };

        if !self.locked.contains_key(&product_id) {
            let guard = row_lock.lock_owned().await;
            self.locked.insert(product_id, guard);
        }

        let stock = self.tables.lock().unwrap().stock.get(&product_id).copied();
        Ok(stock)
    }

    async fn write_stock(&mut self, product_id: ProductId, stock: i64) -> Result<(), StockError> {
        if !self.locked.contains_key(&product_id) {
            return Err(StockError::Database(format!(
                "row for product {product_id} is not locked by this transaction"
            )));
        }
        self.staged.insert(product_id, stock);
        Ok(())
    }

    async fn claim_sale(&mut self, sale_id: SaleId) -> Result<bool, StockError> {
        if self.claims.iter().any(|(claimed, _)| *claimed == sale_id) {
            return Ok(false);
        }

        let sale_lock = {
            let mut tables = self.tables.lock().unwrap();
            Arc::clone(
                tables
                    .sale_locks
                    .entry(sale_id)
                    .or_insert_with(|| Arc::new(RowLock::new(()))),
            )
        };
        let guard = sale_lock.lock_owned().await;

        if self.tables.lock().unwrap().applied_sales.contains(&sale_id) {
            return Ok(false);
        }
        self.claims.push((sale_id, guard));
        Ok(true)
    }

    async fn commit(self) -> Result<(), StockError> {
        let mut tables = self.tables.lock().unwrap();
        if tables.fail_commits {
            return Err(StockError::Transaction("commit failed".to_string()));
        }
        for (product_id, stock) in &self.staged {
            tables.stock.insert(*product_id, *stock);
        }
        for (sale_id, _) in &self.claims {
            tables.applied_sales.insert(*sale_id);
        }
        Ok(())
    }

    async fn rollback(self) -> Result<(), StockError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn uncommitted_writes_are_invisible() {
        let store = InMemoryInventoryStore::with_products([(ProductId::new(1), 5)]);

        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.lock_stock(ProductId::new(1)).await.unwrap(), Some(5));
        tx.write_stock(ProductId::new(1), 2).await.unwrap();
        assert_eq!(store.stock(ProductId::new(1)), Some(5));

        drop(tx);
        assert_eq!(store.stock(ProductId::new(1)), Some(5));
    }

    #[tokio::test]
    async fn row_lock_blocks_second_transaction() {
        let store = InMemoryInventoryStore::with_products([(ProductId::new(1), 5)]);

        let mut first = store.begin().await.unwrap();
        first.lock_stock(ProductId::new(1)).await.unwrap();

        let mut second = store.begin().await.unwrap();
        let blocked =
            tokio::time::timeout(Duration::from_millis(20), second.lock_stock(ProductId::new(1)))
                .await;
        assert!(blocked.is_err());

        first.write_stock(ProductId::new(1), 4).await.unwrap();
        first.commit().await.unwrap();
        assert_eq!(second.lock_stock(ProductId::new(1)).await.unwrap(), Some(4));
    }

    #[tokio::test]
    async fn claim_is_released_on_rollback() {
        let store = InMemoryInventoryStore::new();

        let mut tx = store.begin().await.unwrap();
        assert!(tx.claim_sale(SaleId::new(1)).await.unwrap());
        tx.rollback().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert!(tx.claim_sale(SaleId::new(1)).await.unwrap());
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert!(!tx.claim_sale(SaleId::new(1)).await.unwrap());
        assert!(store.is_sale_applied(SaleId::new(1)));
    }
}
