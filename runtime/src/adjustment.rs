//! Stock adjustment transaction.
//!
//! One inventory transaction is opened per delivered sale event:
//!
//! 1. claim the sale id in the applied-sales ledger (when deduplication is on);
//!    a sale that was already applied is acknowledged without touching stock
//! 2. for every well-formed line item, lock the product row until the
//!    transaction ends, then write `stock - quantity` (stock may go negative)
//! 3. malformed items and unknown products are logged and skipped
//! 4. commit; any store error rolls back every adjustment of the message
//!
//! Messages are independent: a rollback only affects the message that caused
//! it.

use crate::metrics::StockMetrics;
use std::sync::Arc;
use stocksync_core::envelope::{LineItemEntry, SaleEnvelope};
use stocksync_core::event::{ProductId, SaleId};
use stocksync_core::inventory::{InventoryStore, InventoryTransaction, StockError};
use thiserror::Error;

/// One committed stock change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StockChange {
    /// Product adjusted
    pub product_id: ProductId,
    /// Units removed
    pub quantity: i64,
    /// Stock before the adjustment
    pub previous: i64,
    /// Stock after the adjustment
    pub current: i64,
}

/// What a committed adjustment did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdjustmentReport {
    /// Sale the adjustment belongs to
    pub sale_id: SaleId,
    /// Applied changes in line item order
    pub applied: Vec<StockChange>,
    /// Items skipped because they failed validation
    pub skipped_malformed: usize,
    /// Items skipped because their product does not exist
    pub missing_products: Vec<ProductId>,
}

impl AdjustmentReport {
    const fn new(sale_id: SaleId) -> Self {
        Self {
            sale_id,
            applied: Vec::new(),
            skipped_malformed: 0,
            missing_products: Vec::new(),
        }
    }

    /// Number of skipped items of either kind.
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.skipped_malformed + self.missing_products.len()
    }
}

/// Result of applying one sale event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdjustmentOutcome {
    /// The adjustments were committed.
    Applied(AdjustmentReport),
    /// The sale was applied before; nothing changed.
    Duplicate(SaleId),
}

/// A sale event whose adjustments were rolled back.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Stock adjustment for sale {sale_id} rolled back: {source}")]
pub struct AdjustmentError {
    /// Sale whose adjustments were discarded
    pub sale_id: SaleId,
    /// Store error that caused the rollback
    #[source]
    pub source: StockError,
}

/// Applies sale events to an [`InventoryStore`].
pub struct StockAdjuster<S> {
    store: Arc<S>,
    deduplicate: bool,
}

impl<S> Clone for StockAdjuster<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            deduplicate: self.deduplicate,
        }
    }
}

impl<S: InventoryStore> StockAdjuster<S> {
    /// Create an adjuster that skips sales it has already applied.
    #[must_use]
    pub const fn new(store: Arc<S>) -> Self {
        Self {
            store,
            deduplicate: true,
        }
    }

    /// Turn replay detection on or off.
    ///
    /// With deduplication off, an event redelivered after a crash between
    /// commit and offset commit is applied twice.
    #[must_use]
    pub const fn with_deduplication(mut self, deduplicate: bool) -> Self {
        self.deduplicate = deduplicate;
        self
    }

    /// The underlying store.
    #[must_use]
    pub const fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Apply every line item of `envelope` in one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`AdjustmentError`] if the store failed at any point; every
    /// change made for this envelope has then been rolled back.
    pub async fn apply(&self, envelope: &SaleEnvelope) -> Result<AdjustmentOutcome, AdjustmentError> {
        let sale_id = envelope.sale_id;
        let rolled_back = |source| AdjustmentError { sale_id, source };

        let mut tx = self.store.begin().await.map_err(rolled_back)?;

        match self.apply_in(&mut tx, envelope).await {
            Ok(Some(report)) => {
                tx.commit().await.map_err(|source| {
                    tracing::error!(%sale_id, error = %source, "Failed to commit stock adjustment");
                    rolled_back(source)
                })?;
                StockMetrics::record_applied(report.applied.len());
                StockMetrics::record_skipped(report.skipped());
                tracing::info!(
                    %sale_id,
                    applied = report.applied.len(),
                    skipped = report.skipped(),
                    "Stock adjustment committed"
                );
                Ok(AdjustmentOutcome::Applied(report))
            }
            Ok(None) => {
                if let Err(e) = tx.rollback().await {
                    tracing::warn!(%sale_id, error = %e, "Failed to release duplicate sale transaction");
                }
                tracing::info!(%sale_id, "Sale already applied, skipping replay");
                Ok(AdjustmentOutcome::Duplicate(sale_id))
            }
            Err(source) => {
                if let Err(e) = tx.rollback().await {
                    tracing::warn!(%sale_id, error = %e, "Rollback failed");
                }
                tracing::error!(%sale_id, error = %source, "Stock adjustment rolled back");
                Err(rolled_back(source))
            }
        }
    }

    async fn apply_in(
        &self,
        tx: &mut S::Transaction,
        envelope: &SaleEnvelope,
    ) -> Result<Option<AdjustmentReport>, StockError> {
        let sale_id = envelope.sale_id;

        if self.deduplicate && !tx.claim_sale(sale_id).await? {
            return Ok(None);
        }

        let mut report = AdjustmentReport::new(sale_id);

        for entry in &envelope.entries {
            let item = match entry {
                LineItemEntry::Valid(item) => item,
                LineItemEntry::Malformed { raw, reason } => {
                    tracing::warn!(%sale_id, item = %raw, %reason, "Skipping malformed line item");
                    report.skipped_malformed += 1;
                    continue;
                }
            };

            let Some(previous) = tx.lock_stock(item.product_id).await? else {
                tracing::warn!(
                    %sale_id,
                    product_id = %item.product_id,
                    "Product not found in inventory, skipping line item"
                );
                report.missing_products.push(item.product_id);
                continue;
            };

            let current = previous
                .checked_sub(item.quantity)
                .ok_or(StockError::Overflow {
                    product_id: item.product_id,
                    stock: previous,
                    delta: -item.quantity,
                })?;
            tx.write_stock(item.product_id, current).await?;

            tracing::info!(
                %sale_id,
                product_id = %item.product_id,
                previous,
                current,
                "Stock updated"
            );
            report.applied.push(StockChange {
                product_id: item.product_id,
                quantity: item.quantity,
                previous,
                current,
            });
        }

        Ok(Some(report))
    }
}

/// Apply a direct stock edit (`stock += delta`) under the same row lock the
/// consumer uses.
///
/// Returns the new stock, or `None` when the product does not exist.
///
/// # Errors
///
/// Returns [`StockError`] if the store fails; the edit is rolled back.
pub async fn adjust_stock<S: InventoryStore>(
    store: &S,
    product_id: ProductId,
    delta: i64,
) -> Result<Option<i64>, StockError> {
    let mut tx = store.begin().await?;

    match edit_in(&mut tx, product_id, delta).await {
        Ok(Some((previous, current))) => {
            tx.commit().await?;
            tracing::info!(%product_id, previous, current, "Stock edited");
            Ok(Some(current))
        }
        Ok(None) => {
            tx.rollback().await?;
            Ok(None)
        }
        Err(e) => {
            if let Err(rollback) = tx.rollback().await {
                tracing::warn!(%product_id, error = %rollback, "Rollback failed");
            }
            tracing::error!(%product_id, error = %e, "Stock edit rolled back");
            Err(e)
        }
    }
}

async fn edit_in<T: InventoryTransaction>(
    tx: &mut T,
    product_id: ProductId,
    delta: i64,
) -> Result<Option<(i64, i64)>, StockError> {
    let Some(previous) = tx.lock_stock(product_id).await? else {
        return Ok(None);
    };
    let current = previous.checked_add(delta).ok_or(StockError::Overflow {
        product_id,
        stock: previous,
        delta,
    })?;
    tx.write_stock(product_id, current).await?;
    Ok(Some((previous, current)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use stocksync_core::envelope::decode;
    use stocksync_core::event::{LineItem, SaleRecorded};
    use stocksync_testing::InMemoryInventoryStore;

    fn store_with(products: &[(i64, i64)]) -> Arc<InMemoryInventoryStore> {
        let store = InMemoryInventoryStore::new();
        for &(id, stock) in products {
            store.insert_product(ProductId::new(id), stock);
        }
        Arc::new(store)
    }

    fn sale(id: i64, items: &[(i64, i64)]) -> SaleEnvelope {
        SaleRecorded::new(
            SaleId::new(id),
            items
                .iter()
                .map(|&(p, q)| LineItem::new(ProductId::new(p), q).unwrap())
                .collect(),
        )
        .into()
    }

    async fn stock(store: &InMemoryInventoryStore, id: i64) -> Option<i64> {
        store.stock_level(ProductId::new(id)).await.unwrap()
    }

    #[tokio::test]
    async fn decrements_each_item() {
        let store = store_with(&[(7, 10), (8, 4)]);
        let adjuster = StockAdjuster::new(Arc::clone(&store));

        let outcome = adjuster.apply(&sale(42, &[(7, 3), (8, 1)])).await.unwrap();

        let AdjustmentOutcome::Applied(report) = outcome else {
            panic!("expected applied outcome");
        };
        assert_eq!(report.applied.len(), 2);
        assert_eq!(stock(&store, 7).await, Some(7));
        assert_eq!(stock(&store, 8).await, Some(3));
    }

    #[tokio::test]
    async fn stock_may_go_negative() {
        let store = store_with(&[(1, 2)]);
        let adjuster = StockAdjuster::new(Arc::clone(&store));

        adjuster.apply(&sale(1, &[(1, 5)])).await.unwrap();

        assert_eq!(stock(&store, 1).await, Some(-3));
    }

    #[tokio::test]
    async fn skips_malformed_item_and_applies_the_rest() {
        let store = store_with(&[(1, 10), (2, 10), (3, 10)]);
        let adjuster = StockAdjuster::new(Arc::clone(&store));
        let envelope = decode(
            br#"{"venta_id": 9, "productos": [
                {"producto_id": 1, "cantidad": 1},
                {"producto_id": 2, "cantidad": "abc"},
                {"producto_id": 3, "cantidad": 3}
            ]}"#,
        )
        .unwrap();

        let outcome = adjuster.apply(&envelope).await.unwrap();

        let AdjustmentOutcome::Applied(report) = outcome else {
            panic!("expected applied outcome");
        };
        assert_eq!(report.skipped_malformed, 1);
        assert_eq!(stock(&store, 1).await, Some(9));
        assert_eq!(stock(&store, 2).await, Some(10));
        assert_eq!(stock(&store, 3).await, Some(7));
    }

    #[tokio::test]
    async fn missing_product_does_not_affect_other_items() {
        let store = store_with(&[(1, 10)]);
        let adjuster = StockAdjuster::new(Arc::clone(&store));

        let outcome = adjuster.apply(&sale(3, &[(99, 1), (1, 4)])).await.unwrap();

        let AdjustmentOutcome::Applied(report) = outcome else {
            panic!("expected applied outcome");
        };
        assert_eq!(report.missing_products, vec![ProductId::new(99)]);
        assert_eq!(stock(&store, 1).await, Some(6));
        assert_eq!(stock(&store, 99).await, None);
    }

    #[tokio::test]
    async fn store_error_rolls_back_whole_message() {
        let store = store_with(&[(1, 10), (2, 10)]);
        store.fail_on_lock(ProductId::new(2));
        let adjuster = StockAdjuster::new(Arc::clone(&store));

        let err = adjuster.apply(&sale(5, &[(1, 3), (2, 1)])).await.unwrap_err();

        assert_eq!(err.sale_id, SaleId::new(5));
        assert_eq!(stock(&store, 1).await, Some(10));
        assert_eq!(stock(&store, 2).await, Some(10));
        assert!(!store.is_sale_applied(SaleId::new(5)));
    }

    #[tokio::test]
    async fn failed_commit_discards_stock_and_claim() {
        let store = store_with(&[(1, 10)]);
        store.fail_commits(true);
        let adjuster = StockAdjuster::new(Arc::clone(&store));

        let err = adjuster.apply(&sale(6, &[(1, 4)])).await.unwrap_err();

        assert_eq!(err.sale_id, SaleId::new(6));
        assert!(matches!(err.source, StockError::Transaction(_)));
        assert_eq!(stock(&store, 1).await, Some(10));
        assert!(!store.is_sale_applied(SaleId::new(6)));

        store.clear_failures();
        let outcome = adjuster.apply(&sale(6, &[(1, 4)])).await.unwrap();
        assert!(matches!(outcome, AdjustmentOutcome::Applied(_)));
        assert_eq!(stock(&store, 1).await, Some(6));
    }

    #[tokio::test]
    async fn overflowing_stock_rolls_back_message() {
        let store = store_with(&[(1, 10), (2, i64::MIN + 1)]);
        let adjuster = StockAdjuster::new(Arc::clone(&store));

        let err = adjuster.apply(&sale(4, &[(1, 3), (2, 5)])).await.unwrap_err();

        assert_eq!(
            err.source,
            StockError::Overflow {
                product_id: ProductId::new(2),
                stock: i64::MIN + 1,
                delta: -5,
            }
        );
        assert_eq!(stock(&store, 1).await, Some(10));
        assert_eq!(stock(&store, 2).await, Some(i64::MIN + 1));
    }

    #[tokio::test]
    async fn overflowing_direct_edit_is_refused() {
        let store = store_with(&[(1, i64::MAX)]);

        let err = adjust_stock(&*store, ProductId::new(1), 1).await.unwrap_err();

        assert!(matches!(err, StockError::Overflow { .. }));
        assert_eq!(stock(&store, 1).await, Some(i64::MAX));
    }

    #[tokio::test]
    async fn rolled_back_sale_can_be_applied_later() {
        let store = store_with(&[(1, 10)]);
        store.fail_on_lock(ProductId::new(1));
        let adjuster = StockAdjuster::new(Arc::clone(&store));

        assert!(adjuster.apply(&sale(5, &[(1, 3)])).await.is_err());
        store.clear_failures();
        assert!(adjuster.apply(&sale(5, &[(1, 3)])).await.is_ok());

        assert_eq!(stock(&store, 1).await, Some(7));
    }

    #[tokio::test]
    async fn replayed_sale_is_not_applied_twice() {
        let store = store_with(&[(1, 10)]);
        let adjuster = StockAdjuster::new(Arc::clone(&store));

        adjuster.apply(&sale(8, &[(1, 2)])).await.unwrap();
        let replay = adjuster.apply(&sale(8, &[(1, 2)])).await.unwrap();

        assert_eq!(replay, AdjustmentOutcome::Duplicate(SaleId::new(8)));
        assert_eq!(stock(&store, 1).await, Some(8));
    }

    #[tokio::test]
    async fn without_deduplication_replay_drifts() {
        let store = store_with(&[(1, 10)]);
        let adjuster = StockAdjuster::new(Arc::clone(&store)).with_deduplication(false);

        adjuster.apply(&sale(8, &[(1, 2)])).await.unwrap();
        adjuster.apply(&sale(8, &[(1, 2)])).await.unwrap();

        assert_eq!(stock(&store, 1).await, Some(6));
    }

    #[tokio::test]
    async fn same_product_twice_in_one_sale() {
        let store = store_with(&[(1, 10)]);
        let adjuster = StockAdjuster::new(Arc::clone(&store));

        adjuster.apply(&sale(2, &[(1, 2), (1, 3)])).await.unwrap();

        assert_eq!(stock(&store, 1).await, Some(5));
    }

    #[tokio::test]
    async fn direct_edit_adds_delta() {
        let store = store_with(&[(1, 10)]);

        assert_eq!(adjust_stock(&*store, ProductId::new(1), 5).await.unwrap(), Some(15));
        assert_eq!(adjust_stock(&*store, ProductId::new(2), 5).await.unwrap(), None);
    }

    #[tokio::test]
    async fn concurrent_adjustments_sum_up() {
        let store = store_with(&[(1, 100)]);
        let adjuster = StockAdjuster::new(Arc::clone(&store));

        let mut tasks = Vec::new();
        for sale_id in 0..20 {
            let adjuster = adjuster.clone();
            tasks.push(tokio::spawn(async move {
                adjuster.apply(&sale(sale_id + 1, &[(1, 2)])).await.unwrap();
            }));
            let store = Arc::clone(&store);
            tasks.push(tokio::spawn(async move {
                adjust_stock(&*store, ProductId::new(1), 1).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(stock(&store, 1).await, Some(100 - 40 + 20));
    }
}
