//! In-memory sale store.

use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use stocksync_core::event::{LineItem, SaleId};
use stocksync_core::sale::{SaleError, SaleReceipt, SaleStore};

/// A committed sale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSale {
    /// Receipt returned to the caller
    pub receipt: SaleReceipt,
    /// Items as recorded
    pub line_items: Vec<LineItem>,
}

/// Sale store double assigning sequential ids from 1.
#[derive(Clone, Default)]
pub struct InMemorySaleStore {
    sales: Arc<Mutex<Vec<StoredSale>>>,
    fail_next: Arc<AtomicBool>,
}

impl InMemorySaleStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `record_sale` call.
    pub fn fail_next_record(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Committed sales in commit order.
    #[must_use]
    pub fn sales(&self) -> Vec<StoredSale> {
        self.sales.lock().unwrap().clone()
    }
}

impl SaleStore for InMemorySaleStore {
    async fn record_sale(&self, line_items: &[LineItem]) -> Result<SaleReceipt, SaleError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(SaleError::Database("connection reset".to_string()));
        }

        let mut sales = self.sales.lock().unwrap();
        let next_id = i64::try_from(sales.len()).unwrap_or(i64::MAX - 1) + 1;
        let receipt = SaleReceipt {
            sale_id: SaleId::new(next_id),
            recorded_at: Utc::now(),
        };
        sales.push(StoredSale {
            receipt,
            line_items: line_items.to_vec(),
        });
        Ok(receipt)
    }
}
