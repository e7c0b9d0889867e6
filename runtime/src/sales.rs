//! Sale registration.
//!
//! The request path: validate, commit the sale, then publish
//! [`SaleRecorded`]. The publish result never changes the response; a sale
//! that committed is reported as registered even when the broker is down.

use crate::producer::{EventPublisher, PublishOutcome};
use std::sync::Arc;
use stocksync_core::SALES_TOPIC;
use stocksync_core::event::{LineItem, SaleRecorded};
use stocksync_core::sale::{SaleError, SaleReceipt, SaleStore};

/// Records sales and announces them to the inventory service.
pub struct SaleService<S> {
    store: Arc<S>,
    publisher: EventPublisher,
    topic: String,
}

impl<S: SaleStore> SaleService<S> {
    /// Create a service publishing to the default sales topic.
    #[must_use]
    pub fn new(store: Arc<S>, publisher: EventPublisher) -> Self {
        Self {
            store,
            publisher,
            topic: SALES_TOPIC.to_string(),
        }
    }

    /// Publish to another topic.
    #[must_use]
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    /// Commit a sale and publish its event.
    ///
    /// Blocks until the publish attempt finished, which can take the whole
    /// producer connect budget on a cold start with the broker down.
    ///
    /// # Errors
    ///
    /// Returns [`SaleError::Invalid`] for an empty sale and
    /// [`SaleError::Database`] if the sale could not be committed. Publish
    /// failures are logged, not returned.
    pub async fn register_sale(&self, line_items: Vec<LineItem>) -> Result<SaleReceipt, SaleError> {
        if line_items.is_empty() {
            return Err(SaleError::Invalid("a sale needs at least one line item".to_string()));
        }
        // Fields are public, so re-check what LineItem::new enforces.
        if let Some(item) = line_items
            .iter()
            .find(|item| item.product_id.get() <= 0 || item.quantity <= 0)
        {
            return Err(SaleError::Invalid(format!(
                "invalid line item: product {} quantity {}",
                item.product_id, item.quantity
            )));
        }

        let receipt = self.store.record_sale(&line_items).await?;
        tracing::info!(sale_id = %receipt.sale_id, items = line_items.len(), "Sale recorded");

        let event = SaleRecorded::new(receipt.sale_id, line_items);
        if let PublishOutcome::Dropped(reason) = self.publisher.publish(&self.topic, &event).await {
            tracing::warn!(
                sale_id = %receipt.sale_id,
                reason = %reason,
                "Sale committed but its event was not published; stock will not be adjusted"
            );
        }

        Ok(receipt)
    }
}
