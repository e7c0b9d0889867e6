//! Domain events published between services.
//!
//! Events are serialized as JSON objects (see [`envelope`](crate::envelope))
//! because consumers in other services read them without sharing Rust types.
//!
//! # Example
//!
//! ```
//! use stocksync_core::event::{DomainEvent, LineItem, ProductId, SaleId, SaleRecorded};
//!
//! let sale = SaleRecorded::new(
//!     SaleId::new(42),
//!     vec![LineItem::new(ProductId::new(7), 3).unwrap()],
//! );
//! assert_eq!(sale.event_type(), "SaleRecorded.v1");
//! assert_eq!(sale.partition_key().as_deref(), Some("42"));
//! ```

use crate::envelope::MalformedItem;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier assigned to a sale once its row is committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SaleId(i64);

impl SaleId {
    /// Wrap a raw sale id.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// The raw id.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for SaleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a product row in the inventory store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductId(i64);

impl ProductId {
    /// Wrap a raw product id.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// The raw id.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for ProductId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One `(product, quantity)` pair of a sale.
///
/// Construct through [`LineItem::new`], which rejects non-positive ids and
/// quantities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    /// Product sold.
    #[serde(rename = "producto_id")]
    pub product_id: ProductId,
    /// Units sold, always positive.
    #[serde(rename = "cantidad")]
    pub quantity: i64,
}

impl LineItem {
    /// Build a validated line item.
    ///
    /// # Errors
    ///
    /// Returns [`MalformedItem::NonPositiveProductId`] or
    /// [`MalformedItem::NonPositiveQuantity`] when either value is `<= 0`.
    pub const fn new(product_id: ProductId, quantity: i64) -> Result<Self, MalformedItem> {
        if product_id.get() <= 0 {
            return Err(MalformedItem::NonPositiveProductId(product_id.get()));
        }
        if quantity <= 0 {
            return Err(MalformedItem::NonPositiveQuantity(quantity));
        }
        Ok(Self {
            product_id,
            quantity,
        })
    }
}

/// An event that can be published to the broker.
///
/// Implementors serialize to a JSON object; the trait adds the metadata the
/// publisher needs for logging and partitioning.
pub trait DomainEvent: Serialize + Send + Sync {
    /// Stable event type name with a version suffix (e.g. `"SaleRecorded.v1"`).
    fn event_type(&self) -> &'static str;

    /// Message key used by the broker to pick a partition.
    ///
    /// `None` lets the broker choose.
    fn partition_key(&self) -> Option<String> {
        None
    }
}

/// A sale was committed in the sales store.
///
/// Only ever built from a committed [`SaleReceipt`](crate::sale::SaleReceipt)
/// so that `sale_id` always refers to a durable row.
///
/// Wire form:
///
/// ```json
/// { "venta_id": 42, "productos": [ { "producto_id": 7, "cantidad": 3 } ] }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaleRecorded {
    /// Originating sale.
    #[serde(rename = "venta_id", alias = "sale_id")]
    pub sale_id: SaleId,
    /// Items sold, in the order they were entered.
    #[serde(rename = "productos")]
    pub line_items: Vec<LineItem>,
}

impl SaleRecorded {
    /// Create the event for a committed sale.
    #[must_use]
    pub const fn new(sale_id: SaleId, line_items: Vec<LineItem>) -> Self {
        Self {
            sale_id,
            line_items,
        }
    }
}

impl DomainEvent for SaleRecorded {
    fn event_type(&self) -> &'static str {
        "SaleRecorded.v1"
    }

    fn partition_key(&self) -> Option<String> {
        Some(self.sale_id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_item_rejects_non_positive_quantity() {
        assert_eq!(
            LineItem::new(ProductId::new(1), 0),
            Err(MalformedItem::NonPositiveQuantity(0))
        );
        assert_eq!(
            LineItem::new(ProductId::new(1), -4),
            Err(MalformedItem::NonPositiveQuantity(-4))
        );
    }

    #[test]
    fn line_item_rejects_non_positive_product() {
        assert_eq!(
            LineItem::new(ProductId::new(0), 1),
            Err(MalformedItem::NonPositiveProductId(0))
        );
    }

    #[test]
    fn sale_recorded_uses_wire_field_names() {
        let sale = SaleRecorded::new(
            SaleId::new(42),
            vec![LineItem {
                product_id: ProductId::new(7),
                quantity: 3,
            }],
        );

        let json = serde_json::to_value(&sale).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "venta_id": 42,
                "productos": [{ "producto_id": 7, "cantidad": 3 }]
            })
        );
    }

    #[test]
    fn ids_display_raw_value() {
        assert_eq!(SaleId::new(9).to_string(), "9");
        assert_eq!(ProductId::new(11).to_string(), "11");
    }
}
