//! Envelope codec: domain events to and from broker payloads.
//!
//! Encoding is plain `serde_json`. Decoding is deliberately two-level:
//!
//! - the top-level structure (a JSON object with an integer `venta_id`) must be
//!   valid, otherwise the whole message is a [`MalformedEventError`];
//! - every line item is validated on its own and becomes a
//!   [`LineItemEntry::Valid`] or [`LineItemEntry::Malformed`], so a consumer can
//!   apply the good items and skip the bad ones.
//!
//! Field order is irrelevant on both sides.
//!
//! # Example
//!
//! ```
//! use stocksync_core::envelope::{decode, LineItemEntry};
//!
//! let payload = br#"{"venta_id": 42, "productos": [
//!     {"producto_id": 7, "cantidad": 3},
//!     {"producto_id": 8, "cantidad": "abc"}
//! ]}"#;
//!
//! let envelope = decode(payload).unwrap();
//! assert_eq!(envelope.sale_id.get(), 42);
//! assert!(matches!(envelope.entries[0], LineItemEntry::Valid(_)));
//! assert!(matches!(envelope.entries[1], LineItemEntry::Malformed { .. }));
//! ```

use crate::event::{DomainEvent, LineItem, ProductId, SaleId, SaleRecorded};
use serde_json::Value;
use thiserror::Error;

/// A payload that cannot be interpreted as a sale event at all.
///
/// Consumers log and skip these messages; they are never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedEventError {
    /// The payload is not valid UTF-8 JSON.
    #[error("Payload is not valid JSON: {0}")]
    InvalidJson(String),

    /// The payload is JSON but not an object.
    #[error("Payload is not a JSON object")]
    NotAnObject,

    /// `venta_id` is absent or not an integer.
    #[error("Missing or non-integer `venta_id`")]
    MissingSaleId,

    /// `productos` is present but not an array.
    #[error("`productos` is not an array")]
    ItemsNotAnArray,

    /// The broker delivered a message without a payload.
    #[error("Message has no payload")]
    EmptyPayload,
}

/// Why a single line item was rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedItem {
    /// The item is not a JSON object.
    #[error("Line item is not a JSON object")]
    NotAnObject,

    /// `producto_id` is absent or not an integer.
    #[error("Missing or non-integer `producto_id`")]
    InvalidProductId,

    /// `cantidad` is absent or not an integer.
    #[error("Missing or non-integer `cantidad`")]
    InvalidQuantity,

    /// `producto_id` is zero or negative.
    #[error("`producto_id` must be positive, got {0}")]
    NonPositiveProductId(i64),

    /// `cantidad` is zero or negative.
    #[error("`cantidad` must be positive, got {0}")]
    NonPositiveQuantity(i64),
}

/// Failure to serialize an event.
#[derive(Error, Debug)]
#[error("Failed to encode event: {0}")]
pub struct EncodeError(#[from] serde_json::Error);

/// One decoded line item.
#[derive(Debug, Clone, PartialEq)]
pub enum LineItemEntry {
    /// A well-formed item.
    Valid(LineItem),
    /// An item that failed validation, kept for logging.
    Malformed {
        /// The item exactly as received.
        raw: Value,
        /// What was wrong with it.
        reason: MalformedItem,
    },
}

impl LineItemEntry {
    fn from_value(raw: Value) -> Self {
        match parse_line_item(&raw) {
            Ok(item) => Self::Valid(item),
            Err(reason) => Self::Malformed { raw, reason },
        }
    }
}

/// A decoded sale event whose items have been individually validated.
#[derive(Debug, Clone, PartialEq)]
pub struct SaleEnvelope {
    /// Originating sale.
    pub sale_id: SaleId,
    /// Items in wire order.
    pub entries: Vec<LineItemEntry>,
}

impl SaleEnvelope {
    /// Iterate over the well-formed items only.
    pub fn valid_items(&self) -> impl Iterator<Item = &LineItem> {
        self.entries.iter().filter_map(|entry| match entry {
            LineItemEntry::Valid(item) => Some(item),
            LineItemEntry::Malformed { .. } => None,
        })
    }

    /// Number of items that failed validation.
    #[must_use]
    pub fn malformed_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| matches!(entry, LineItemEntry::Malformed { .. }))
            .count()
    }
}

impl From<SaleRecorded> for SaleEnvelope {
    fn from(sale: SaleRecorded) -> Self {
        Self {
            sale_id: sale.sale_id,
            entries: sale
                .line_items
                .into_iter()
                .map(LineItemEntry::Valid)
                .collect(),
        }
    }
}

/// Serialize an event to a UTF-8 JSON payload.
///
/// # Errors
///
/// Returns [`EncodeError`] if the event's `Serialize` impl fails.
pub fn encode<E: DomainEvent>(event: &E) -> Result<Vec<u8>, EncodeError> {
    Ok(serde_json::to_vec(event)?)
}

/// Parse a broker payload into a [`SaleEnvelope`].
///
/// `sale_id` is accepted as an alias for `venta_id`. A missing `productos`
/// array is an empty sale.
///
/// # Errors
///
/// Returns [`MalformedEventError`] when the payload is not JSON, not an
/// object, has no integer sale id, or carries a non-array `productos`.
pub fn decode(payload: &[u8]) -> Result<SaleEnvelope, MalformedEventError> {
    let value: Value = serde_json::from_slice(payload)
        .map_err(|e| MalformedEventError::InvalidJson(e.to_string()))?;

    let Value::Object(mut fields) = value else {
        return Err(MalformedEventError::NotAnObject);
    };

    let sale_id = fields
        .get("venta_id")
        .or_else(|| fields.get("sale_id"))
        .and_then(Value::as_i64)
        .map(SaleId::new)
        .ok_or(MalformedEventError::MissingSaleId)?;

    let entries = match fields.remove("productos") {
        None => Vec::new(),
        Some(Value::Array(items)) => items.into_iter().map(LineItemEntry::from_value).collect(),
        Some(_) => return Err(MalformedEventError::ItemsNotAnArray),
    };

    Ok(SaleEnvelope { sale_id, entries })
}

fn parse_line_item(raw: &Value) -> Result<LineItem, MalformedItem> {
    let fields = raw.as_object().ok_or(MalformedItem::NotAnObject)?;

    let product_id = fields
        .get("producto_id")
        .and_then(Value::as_i64)
        .ok_or(MalformedItem::InvalidProductId)?;
    let quantity = fields
        .get("cantidad")
        .and_then(Value::as_i64)
        .ok_or(MalformedItem::InvalidQuantity)?;

    LineItem::new(ProductId::new(product_id), quantity)
}
