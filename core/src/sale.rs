//! Sale persistence collaborator.
//!
//! A sale must be committed, and its id assigned, before its
//! [`SaleRecorded`](crate::event::SaleRecorded) event is published.

use crate::event::{LineItem, SaleId};
use chrono::{DateTime, Utc};
use std::future::Future;
use thiserror::Error;

/// Errors raised while registering a sale.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SaleError {
    /// The request cannot be recorded as a sale.
    #[error("Invalid sale: {0}")]
    Invalid(String),

    /// The sales store failed.
    #[error("Database error: {0}")]
    Database(String),
}

/// Proof that a sale row was committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaleReceipt {
    /// Id assigned by the store
    pub sale_id: SaleId,
    /// Commit time
    pub recorded_at: DateTime<Utc>,
}

/// Durable storage for sales and their line items.
pub trait SaleStore: Send + Sync {
    /// Persist a sale with its items in one transaction and commit it.
    ///
    /// # Errors
    ///
    /// Returns [`SaleError::Database`] if the transaction fails; nothing is
    /// persisted in that case.
    fn record_sale(
        &self,
        line_items: &[LineItem],
    ) -> impl Future<Output = Result<SaleReceipt, SaleError>> + Send;
}
