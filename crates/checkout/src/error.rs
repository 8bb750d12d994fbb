//! Engine error taxonomy.

use common::OrderId;
use domain::{CouponCode, ProductId, VariantId};
use reservation_store::StoreError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One line that could not be reserved, with the full picture for the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsufficientStock {
    /// The product that ran short.
    pub product_id: ProductId,
    /// The variant, when stock is tracked per variant.
    pub variant_id: Option<VariantId>,
    /// Quantity the caller asked for.
    pub requested: u32,
    /// Quantity available at the time of the attempt.
    pub available: i64,
}

/// Errors that can occur during reservation and checkout operations.
#[derive(Debug, Error)]
pub enum CheckoutError {
    /// One or more line items could not be reserved. Carries every
    /// insufficient line, not just the first, so the caller can report a
    /// complete picture.
    #[error("Out of stock for {} line item(s)", items.len())]
    OutOfStock { items: Vec<InsufficientStock> },

    /// The coupon code does not exist.
    #[error("Coupon not found: {0}")]
    CouponNotFound(CouponCode),

    /// The coupon's total usage limit is exhausted.
    #[error("Coupon usage limit reached: {0}")]
    CouponLimitReached(CouponCode),

    /// A concurrent request with the same idempotency key is in flight.
    #[error("Concurrent request in flight for idempotency key '{key}' on route '{route}'")]
    IdempotencyConflict { route: String, key: String },

    /// No reservation exists for the order.
    #[error("Reservation not found for order {0}")]
    ReservationNotFound(OrderId),

    /// The order already holds an active stock reservation.
    #[error("Order {0} already holds an active stock reservation")]
    ActiveReservationExists(OrderId),

    /// The order does not exist.
    #[error("Order not found: {0}")]
    OrderNotFound(OrderId),

    /// The pricing collaborator failed to quote the cart.
    #[error("Pricing error: {0}")]
    Pricing(String),

    /// Reservation store error.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience type alias for engine results.
pub type Result<T> = std::result::Result<T, CheckoutError>;
