//! Order record and its status state machine.

use chrono::{DateTime, Utc};
use common::{OrderId, UserId};
use serde::{Deserialize, Serialize};

use crate::reservation::CouponReservationStatus;
use crate::value_objects::{CouponCode, LineItem, Money};

/// How the order is paid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    /// Paid up front through an asynchronous payment provider.
    Prepaid,

    /// Paid on delivery; the order is confirmed synchronously at checkout.
    CashOnDelivery,
}

impl PaymentMethod {
    /// Returns true if checkout settles the order without waiting for a
    /// provider event.
    pub fn settles_at_checkout(&self) -> bool {
        matches!(self, PaymentMethod::CashOnDelivery)
    }
}

/// The state of an order in its lifecycle.
///
/// State transitions:
/// ```text
/// PendingPayment ──┬──► Paid ──────┬──► Shipped ──► Delivered ──► Refunded
///                  │               │
///                  ├──► Confirmed ─┘         Paid/Confirmed ────► Refunded
///                  └──► Cancelled
/// ```
/// The refund transition is driven by an external approval workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Created at checkout, awaiting an asynchronous payment event.
    #[default]
    PendingPayment,

    /// Payment provider confirmed the charge.
    Paid,

    /// Settled synchronously at checkout (payment on delivery).
    Confirmed,

    /// Handed to the carrier.
    Shipped,

    /// Received by the customer.
    Delivered,

    /// Abandoned or rejected before payment (terminal state).
    Cancelled,

    /// Money returned after external approval (terminal state).
    Refunded,
}

impl OrderStatus {
    /// Returns true if an asynchronous payment event may still settle the order.
    pub fn can_mark_paid(&self) -> bool {
        matches!(self, OrderStatus::PendingPayment)
    }

    /// Returns true if the order can be handed to a carrier.
    pub fn can_ship(&self) -> bool {
        matches!(self, OrderStatus::Paid | OrderStatus::Confirmed)
    }

    /// Returns true if the order can be cancelled.
    pub fn can_cancel(&self) -> bool {
        matches!(self, OrderStatus::PendingPayment)
    }

    /// Returns true if the external refund workflow may act on the order.
    pub fn can_refund(&self) -> bool {
        matches!(
            self,
            OrderStatus::Paid | OrderStatus::Confirmed | OrderStatus::Delivered
        )
    }

    /// Returns true if the sale is settled and stock permanently consumed.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            OrderStatus::Paid | OrderStatus::Confirmed | OrderStatus::Shipped | OrderStatus::Delivered
        )
    }

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Cancelled | OrderStatus::Refunded)
    }

    /// Returns the status name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::PendingPayment => "pending_payment",
            OrderStatus::Paid => "paid",
            OrderStatus::Confirmed => "confirmed",
            OrderStatus::Shipped => "shipped",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Refunded => "refunded",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An order as persisted by the checkout flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    /// Unique identifier.
    pub id: OrderId,

    /// The customer the order belongs to.
    pub user_id: UserId,

    /// Ordered lines.
    pub items: Vec<LineItem>,

    /// Total charged, as quoted by the pricing collaborator.
    pub total: Money,

    /// How the order is paid.
    pub payment_method: PaymentMethod,

    /// Current lifecycle status.
    pub status: OrderStatus,

    /// Coupon applied at checkout, if any.
    pub coupon_code: Option<CouponCode>,

    /// Denormalized status of the coupon reservation, kept best-effort.
    pub coupon_state: Option<CouponReservationStatus>,

    /// Reference to the external payment-provider session, once one exists.
    pub payment_session: Option<String>,

    /// The idempotency key the order was created under.
    pub idempotency_key: String,

    /// When the order was created.
    pub created_at: DateTime<Utc>,

    /// When the order was last mutated.
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_status_is_pending_payment() {
        assert_eq!(OrderStatus::default(), OrderStatus::PendingPayment);
    }

    #[test]
    fn test_only_pending_can_be_paid_or_cancelled() {
        assert!(OrderStatus::PendingPayment.can_mark_paid());
        assert!(OrderStatus::PendingPayment.can_cancel());
        for status in [
            OrderStatus::Paid,
            OrderStatus::Confirmed,
            OrderStatus::Shipped,
            OrderStatus::Delivered,
            OrderStatus::Cancelled,
            OrderStatus::Refunded,
        ] {
            assert!(!status.can_mark_paid(), "{status}");
            assert!(!status.can_cancel(), "{status}");
        }
    }

    #[test]
    fn test_paid_and_confirmed_can_ship() {
        assert!(OrderStatus::Paid.can_ship());
        assert!(OrderStatus::Confirmed.can_ship());
        assert!(!OrderStatus::PendingPayment.can_ship());
        assert!(!OrderStatus::Shipped.can_ship());
    }

    #[test]
    fn test_refund_requires_settled_order() {
        assert!(OrderStatus::Paid.can_refund());
        assert!(OrderStatus::Confirmed.can_refund());
        assert!(OrderStatus::Delivered.can_refund());
        assert!(!OrderStatus::PendingPayment.can_refund());
        assert!(!OrderStatus::Cancelled.can_refund());
        assert!(!OrderStatus::Refunded.can_refund());
    }

    #[test]
    fn test_terminal_states() {
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(OrderStatus::Refunded.is_terminal());
        assert!(!OrderStatus::Delivered.is_terminal());
        assert!(!OrderStatus::PendingPayment.is_terminal());
    }

    #[test]
    fn test_settled_states_keep_their_stock() {
        assert!(OrderStatus::Paid.is_settled());
        assert!(OrderStatus::Confirmed.is_settled());
        assert!(OrderStatus::Shipped.is_settled());
        assert!(OrderStatus::Delivered.is_settled());
        assert!(!OrderStatus::PendingPayment.is_settled());
        assert!(!OrderStatus::Cancelled.is_settled());
    }

    #[test]
    fn test_payment_method_settlement() {
        assert!(PaymentMethod::CashOnDelivery.settles_at_checkout());
        assert!(!PaymentMethod::Prepaid.settles_at_checkout());
    }

    #[test]
    fn test_status_display() {
        assert_eq!(OrderStatus::PendingPayment.to_string(), "pending_payment");
        assert_eq!(OrderStatus::Refunded.to_string(), "refunded");
    }
}
