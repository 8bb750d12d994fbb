//! Payment confirmation handler: applies asynchronous provider events to
//! orders and reservations exactly once.

use common::OrderId;
use domain::{CouponReservationStatus, OrderStatus};
use reservation_store::ReservationStore;

use crate::clock::Clock;
use crate::error::Result;
use crate::operator::ReservationOperator;

/// Outcome of applying a payment-provider event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationOutcome {
    /// First delivery; the order and its reservations were settled.
    Applied,

    /// The event was seen before; nothing changed.
    AlreadyApplied,

    /// No matching pending order exists; the event was logged and dropped.
    NoMatchingOrder,
}

/// Reacts to payment-provider events, transitioning reservations and orders
/// from provisional to final state.
///
/// Providers may deliver an event more than once; the handler deduplicates
/// on the event id through an insert-once ledger. Events that match nothing
/// are dropped without creating state; re-delivery is the provider's
/// responsibility.
#[derive(Clone)]
pub struct PaymentConfirmationHandler<S, C> {
    store: S,
    clock: C,
    operator: ReservationOperator<S, C>,
}

impl<S, C> PaymentConfirmationHandler<S, C>
where
    S: ReservationStore + Clone,
    C: Clock + Clone,
{
    /// Creates a new handler over the given store and clock.
    pub fn new(store: S, clock: C) -> Self {
        let operator = ReservationOperator::new(store.clone(), clock.clone());
        Self {
            store,
            clock,
            operator,
        }
    }

    /// Applies one provider event to its order.
    ///
    /// On first delivery the order moves `PendingPayment → Paid`, the stock
    /// reservation `Reserved → Confirmed` (the stock is now permanently
    /// consumed), and the coupon reservation is consumed. Duplicates are
    /// no-ops.
    #[tracing::instrument(skip(self))]
    pub async fn confirm_payment(
        &self,
        event_id: &str,
        order_id: OrderId,
    ) -> Result<ConfirmationOutcome> {
        let now = self.clock.now();

        let Some(order) = self.store.get_order(order_id).await? else {
            tracing::warn!(%order_id, event_id, "payment event for unknown order dropped");
            metrics::counter!("payment_events_dropped_total").increment(1);
            return Ok(ConfirmationOutcome::NoMatchingOrder);
        };

        if !self.store.record_payment_event(event_id, order_id, now).await? {
            tracing::debug!(%order_id, event_id, "duplicate payment event ignored");
            metrics::counter!("payment_events_duplicate_total").increment(1);
            return Ok(ConfirmationOutcome::AlreadyApplied);
        }

        let transitioned = self
            .store
            .transition_order(order_id, OrderStatus::PendingPayment, OrderStatus::Paid, now)
            .await?;
        if transitioned.is_none() {
            tracing::warn!(
                %order_id,
                event_id,
                status = %order.status,
                "payment event for order not awaiting payment dropped"
            );
            metrics::counter!("payment_events_dropped_total").increment(1);
            return Ok(ConfirmationOutcome::NoMatchingOrder);
        }

        if !self.operator.confirm_stock(order_id).await? {
            // The lease may have run out and been swept before the event
            // arrived; the order is still settled, the shortfall is an
            // operational follow-up, not new state.
            tracing::warn!(%order_id, event_id, "no reserved stock reservation to confirm");
        }

        if let Some(code) = &order.coupon_code {
            if self.operator.consume_coupon(code, order_id).await? {
                self.store
                    .set_order_coupon_state(order_id, CouponReservationStatus::Consumed, now)
                    .await?;
            } else {
                tracing::warn!(%order_id, code = %code, "no active coupon reservation to consume");
            }
        }

        metrics::counter!("payments_confirmed_total").increment(1);
        tracing::info!(%order_id, event_id, "payment confirmed");
        Ok(ConfirmationOutcome::Applied)
    }
}
