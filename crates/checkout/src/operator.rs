//! Atomic reservation operator: first-committer-wins claim and release of
//! stock and coupon capacity.
//!
//! Every claim is a single-record conditional update against the store.
//! Multi-item stock reservation is ordered conditional steps plus explicit
//! compensation, not a multi-record transaction. Releases are idempotent:
//! the stock restore and counter decrement only happen as part of a winning
//! status transition, which is what keeps stock counts and `reserved_count`
//! drift-free under retries and duplicate sweeps.

use chrono::Duration;
use common::{OrderId, UserId};
use domain::{
    CouponCode, CouponReservationStatus, LineItem, StockReservation, StockReservationStatus,
};
use reservation_store::{CouponInsertOutcome, ReservationStore};

use crate::clock::Clock;
use crate::error::{CheckoutError, InsufficientStock, Result};

/// Outcome of an idempotent release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The reservation was open and has been closed.
    Released,

    /// Nothing was in a releasable state; no side effects.
    NoOp,
}

impl ReleaseOutcome {
    /// Returns true if this call performed the release.
    pub fn was_released(&self) -> bool {
        matches!(self, ReleaseOutcome::Released)
    }
}

/// Outcome of a coupon reservation attempt. Both variants are success:
/// `AlreadyReserved` keeps retries idempotent instead of failing them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CouponReservationOutcome {
    /// A new usage slot was claimed.
    Reserved,

    /// This order or user already holds a slot; nothing was charged against
    /// the global limit.
    AlreadyReserved,
}

/// Claims and releases capacity with exactly-one-winner semantics.
///
/// Under contention for the last unit of capacity, exactly one caller
/// observes success; the rest receive a conflict result in the same logical
/// instant. No queuing or fairness is provided.
#[derive(Clone)]
pub struct ReservationOperator<S, C> {
    store: S,
    clock: C,
}

impl<S, C> ReservationOperator<S, C>
where
    S: ReservationStore,
    C: Clock,
{
    /// Creates a new operator over the given store and clock.
    pub fn new(store: S, clock: C) -> Self {
        Self { store, clock }
    }

    /// Reserves stock for every line item of an order, all-or-nothing.
    ///
    /// Each line is one conditional decrement. Every line is evaluated even
    /// after a failure so the returned `OutOfStock` lists the complete set of
    /// insufficient items. On any failure, already-decremented lines are
    /// restored before the error is returned.
    #[tracing::instrument(skip(self, items), fields(item_count = items.len()))]
    pub async fn reserve_stock(
        &self,
        order_id: OrderId,
        items: &[LineItem],
        ttl: Duration,
    ) -> Result<StockReservation> {
        let mut decremented: Vec<&LineItem> = Vec::new();
        let mut insufficient: Vec<InsufficientStock> = Vec::new();

        for item in items {
            let key = item.stock_key();
            if self.store.try_decrement_stock(&key, item.quantity).await? {
                decremented.push(item);
            } else {
                let available = self.store.stock_level(&key).await?.unwrap_or(0);
                insufficient.push(InsufficientStock {
                    product_id: item.product_id.clone(),
                    variant_id: item.variant_id.clone(),
                    requested: item.quantity,
                    available,
                });
            }
        }

        if !insufficient.is_empty() {
            self.restore_lines(&decremented).await;
            metrics::counter!("stock_reservation_conflicts_total").increment(1);
            tracing::info!(%order_id, failed_lines = insufficient.len(), "stock reservation lost");
            return Err(CheckoutError::OutOfStock {
                items: insufficient,
            });
        }

        let now = self.clock.now();
        let reservation = StockReservation::new(order_id, items.to_vec(), now, now + ttl);
        if !self
            .store
            .insert_stock_reservation(reservation.clone())
            .await?
        {
            // Lost to a concurrent reservation for the same order; give the
            // stock back before surfacing.
            self.restore_lines(&decremented).await;
            return Err(CheckoutError::ActiveReservationExists(order_id));
        }

        metrics::counter!("stock_reservations_total").increment(1);
        Ok(reservation)
    }

    /// Releases an order's stock reservation and restores the stock.
    ///
    /// Idempotent: a reservation not in `Reserved` status is a no-op, which
    /// prevents double stock restoration.
    #[tracing::instrument(skip(self))]
    pub async fn release_stock(&self, order_id: OrderId) -> Result<ReleaseOutcome> {
        self.close_stock(order_id, StockReservationStatus::Released)
            .await
    }

    /// Expires an order's stock reservation and restores the stock.
    /// Same idempotent path as [`release_stock`](Self::release_stock).
    #[tracing::instrument(skip(self))]
    pub async fn expire_stock(&self, order_id: OrderId) -> Result<ReleaseOutcome> {
        self.close_stock(order_id, StockReservationStatus::Expired)
            .await
    }

    /// Confirms an order's stock reservation: the stock is now permanently
    /// consumed and will not be restored by later cancellation or sweeps.
    ///
    /// Returns false when nothing was in `Reserved` status.
    #[tracing::instrument(skip(self))]
    pub async fn confirm_stock(&self, order_id: OrderId) -> Result<bool> {
        let confirmed = self
            .store
            .transition_stock_reservation(
                order_id,
                StockReservationStatus::Reserved,
                StockReservationStatus::Confirmed,
            )
            .await?;
        Ok(confirmed.is_some())
    }

    async fn close_stock(
        &self,
        order_id: OrderId,
        to: StockReservationStatus,
    ) -> Result<ReleaseOutcome> {
        let reservation = self
            .store
            .transition_stock_reservation(order_id, StockReservationStatus::Reserved, to)
            .await?;

        match reservation {
            Some(reservation) => {
                // Restore only after winning the transition; a lost race means
                // someone else already restored (or the stock was consumed).
                self.restore_lines(&reservation.items.iter().collect::<Vec<_>>())
                    .await;
                metrics::counter!("stock_reservations_released_total").increment(1);
                Ok(ReleaseOutcome::Released)
            }
            None => Ok(ReleaseOutcome::NoOp),
        }
    }

    async fn restore_lines(&self, items: &[&LineItem]) {
        for item in items {
            if let Err(e) = self
                .store
                .restore_stock(&item.stock_key(), item.quantity)
                .await
            {
                // Collected by the sweeper later; compensation must not mask
                // the original failure.
                tracing::error!(key = %item.stock_key(), error = %e, "stock restore failed");
            }
        }
    }

    /// Reserves one usage slot of a coupon for an order.
    ///
    /// The per-user and per-order uniqueness checks run before the global
    /// counter is touched, so a holder of an existing slot is never charged
    /// against the limit twice. `AlreadyReserved` is a success.
    #[tracing::instrument(skip(self), fields(code = %code))]
    pub async fn reserve_coupon(
        &self,
        code: &CouponCode,
        order_id: OrderId,
        user_id: Option<UserId>,
        ttl: Duration,
    ) -> Result<CouponReservationOutcome> {
        let coupon = self
            .store
            .get_coupon(code)
            .await?
            .ok_or_else(|| CheckoutError::CouponNotFound(code.clone()))?;

        let enforce_per_user = coupon.limits_per_user() && user_id.is_some();
        let now = self.clock.now();
        let reservation =
            domain::CouponReservation::new(code.clone(), order_id, user_id, now, now + ttl);

        match self
            .store
            .insert_coupon_reservation(reservation, enforce_per_user)
            .await?
        {
            CouponInsertOutcome::AlreadyForOrder | CouponInsertOutcome::UserHoldsActive => {
                metrics::counter!("coupon_reservations_deduplicated_total").increment(1);
                return Ok(CouponReservationOutcome::AlreadyReserved);
            }
            CouponInsertOutcome::Inserted => {}
        }

        if !self.store.try_increment_reserved_count(code).await? {
            // The counter was never raised, so the row rollback must not
            // decrement: close it directly instead of going through release.
            self.store
                .transition_coupon_reservation(
                    code,
                    order_id,
                    CouponReservationStatus::Active,
                    CouponReservationStatus::Released,
                )
                .await?;
            metrics::counter!("coupon_limit_reached_total").increment(1);
            return Err(CheckoutError::CouponLimitReached(code.clone()));
        }

        metrics::counter!("coupon_reservations_total").increment(1);
        Ok(CouponReservationOutcome::Reserved)
    }

    /// Releases a coupon reservation and gives the slot back.
    ///
    /// Idempotent: `reserved_count` is decremented only as part of the
    /// winning `Active → Released` transition, so repeated calls cannot
    /// drift the counter.
    #[tracing::instrument(skip(self), fields(code = %code))]
    pub async fn release_coupon(
        &self,
        code: &CouponCode,
        order_id: OrderId,
    ) -> Result<ReleaseOutcome> {
        self.close_coupon(code, order_id, CouponReservationStatus::Released)
            .await
    }

    /// Expires a coupon reservation and gives the slot back.
    /// Same idempotent path as [`release_coupon`](Self::release_coupon).
    #[tracing::instrument(skip(self), fields(code = %code))]
    pub async fn expire_coupon(
        &self,
        code: &CouponCode,
        order_id: OrderId,
    ) -> Result<ReleaseOutcome> {
        self.close_coupon(code, order_id, CouponReservationStatus::Expired)
            .await
    }

    /// Finalizes a coupon use: the slot moves from provisional to consumed
    /// (`used_count += 1`, `reserved_count -= 1`).
    ///
    /// Returns false when nothing was in `Active` status.
    #[tracing::instrument(skip(self), fields(code = %code))]
    pub async fn consume_coupon(&self, code: &CouponCode, order_id: OrderId) -> Result<bool> {
        let consumed = self
            .store
            .transition_coupon_reservation(
                code,
                order_id,
                CouponReservationStatus::Active,
                CouponReservationStatus::Consumed,
            )
            .await?;

        match consumed {
            Some(_) => {
                self.store.finalize_coupon_use(code).await?;
                metrics::counter!("coupons_consumed_total").increment(1);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn close_coupon(
        &self,
        code: &CouponCode,
        order_id: OrderId,
        to: CouponReservationStatus,
    ) -> Result<ReleaseOutcome> {
        let released = self
            .store
            .transition_coupon_reservation(code, order_id, CouponReservationStatus::Active, to)
            .await?;

        match released {
            Some(_) => {
                self.store.decrement_reserved_count(code).await?;
                metrics::counter!("coupon_reservations_released_total").increment(1);
                Ok(ReleaseOutcome::Released)
            }
            None => Ok(ReleaseOutcome::NoOp),
        }
    }
}
