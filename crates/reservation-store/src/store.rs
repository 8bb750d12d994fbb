use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::OrderId;
use domain::{
    Coupon, CouponCode, CouponReservation, CouponReservationStatus, Order, OrderStatus, StockKey,
    StockReservation, StockReservationStatus,
};

use crate::Result;

/// Outcome of a conditional coupon-reservation insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CouponInsertOutcome {
    /// A new active reservation row was created.
    Inserted,

    /// A reservation for this (coupon, order) pair already exists.
    AlreadyForOrder,

    /// Per-user limiting is enforced and this user already holds an active
    /// reservation for the coupon.
    UserHoldsActive,
}

/// Outcome of claiming an idempotency key.
#[derive(Debug, Clone, PartialEq)]
pub enum IdempotencyClaim {
    /// The key was unseen; the caller holds the claim and must execute.
    Claimed,

    /// Another execution with this key is still in progress.
    InFlight,

    /// A prior execution completed; its stored response should be replayed.
    Completed(serde_json::Value),
}

/// Core trait for reservation store implementations.
///
/// Every mutating method is a single-record atomic conditional update:
/// it either applies in full or reports that its precondition did not hold.
/// Under contention, exactly one caller observes success. Implementations
/// must be thread-safe (Send + Sync).
#[async_trait]
pub trait ReservationStore: Send + Sync {
    // --- stock levels ---

    /// Returns the available count for a stock record, if it exists.
    async fn stock_level(&self, key: &StockKey) -> Result<Option<i64>>;

    /// Creates or overwrites a stock record. Unconditional; for seeding and
    /// catalog management, never for reservation flows.
    async fn set_stock_level(&self, key: &StockKey, available: i64) -> Result<()>;

    /// Decrements `available` by `quantity` iff `available >= quantity`.
    ///
    /// Returns true when the decrement applied. This is the sole path by
    /// which stock is taken; it can never drive the count negative.
    async fn try_decrement_stock(&self, key: &StockKey, quantity: u32) -> Result<bool>;

    /// Adds `quantity` back to a stock record (compensation/release path).
    async fn restore_stock(&self, key: &StockKey, quantity: u32) -> Result<()>;

    // --- stock reservations ---

    /// Inserts a stock reservation iff the order has no active one.
    ///
    /// Returns false when an active (reserved or confirmed) reservation
    /// already exists for the order.
    async fn insert_stock_reservation(&self, reservation: StockReservation) -> Result<bool>;

    /// Returns the order's active stock reservation, if any.
    async fn active_stock_reservation(&self, order_id: OrderId)
    -> Result<Option<StockReservation>>;

    /// Transitions the order's stock reservation `from → to` iff it is
    /// currently in `from`.
    ///
    /// Returns the transitioned record, or None when no reservation was in
    /// `from` (the caller must treat that as a no-op, not retry).
    async fn transition_stock_reservation(
        &self,
        order_id: OrderId,
        from: StockReservationStatus,
        to: StockReservationStatus,
    ) -> Result<Option<StockReservation>>;

    /// Returns up to `limit` stock reservations currently in `status`,
    /// oldest first.
    async fn stock_reservations_in_status(
        &self,
        status: StockReservationStatus,
        limit: usize,
    ) -> Result<Vec<StockReservation>>;

    // --- coupons ---

    /// Returns a coupon by code.
    async fn get_coupon(&self, code: &CouponCode) -> Result<Option<Coupon>>;

    /// Creates or overwrites a coupon. For seeding and catalog management.
    async fn upsert_coupon(&self, coupon: Coupon) -> Result<()>;

    /// Increments `reserved_count` iff `used_count + reserved_count` is below
    /// the usage limit (always succeeds for unlimited coupons).
    ///
    /// Returns true when the increment applied; false when the limit is
    /// reached or the coupon does not exist.
    async fn try_increment_reserved_count(&self, code: &CouponCode) -> Result<bool>;

    /// Decrements `reserved_count`, flooring at zero.
    ///
    /// Only called after winning a reservation status transition, which is
    /// what keeps the counter drift-free.
    async fn decrement_reserved_count(&self, code: &CouponCode) -> Result<()>;

    /// Finalizes one use: `used_count += 1`, `reserved_count -= 1`.
    async fn finalize_coupon_use(&self, code: &CouponCode) -> Result<()>;

    // --- coupon reservations ---

    /// Inserts an active coupon reservation, enforcing uniqueness on
    /// (coupon, order) and, when `enforce_per_user` is set, active-row
    /// uniqueness on (coupon, user).
    async fn insert_coupon_reservation(
        &self,
        reservation: CouponReservation,
        enforce_per_user: bool,
    ) -> Result<CouponInsertOutcome>;

    /// Returns the reservation for a (coupon, order) pair, if any.
    async fn get_coupon_reservation(
        &self,
        code: &CouponCode,
        order_id: OrderId,
    ) -> Result<Option<CouponReservation>>;

    /// Transitions a (coupon, order) reservation `from → to` iff it is
    /// currently in `from`. Returns the transitioned record, or None.
    async fn transition_coupon_reservation(
        &self,
        code: &CouponCode,
        order_id: OrderId,
        from: CouponReservationStatus,
        to: CouponReservationStatus,
    ) -> Result<Option<CouponReservation>>;

    /// Returns up to `limit` coupon reservations currently in `status`,
    /// oldest first.
    async fn coupon_reservations_in_status(
        &self,
        status: CouponReservationStatus,
        limit: usize,
    ) -> Result<Vec<CouponReservation>>;

    // --- orders ---

    /// Persists a new order.
    async fn insert_order(&self, order: Order) -> Result<()>;

    /// Returns an order by ID.
    async fn get_order(&self, order_id: OrderId) -> Result<Option<Order>>;

    /// Transitions an order `from → to` iff it is currently in `from`,
    /// stamping `updated_at`. Returns the transitioned record, or None.
    async fn transition_order(
        &self,
        order_id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<Order>>;

    /// Best-effort update of the order's denormalized coupon state.
    async fn set_order_coupon_state(
        &self,
        order_id: OrderId,
        state: CouponReservationStatus,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Returns up to `limit` orders currently in `status`, oldest first.
    async fn orders_in_status(&self, status: OrderStatus, limit: usize) -> Result<Vec<Order>>;

    // --- idempotency ---

    /// Claims a (route, key) pair for execution.
    ///
    /// The claim is atomic: of N concurrent first sightings exactly one
    /// receives [`IdempotencyClaim::Claimed`].
    async fn claim_idempotency(
        &self,
        route: &str,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<IdempotencyClaim>;

    /// Marks a claimed key completed and stores the response snapshot.
    async fn complete_idempotency(
        &self,
        route: &str,
        key: &str,
        response: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Drops an in-progress claim so the key can be retried. A completed
    /// record is left untouched.
    async fn release_idempotency(&self, route: &str, key: &str) -> Result<()>;

    /// Deletes idempotency records created before `cutoff`.
    ///
    /// Returns the number of records deleted.
    async fn purge_idempotency_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    // --- payment event ledger ---

    /// Records a payment-provider event iff it was never seen before.
    ///
    /// Returns false for a duplicate delivery.
    async fn record_payment_event(
        &self,
        event_id: &str,
        order_id: OrderId,
        now: DateTime<Utc>,
    ) -> Result<bool>;
}
