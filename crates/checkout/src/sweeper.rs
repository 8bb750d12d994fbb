//! Repair sweeper: periodic, batch-bounded reconciliation of orphaned,
//! expired and inconsistent reservations.
//!
//! Every repair goes through the same status-conditional paths as the normal
//! flows, so each check is idempotent and duplicate sweep passes (including
//! from concurrently running instances) are safe. Failures are collected per
//! record, never thrown: a single bad record cannot stall the sweep.

use domain::{
    CouponReservation, CouponReservationStatus, Order, OrderStatus, StockReservation,
    StockReservationStatus,
};
use reservation_store::ReservationStore;

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::operator::ReservationOperator;

/// Counters for one reconciliation check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckStats {
    /// Records examined.
    pub scanned: u64,
    /// Records healed.
    pub repaired: u64,
    /// Records whose repair failed.
    pub failed: u64,
}

/// Result of one full sweep.
#[derive(Debug, Clone, Default)]
pub struct SweepStats {
    /// Reserved stock with no order record at all.
    pub orphaned_stock: CheckStats,
    /// Reserved stock past its lease.
    pub expired_stock: CheckStats,
    /// Confirmed stock whose order is cancelled, refunded or missing.
    pub stale_confirmed: CheckStats,
    /// Active coupon reservations past their lease.
    pub expired_coupons: CheckStats,
    /// Orders stuck in pending payment with no payment session.
    pub stale_checkouts: CheckStats,
    /// Idempotency records dropped by the retention purge.
    pub idempotency_purged: u64,
    /// Collected per-record failure descriptions.
    pub errors: Vec<String>,
}

impl SweepStats {
    /// Total records healed across all checks.
    pub fn total_repaired(&self) -> u64 {
        self.orphaned_stock.repaired
            + self.expired_stock.repaired
            + self.stale_confirmed.repaired
            + self.expired_coupons.repaired
            + self.stale_checkouts.repaired
    }

    /// Total repair failures across all checks.
    pub fn total_failed(&self) -> u64 {
        self.orphaned_stock.failed
            + self.expired_stock.failed
            + self.stale_confirmed.failed
            + self.expired_coupons.failed
            + self.stale_checkouts.failed
    }

    /// True when the sweep found nothing to heal and hit no errors.
    pub fn is_clean(&self) -> bool {
        self.total_repaired() == 0 && self.idempotency_purged == 0 && self.errors.is_empty()
    }
}

/// Periodic background task that finds and heals reservations left behind by
/// crashes or abandoned flows.
///
/// Built as an explicit, independently-startable task over an injectable
/// clock and store handle so it can be unit-tested with simulated time.
pub struct RepairSweeper<S, C> {
    store: S,
    clock: C,
    config: EngineConfig,
    operator: ReservationOperator<S, C>,
}

impl<S, C> RepairSweeper<S, C>
where
    S: ReservationStore + Clone,
    C: Clock + Clone,
{
    /// Creates a new sweeper.
    pub fn new(store: S, clock: C, config: EngineConfig) -> Self {
        let operator = ReservationOperator::new(store.clone(), clock.clone());
        Self {
            store,
            clock,
            config,
            operator,
        }
    }

    /// Runs sweeps forever on the configured interval.
    pub async fn run(self) {
        let period = self
            .config
            .sweep_interval
            .to_std()
            .unwrap_or(std::time::Duration::from_secs(60));
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            self.run_once().await;
        }
    }

    /// Runs one full sweep. Each check is independent; a failure in one does
    /// not abort the others.
    #[tracing::instrument(skip(self))]
    pub async fn run_once(&self) -> SweepStats {
        let mut stats = SweepStats::default();

        self.sweep_orphaned_stock(&mut stats).await;
        self.sweep_expired_stock(&mut stats).await;
        self.sweep_stale_confirmed(&mut stats).await;
        self.sweep_expired_coupons(&mut stats).await;
        self.sweep_stale_checkouts(&mut stats).await;
        self.purge_idempotency(&mut stats).await;

        metrics::counter!("sweep_runs_total").increment(1);
        metrics::counter!("sweep_repairs_total").increment(stats.total_repaired());
        metrics::counter!("sweep_failures_total").increment(stats.total_failed());
        tracing::info!(
            repaired = stats.total_repaired(),
            failed = stats.total_failed(),
            purged = stats.idempotency_purged,
            errors = stats.errors.len(),
            "sweep complete"
        );

        stats
    }

    /// Reserved stock older than the grace window whose order never came to
    /// exist: release and restore.
    async fn sweep_orphaned_stock(&self, stats: &mut SweepStats) {
        let batch = match self
            .store
            .stock_reservations_in_status(
                StockReservationStatus::Reserved,
                self.config.sweep_batch_limit,
            )
            .await
        {
            Ok(batch) => batch,
            Err(e) => {
                stats.errors.push(format!("orphaned stock scan: {e}"));
                return;
            }
        };

        for reservation in batch {
            stats.orphaned_stock.scanned += 1;
            match self.repair_orphaned_stock(&reservation).await {
                Ok(true) => {
                    stats.orphaned_stock.repaired += 1;
                    tracing::info!(order_id = %reservation.order_id, "released orphaned stock reservation");
                }
                Ok(false) => {}
                Err(e) => {
                    stats.orphaned_stock.failed += 1;
                    stats
                        .errors
                        .push(format!("orphaned stock {}: {e}", reservation.id));
                }
            }
        }
    }

    async fn repair_orphaned_stock(&self, reservation: &StockReservation) -> Result<bool> {
        let now = self.clock.now();
        if now.signed_duration_since(reservation.created_at) <= self.config.sweep_grace {
            return Ok(false);
        }
        if self.store.get_order(reservation.order_id).await?.is_some() {
            return Ok(false);
        }
        let outcome = self.operator.release_stock(reservation.order_id).await?;
        Ok(outcome.was_released())
    }

    /// Reserved stock past its lease plus the grace margin: expire and
    /// restore. Covers deployments where no auto-expiry mechanism fired.
    async fn sweep_expired_stock(&self, stats: &mut SweepStats) {
        let batch = match self
            .store
            .stock_reservations_in_status(
                StockReservationStatus::Reserved,
                self.config.sweep_batch_limit,
            )
            .await
        {
            Ok(batch) => batch,
            Err(e) => {
                stats.errors.push(format!("expired stock scan: {e}"));
                return;
            }
        };

        let deadline = self.clock.now() - self.config.sweep_grace;
        for reservation in batch {
            stats.expired_stock.scanned += 1;
            if reservation.expires_at >= deadline {
                continue;
            }
            match self.operator.expire_stock(reservation.order_id).await {
                Ok(outcome) => {
                    if outcome.was_released() {
                        stats.expired_stock.repaired += 1;
                        tracing::info!(order_id = %reservation.order_id, "expired stock reservation");
                    }
                }
                Err(e) => {
                    stats.expired_stock.failed += 1;
                    stats
                        .errors
                        .push(format!("expired stock {}: {e}", reservation.id));
                }
            }
        }
    }

    /// Confirmed stock whose order is cancelled, refunded or missing: close
    /// the record without restoring stock (it was permanently consumed).
    async fn sweep_stale_confirmed(&self, stats: &mut SweepStats) {
        let batch = match self
            .store
            .stock_reservations_in_status(
                StockReservationStatus::Confirmed,
                self.config.sweep_batch_limit,
            )
            .await
        {
            Ok(batch) => batch,
            Err(e) => {
                stats.errors.push(format!("stale confirmed scan: {e}"));
                return;
            }
        };

        for reservation in batch {
            stats.stale_confirmed.scanned += 1;
            match self.repair_stale_confirmed(&reservation).await {
                Ok(true) => {
                    stats.stale_confirmed.repaired += 1;
                    tracing::info!(order_id = %reservation.order_id, "closed stale confirmed reservation");
                }
                Ok(false) => {}
                Err(e) => {
                    stats.stale_confirmed.failed += 1;
                    stats
                        .errors
                        .push(format!("stale confirmed {}: {e}", reservation.id));
                }
            }
        }
    }

    async fn repair_stale_confirmed(&self, reservation: &StockReservation) -> Result<bool> {
        let stale = match self.store.get_order(reservation.order_id).await? {
            None => true,
            Some(order) => matches!(
                order.status,
                OrderStatus::Cancelled | OrderStatus::Refunded
            ),
        };
        if !stale {
            return Ok(false);
        }
        let closed = self
            .store
            .transition_stock_reservation(
                reservation.order_id,
                StockReservationStatus::Confirmed,
                StockReservationStatus::Released,
            )
            .await?;
        Ok(closed.is_some())
    }

    /// Active coupon reservations past their lease: expire through the same
    /// release path as normal flows and note it on the order, best-effort.
    async fn sweep_expired_coupons(&self, stats: &mut SweepStats) {
        let batch = match self
            .store
            .coupon_reservations_in_status(
                CouponReservationStatus::Active,
                self.config.sweep_batch_limit,
            )
            .await
        {
            Ok(batch) => batch,
            Err(e) => {
                stats.errors.push(format!("expired coupon scan: {e}"));
                return;
            }
        };

        let now = self.clock.now();
        for reservation in batch {
            stats.expired_coupons.scanned += 1;
            if !reservation.is_expired(now) {
                continue;
            }
            match self.repair_expired_coupon(&reservation).await {
                Ok(true) => {
                    stats.expired_coupons.repaired += 1;
                    tracing::info!(
                        code = %reservation.code,
                        order_id = %reservation.order_id,
                        "expired coupon reservation"
                    );
                }
                Ok(false) => {}
                Err(e) => {
                    stats.expired_coupons.failed += 1;
                    stats
                        .errors
                        .push(format!("expired coupon {}: {e}", reservation.id));
                }
            }
        }
    }

    async fn repair_expired_coupon(&self, reservation: &CouponReservation) -> Result<bool> {
        let outcome = self
            .operator
            .expire_coupon(&reservation.code, reservation.order_id)
            .await?;
        if !outcome.was_released() {
            return Ok(false);
        }
        if let Err(e) = self
            .store
            .set_order_coupon_state(
                reservation.order_id,
                CouponReservationStatus::Expired,
                self.clock.now(),
            )
            .await
        {
            tracing::warn!(order_id = %reservation.order_id, error = %e, "coupon state note failed");
        }
        Ok(true)
    }

    /// Orders stuck in pending payment past the configured window with no
    /// payment-session reference: release their reservations and cancel.
    async fn sweep_stale_checkouts(&self, stats: &mut SweepStats) {
        let batch = match self
            .store
            .orders_in_status(OrderStatus::PendingPayment, self.config.sweep_batch_limit)
            .await
        {
            Ok(batch) => batch,
            Err(e) => {
                stats.errors.push(format!("stale checkout scan: {e}"));
                return;
            }
        };

        for order in batch {
            stats.stale_checkouts.scanned += 1;
            match self.repair_stale_checkout(&order).await {
                Ok(true) => {
                    stats.stale_checkouts.repaired += 1;
                    tracing::info!(order_id = %order.id, "cancelled stale incomplete checkout");
                }
                Ok(false) => {}
                Err(e) => {
                    stats.stale_checkouts.failed += 1;
                    stats.errors.push(format!("stale checkout {}: {e}", order.id));
                }
            }
        }
    }

    async fn repair_stale_checkout(&self, order: &Order) -> Result<bool> {
        let now = self.clock.now();
        if order.payment_session.is_some()
            || now.signed_duration_since(order.created_at) <= self.config.pending_payment_timeout
        {
            return Ok(false);
        }

        self.operator.release_stock(order.id).await?;
        if let Some(code) = &order.coupon_code {
            self.operator.release_coupon(code, order.id).await?;
        }

        let cancelled = self
            .store
            .transition_order(
                order.id,
                OrderStatus::PendingPayment,
                OrderStatus::Cancelled,
                now,
            )
            .await?;
        Ok(cancelled.is_some())
    }

    async fn purge_idempotency(&self, stats: &mut SweepStats) {
        let cutoff = self.clock.now() - self.config.idempotency_retention;
        match self.store.purge_idempotency_before(cutoff).await {
            Ok(purged) => stats.idempotency_purged = purged,
            Err(e) => stats.errors.push(format!("idempotency purge: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{Duration, Utc};
    use common::{OrderId, UserId};
    use domain::{Coupon, CouponCode, LineItem, Money, PaymentMethod, StockKey};
    use reservation_store::InMemoryReservationStore;

    struct Harness {
        store: InMemoryReservationStore,
        clock: ManualClock,
        operator: ReservationOperator<InMemoryReservationStore, ManualClock>,
        sweeper: RepairSweeper<InMemoryReservationStore, ManualClock>,
    }

    fn harness() -> Harness {
        let store = InMemoryReservationStore::new();
        let clock = ManualClock::new(Utc::now());
        let operator = ReservationOperator::new(store.clone(), clock.clone());
        let sweeper = RepairSweeper::new(store.clone(), clock.clone(), EngineConfig::default());
        Harness {
            store,
            clock,
            operator,
            sweeper,
        }
    }

    fn order(id: OrderId, clock: &ManualClock, coupon: Option<CouponCode>) -> Order {
        let now = clock.now();
        Order {
            id,
            user_id: UserId::new(),
            items: vec![LineItem::new("SKU-001", 1)],
            total: Money::from_cents(1_000),
            payment_method: PaymentMethod::Prepaid,
            status: OrderStatus::PendingPayment,
            coupon_code: coupon,
            coupon_state: None,
            payment_session: None,
            idempotency_key: "k1".to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn clean_system_reports_zero_repairs() {
        let h = harness();
        let stats = h.sweeper.run_once().await;
        assert!(stats.is_clean());
        assert!(stats.errors.is_empty());
    }

    #[tokio::test]
    async fn orphaned_reservation_is_released_after_grace() {
        let h = harness();
        let key = StockKey::product("SKU-001");
        h.store.set_stock_level(&key, 1).await.unwrap();
        h.operator
            .reserve_stock(OrderId::new(), &[LineItem::new("SKU-001", 1)], Duration::hours(1))
            .await
            .unwrap();
        // No order record was ever created: the checkout crashed mid-flight.

        // Inside the grace window nothing happens.
        let stats = h.sweeper.run_once().await;
        assert_eq!(stats.orphaned_stock.repaired, 0);

        h.clock.advance(Duration::minutes(6));
        let stats = h.sweeper.run_once().await;
        assert_eq!(stats.orphaned_stock.repaired, 1);
        assert_eq!(h.store.stock_level(&key).await.unwrap(), Some(1));

        // Re-running finds nothing left to heal.
        let stats = h.sweeper.run_once().await;
        assert_eq!(stats.orphaned_stock.repaired, 0);
    }

    #[tokio::test]
    async fn expired_reservation_is_reclaimed_with_its_order_present() {
        let h = harness();
        let key = StockKey::product("SKU-001");
        h.store.set_stock_level(&key, 2).await.unwrap();

        let order_id = OrderId::new();
        h.operator
            .reserve_stock(order_id, &[LineItem::new("SKU-001", 2)], Duration::minutes(15))
            .await
            .unwrap();
        h.store
            .insert_order(order(order_id, &h.clock, None))
            .await
            .unwrap();

        // Lease plus grace must both run out.
        h.clock.advance(Duration::minutes(19));
        let stats = h.sweeper.run_once().await;
        assert_eq!(stats.expired_stock.repaired, 0);

        h.clock.advance(Duration::minutes(2));
        let stats = h.sweeper.run_once().await;
        assert_eq!(stats.expired_stock.repaired, 1);
        assert_eq!(h.store.stock_level(&key).await.unwrap(), Some(2));

        let reservation = h
            .store
            .stock_reservations_in_status(StockReservationStatus::Expired, 10)
            .await
            .unwrap();
        assert_eq!(reservation.len(), 1);
    }

    #[tokio::test]
    async fn stale_confirmed_reservation_closes_without_restore() {
        let h = harness();
        let key = StockKey::product("SKU-001");
        h.store.set_stock_level(&key, 1).await.unwrap();

        let order_id = OrderId::new();
        h.operator
            .reserve_stock(order_id, &[LineItem::new("SKU-001", 1)], Duration::minutes(15))
            .await
            .unwrap();
        h.operator.confirm_stock(order_id).await.unwrap();
        // Order record missing entirely (e.g. purged by support tooling).

        let stats = h.sweeper.run_once().await;
        assert_eq!(stats.stale_confirmed.repaired, 1);
        // Stock stays consumed.
        assert_eq!(h.store.stock_level(&key).await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn confirmed_reservation_with_live_order_is_untouched() {
        let h = harness();
        h.store
            .set_stock_level(&StockKey::product("SKU-001"), 1)
            .await
            .unwrap();

        let order_id = OrderId::new();
        h.operator
            .reserve_stock(order_id, &[LineItem::new("SKU-001", 1)], Duration::minutes(15))
            .await
            .unwrap();
        h.operator.confirm_stock(order_id).await.unwrap();
        let mut o = order(order_id, &h.clock, None);
        o.status = OrderStatus::Paid;
        h.store.insert_order(o).await.unwrap();

        let stats = h.sweeper.run_once().await;
        assert_eq!(stats.stale_confirmed.repaired, 0);
    }

    #[tokio::test]
    async fn expired_coupon_reservation_returns_the_slot() {
        let h = harness();
        let code = CouponCode::new("SAVE10");
        h.store
            .upsert_coupon(Coupon::new("SAVE10").with_usage_limit(1))
            .await
            .unwrap();

        let order_id = OrderId::new();
        h.operator
            .reserve_coupon(&code, order_id, None, Duration::minutes(15))
            .await
            .unwrap();
        h.store
            .insert_order(order(order_id, &h.clock, Some(code.clone())))
            .await
            .unwrap();

        h.clock.advance(Duration::minutes(16));
        let stats = h.sweeper.run_once().await;
        assert_eq!(stats.expired_coupons.repaired, 1);

        let coupon = h.store.get_coupon(&code).await.unwrap().unwrap();
        assert_eq!(coupon.reserved_count, 0);
        let order = h.store.get_order(order_id).await.unwrap().unwrap();
        assert_eq!(order.coupon_state, Some(CouponReservationStatus::Expired));

        // The slot is free again.
        assert!(h.store.try_increment_reserved_count(&code).await.unwrap());
    }

    #[tokio::test]
    async fn stale_checkout_is_cancelled_and_reservations_released() {
        let h = harness();
        let key = StockKey::product("SKU-001");
        h.store.set_stock_level(&key, 1).await.unwrap();
        let code = CouponCode::new("SAVE10");
        h.store
            .upsert_coupon(Coupon::new("SAVE10").with_usage_limit(1))
            .await
            .unwrap();

        let order_id = OrderId::new();
        h.operator
            .reserve_stock(order_id, &[LineItem::new("SKU-001", 1)], Duration::days(2))
            .await
            .unwrap();
        h.operator
            .reserve_coupon(&code, order_id, None, Duration::days(2))
            .await
            .unwrap();
        h.store
            .insert_order(order(order_id, &h.clock, Some(code.clone())))
            .await
            .unwrap();

        h.clock.advance(Duration::days(1) + Duration::minutes(1));
        let stats = h.sweeper.run_once().await;
        assert_eq!(stats.stale_checkouts.repaired, 1);

        let order = h.store.get_order(order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);
        assert_eq!(h.store.stock_level(&key).await.unwrap(), Some(1));
        let coupon = h.store.get_coupon(&code).await.unwrap().unwrap();
        assert_eq!(coupon.reserved_count, 0);
    }

    #[tokio::test]
    async fn pending_order_with_payment_session_is_left_alone() {
        let h = harness();
        let order_id = OrderId::new();
        let mut o = order(order_id, &h.clock, None);
        o.payment_session = Some("sess_1".to_string());
        h.store.insert_order(o).await.unwrap();

        h.clock.advance(Duration::days(2));
        let stats = h.sweeper.run_once().await;
        assert_eq!(stats.stale_checkouts.repaired, 0);

        let order = h.store.get_order(order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::PendingPayment);
    }

    #[tokio::test]
    async fn sweep_purges_idempotency_records_past_retention() {
        let h = harness();
        h.store
            .claim_idempotency("checkout", "old", h.clock.now())
            .await
            .unwrap();

        h.clock.advance(Duration::days(8));
        let stats = h.sweeper.run_once().await;
        assert_eq!(stats.idempotency_purged, 1);
    }
}
