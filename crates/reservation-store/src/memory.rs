use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::OrderId;
use domain::{
    Coupon, CouponCode, CouponReservation, CouponReservationStatus, IdempotencyRecord,
    IdempotencyStatus, Order, OrderStatus, PaymentEventRecord, StockKey, StockReservation,
    StockReservationStatus,
};
use tokio::sync::RwLock;

use crate::{
    Result,
    store::{CouponInsertOutcome, IdempotencyClaim, ReservationStore},
};

#[derive(Default)]
struct State {
    stock: HashMap<StockKey, i64>,
    stock_reservations: Vec<StockReservation>,
    coupons: HashMap<CouponCode, Coupon>,
    coupon_reservations: Vec<CouponReservation>,
    orders: HashMap<OrderId, Order>,
    idempotency: HashMap<(String, String), IdempotencyRecord>,
    payment_events: HashMap<String, PaymentEventRecord>,
}

/// In-memory reservation store for tests and single-process deployments.
///
/// Every operation takes the single write lock, which gives it the same
/// record-level compare-and-update semantics as the PostgreSQL
/// implementation: of N concurrent conditional updates on one record,
/// exactly one observes its precondition and wins.
#[derive(Clone, Default)]
pub struct InMemoryReservationStore {
    state: Arc<RwLock<State>>,
}

impl InMemoryReservationStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of stock reservation records.
    pub async fn stock_reservation_count(&self) -> usize {
        self.state.read().await.stock_reservations.len()
    }

    /// Returns the total number of coupon reservation records.
    pub async fn coupon_reservation_count(&self) -> usize {
        self.state.read().await.coupon_reservations.len()
    }

    /// Returns the total number of orders.
    pub async fn order_count(&self) -> usize {
        self.state.read().await.orders.len()
    }

    /// Returns the total number of idempotency records.
    pub async fn idempotency_record_count(&self) -> usize {
        self.state.read().await.idempotency.len()
    }

    /// Clears all records.
    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        *state = State::default();
    }
}

#[async_trait]
impl ReservationStore for InMemoryReservationStore {
    async fn stock_level(&self, key: &StockKey) -> Result<Option<i64>> {
        Ok(self.state.read().await.stock.get(key).copied())
    }

    async fn set_stock_level(&self, key: &StockKey, available: i64) -> Result<()> {
        self.state.write().await.stock.insert(key.clone(), available);
        Ok(())
    }

    async fn try_decrement_stock(&self, key: &StockKey, quantity: u32) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.stock.get_mut(key) {
            Some(available) if *available >= quantity as i64 => {
                *available -= quantity as i64;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn restore_stock(&self, key: &StockKey, quantity: u32) -> Result<()> {
        let mut state = self.state.write().await;
        *state.stock.entry(key.clone()).or_insert(0) += quantity as i64;
        Ok(())
    }

    async fn insert_stock_reservation(&self, reservation: StockReservation) -> Result<bool> {
        let mut state = self.state.write().await;
        let has_active = state
            .stock_reservations
            .iter()
            .any(|r| r.order_id == reservation.order_id && r.status.is_active());
        if has_active {
            return Ok(false);
        }
        state.stock_reservations.push(reservation);
        Ok(true)
    }

    async fn active_stock_reservation(
        &self,
        order_id: OrderId,
    ) -> Result<Option<StockReservation>> {
        let state = self.state.read().await;
        Ok(state
            .stock_reservations
            .iter()
            .find(|r| r.order_id == order_id && r.status.is_active())
            .cloned())
    }

    async fn transition_stock_reservation(
        &self,
        order_id: OrderId,
        from: StockReservationStatus,
        to: StockReservationStatus,
    ) -> Result<Option<StockReservation>> {
        let mut state = self.state.write().await;
        let reservation = state
            .stock_reservations
            .iter_mut()
            .find(|r| r.order_id == order_id && r.status == from);
        Ok(reservation.map(|r| {
            r.status = to;
            r.clone()
        }))
    }

    async fn stock_reservations_in_status(
        &self,
        status: StockReservationStatus,
        limit: usize,
    ) -> Result<Vec<StockReservation>> {
        let state = self.state.read().await;
        let mut matching: Vec<_> = state
            .stock_reservations
            .iter()
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        matching.sort_by_key(|r| r.created_at);
        matching.truncate(limit);
        Ok(matching)
    }

    async fn get_coupon(&self, code: &CouponCode) -> Result<Option<Coupon>> {
        Ok(self.state.read().await.coupons.get(code).cloned())
    }

    async fn upsert_coupon(&self, coupon: Coupon) -> Result<()> {
        self.state
            .write()
            .await
            .coupons
            .insert(coupon.code.clone(), coupon);
        Ok(())
    }

    async fn try_increment_reserved_count(&self, code: &CouponCode) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.coupons.get_mut(code) {
            Some(coupon) if coupon.has_capacity() => {
                coupon.reserved_count += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn decrement_reserved_count(&self, code: &CouponCode) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(coupon) = state.coupons.get_mut(code) {
            coupon.reserved_count = coupon.reserved_count.saturating_sub(1);
        }
        Ok(())
    }

    async fn finalize_coupon_use(&self, code: &CouponCode) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(coupon) = state.coupons.get_mut(code) {
            coupon.used_count += 1;
            coupon.reserved_count = coupon.reserved_count.saturating_sub(1);
        }
        Ok(())
    }

    async fn insert_coupon_reservation(
        &self,
        reservation: CouponReservation,
        enforce_per_user: bool,
    ) -> Result<CouponInsertOutcome> {
        let mut state = self.state.write().await;

        let for_order = state
            .coupon_reservations
            .iter()
            .any(|r| r.code == reservation.code && r.order_id == reservation.order_id);
        if for_order {
            return Ok(CouponInsertOutcome::AlreadyForOrder);
        }

        if enforce_per_user
            && let Some(user_id) = reservation.user_id
        {
            let user_holds = state.coupon_reservations.iter().any(|r| {
                r.code == reservation.code && r.user_id == Some(user_id) && r.status.is_active()
            });
            if user_holds {
                return Ok(CouponInsertOutcome::UserHoldsActive);
            }
        }

        state.coupon_reservations.push(reservation);
        Ok(CouponInsertOutcome::Inserted)
    }

    async fn get_coupon_reservation(
        &self,
        code: &CouponCode,
        order_id: OrderId,
    ) -> Result<Option<CouponReservation>> {
        let state = self.state.read().await;
        Ok(state
            .coupon_reservations
            .iter()
            .find(|r| &r.code == code && r.order_id == order_id)
            .cloned())
    }

    async fn transition_coupon_reservation(
        &self,
        code: &CouponCode,
        order_id: OrderId,
        from: CouponReservationStatus,
        to: CouponReservationStatus,
    ) -> Result<Option<CouponReservation>> {
        let mut state = self.state.write().await;
        let reservation = state
            .coupon_reservations
            .iter_mut()
            .find(|r| &r.code == code && r.order_id == order_id && r.status == from);
        Ok(reservation.map(|r| {
            r.status = to;
            r.clone()
        }))
    }

    async fn coupon_reservations_in_status(
        &self,
        status: CouponReservationStatus,
        limit: usize,
    ) -> Result<Vec<CouponReservation>> {
        let state = self.state.read().await;
        let mut matching: Vec<_> = state
            .coupon_reservations
            .iter()
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        matching.sort_by_key(|r| r.created_at);
        matching.truncate(limit);
        Ok(matching)
    }

    async fn insert_order(&self, order: Order) -> Result<()> {
        self.state.write().await.orders.insert(order.id, order);
        Ok(())
    }

    async fn get_order(&self, order_id: OrderId) -> Result<Option<Order>> {
        Ok(self.state.read().await.orders.get(&order_id).cloned())
    }

    async fn transition_order(
        &self,
        order_id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<Order>> {
        let mut state = self.state.write().await;
        let order = state
            .orders
            .get_mut(&order_id)
            .filter(|o| o.status == from);
        Ok(order.map(|o| {
            o.status = to;
            o.updated_at = now;
            o.clone()
        }))
    }

    async fn set_order_coupon_state(
        &self,
        order_id: OrderId,
        coupon_state: CouponReservationStatus,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(order) = state.orders.get_mut(&order_id) {
            order.coupon_state = Some(coupon_state);
            order.updated_at = now;
        }
        Ok(())
    }

    async fn orders_in_status(&self, status: OrderStatus, limit: usize) -> Result<Vec<Order>> {
        let state = self.state.read().await;
        let mut matching: Vec<_> = state
            .orders
            .values()
            .filter(|o| o.status == status)
            .cloned()
            .collect();
        matching.sort_by_key(|o| o.created_at);
        matching.truncate(limit);
        Ok(matching)
    }

    async fn claim_idempotency(
        &self,
        route: &str,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<IdempotencyClaim> {
        let mut state = self.state.write().await;
        let map_key = (route.to_string(), key.to_string());
        match state.idempotency.get(&map_key) {
            None => {
                state
                    .idempotency
                    .insert(map_key, IdempotencyRecord::in_progress(route, key, now));
                Ok(IdempotencyClaim::Claimed)
            }
            Some(record) => match record.status {
                IdempotencyStatus::InProgress => Ok(IdempotencyClaim::InFlight),
                IdempotencyStatus::Completed => Ok(IdempotencyClaim::Completed(
                    record.response.clone().unwrap_or(serde_json::Value::Null),
                )),
            },
        }
    }

    async fn complete_idempotency(
        &self,
        route: &str,
        key: &str,
        response: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(record) = state
            .idempotency
            .get_mut(&(route.to_string(), key.to_string()))
        {
            record.status = IdempotencyStatus::Completed;
            record.response = Some(response);
            record.completed_at = Some(now);
        }
        Ok(())
    }

    async fn release_idempotency(&self, route: &str, key: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let map_key = (route.to_string(), key.to_string());
        if state
            .idempotency
            .get(&map_key)
            .is_some_and(|r| r.status == IdempotencyStatus::InProgress)
        {
            state.idempotency.remove(&map_key);
        }
        Ok(())
    }

    async fn purge_idempotency_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.write().await;
        let before = state.idempotency.len();
        state.idempotency.retain(|_, r| r.created_at >= cutoff);
        Ok((before - state.idempotency.len()) as u64)
    }

    async fn record_payment_event(
        &self,
        event_id: &str,
        order_id: OrderId,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        if state.payment_events.contains_key(event_id) {
            return Ok(false);
        }
        state.payment_events.insert(
            event_id.to_string(),
            PaymentEventRecord {
                event_id: event_id.to_string(),
                order_id,
                received_at: now,
            },
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use domain::LineItem;

    fn reservation_for(order_id: OrderId) -> StockReservation {
        let now = Utc::now();
        StockReservation::new(
            order_id,
            vec![LineItem::new("SKU-001", 2)],
            now,
            now + Duration::minutes(15),
        )
    }

    #[tokio::test]
    async fn decrement_respects_available_stock() {
        let store = InMemoryReservationStore::new();
        let key = StockKey::product("SKU-001");
        store.set_stock_level(&key, 3).await.unwrap();

        assert!(store.try_decrement_stock(&key, 2).await.unwrap());
        assert!(!store.try_decrement_stock(&key, 2).await.unwrap());
        assert_eq!(store.stock_level(&key).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn decrement_of_unknown_key_fails() {
        let store = InMemoryReservationStore::new();
        let key = StockKey::product("MISSING");
        assert!(!store.try_decrement_stock(&key, 1).await.unwrap());
    }

    #[tokio::test]
    async fn restore_adds_back() {
        let store = InMemoryReservationStore::new();
        let key = StockKey::variant("SKU-001", "L");
        store.set_stock_level(&key, 5).await.unwrap();

        store.try_decrement_stock(&key, 5).await.unwrap();
        store.restore_stock(&key, 5).await.unwrap();
        assert_eq!(store.stock_level(&key).await.unwrap(), Some(5));
    }

    #[tokio::test]
    async fn second_active_reservation_for_order_is_rejected() {
        let store = InMemoryReservationStore::new();
        let order_id = OrderId::new();

        assert!(
            store
                .insert_stock_reservation(reservation_for(order_id))
                .await
                .unwrap()
        );
        assert!(
            !store
                .insert_stock_reservation(reservation_for(order_id))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn released_reservation_does_not_block_a_new_one() {
        let store = InMemoryReservationStore::new();
        let order_id = OrderId::new();

        store
            .insert_stock_reservation(reservation_for(order_id))
            .await
            .unwrap();
        store
            .transition_stock_reservation(
                order_id,
                StockReservationStatus::Reserved,
                StockReservationStatus::Released,
            )
            .await
            .unwrap();

        assert!(
            store
                .insert_stock_reservation(reservation_for(order_id))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn transition_is_status_conditional() {
        let store = InMemoryReservationStore::new();
        let order_id = OrderId::new();
        store
            .insert_stock_reservation(reservation_for(order_id))
            .await
            .unwrap();

        let released = store
            .transition_stock_reservation(
                order_id,
                StockReservationStatus::Reserved,
                StockReservationStatus::Released,
            )
            .await
            .unwrap();
        assert!(released.is_some());

        // Second release finds nothing in Reserved: no-op.
        let again = store
            .transition_stock_reservation(
                order_id,
                StockReservationStatus::Reserved,
                StockReservationStatus::Released,
            )
            .await
            .unwrap();
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn coupon_increment_stops_at_limit() {
        let store = InMemoryReservationStore::new();
        let code = CouponCode::new("LIMIT2");
        store
            .upsert_coupon(Coupon::new("LIMIT2").with_usage_limit(2))
            .await
            .unwrap();

        assert!(store.try_increment_reserved_count(&code).await.unwrap());
        assert!(store.try_increment_reserved_count(&code).await.unwrap());
        assert!(!store.try_increment_reserved_count(&code).await.unwrap());

        store.decrement_reserved_count(&code).await.unwrap();
        assert!(store.try_increment_reserved_count(&code).await.unwrap());
    }

    #[tokio::test]
    async fn decrement_floors_at_zero() {
        let store = InMemoryReservationStore::new();
        let code = CouponCode::new("FLOOR");
        store.upsert_coupon(Coupon::new("FLOOR")).await.unwrap();

        store.decrement_reserved_count(&code).await.unwrap();
        let coupon = store.get_coupon(&code).await.unwrap().unwrap();
        assert_eq!(coupon.reserved_count, 0);
    }

    #[tokio::test]
    async fn coupon_reservation_unique_per_order() {
        let store = InMemoryReservationStore::new();
        let code = CouponCode::new("SAVE10");
        let order_id = OrderId::new();
        let now = Utc::now();
        let expires = now + Duration::minutes(15);

        let first = CouponReservation::new(code.clone(), order_id, None, now, expires);
        let second = CouponReservation::new(code.clone(), order_id, None, now, expires);

        assert_eq!(
            store.insert_coupon_reservation(first, false).await.unwrap(),
            CouponInsertOutcome::Inserted
        );
        assert_eq!(
            store
                .insert_coupon_reservation(second, false)
                .await
                .unwrap(),
            CouponInsertOutcome::AlreadyForOrder
        );
    }

    #[tokio::test]
    async fn per_user_uniqueness_only_counts_active_rows() {
        let store = InMemoryReservationStore::new();
        let code = CouponCode::new("ONCEEACH");
        let user_id = common::UserId::new();
        let now = Utc::now();
        let expires = now + Duration::minutes(15);

        let first =
            CouponReservation::new(code.clone(), OrderId::new(), Some(user_id), now, expires);
        let first_order = first.order_id;
        assert_eq!(
            store.insert_coupon_reservation(first, true).await.unwrap(),
            CouponInsertOutcome::Inserted
        );

        // Same user, different order: blocked while the first row is active.
        let second =
            CouponReservation::new(code.clone(), OrderId::new(), Some(user_id), now, expires);
        assert_eq!(
            store
                .insert_coupon_reservation(second.clone(), true)
                .await
                .unwrap(),
            CouponInsertOutcome::UserHoldsActive
        );

        // After release the user may reserve again.
        store
            .transition_coupon_reservation(
                &code,
                first_order,
                CouponReservationStatus::Active,
                CouponReservationStatus::Released,
            )
            .await
            .unwrap();
        assert_eq!(
            store.insert_coupon_reservation(second, true).await.unwrap(),
            CouponInsertOutcome::Inserted
        );
    }

    #[tokio::test]
    async fn idempotency_claim_lifecycle() {
        let store = InMemoryReservationStore::new();
        let now = Utc::now();

        assert_eq!(
            store.claim_idempotency("checkout", "k1", now).await.unwrap(),
            IdempotencyClaim::Claimed
        );
        assert_eq!(
            store.claim_idempotency("checkout", "k1", now).await.unwrap(),
            IdempotencyClaim::InFlight
        );

        store
            .complete_idempotency("checkout", "k1", serde_json::json!({"ok": true}), now)
            .await
            .unwrap();
        match store.claim_idempotency("checkout", "k1", now).await.unwrap() {
            IdempotencyClaim::Completed(v) => assert_eq!(v, serde_json::json!({"ok": true})),
            other => panic!("expected Completed, got {other:?}"),
        }

        // Same key on a different route is independent.
        assert_eq!(
            store
                .claim_idempotency("refund", "k1", now)
                .await
                .unwrap(),
            IdempotencyClaim::Claimed
        );
    }

    #[tokio::test]
    async fn release_drops_only_in_progress_claims() {
        let store = InMemoryReservationStore::new();
        let now = Utc::now();

        store.claim_idempotency("checkout", "k1", now).await.unwrap();
        store.release_idempotency("checkout", "k1").await.unwrap();
        assert_eq!(
            store.claim_idempotency("checkout", "k1", now).await.unwrap(),
            IdempotencyClaim::Claimed
        );

        store
            .complete_idempotency("checkout", "k1", serde_json::Value::Null, now)
            .await
            .unwrap();
        store.release_idempotency("checkout", "k1").await.unwrap();
        assert!(matches!(
            store.claim_idempotency("checkout", "k1", now).await.unwrap(),
            IdempotencyClaim::Completed(_)
        ));
    }

    #[tokio::test]
    async fn purge_removes_old_records() {
        let store = InMemoryReservationStore::new();
        let old = Utc::now() - Duration::days(10);
        let now = Utc::now();

        store.claim_idempotency("checkout", "old", old).await.unwrap();
        store.claim_idempotency("checkout", "new", now).await.unwrap();

        let purged = store
            .purge_idempotency_before(now - Duration::days(7))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert_eq!(store.idempotency_record_count().await, 1);
    }

    #[tokio::test]
    async fn payment_events_are_insert_once() {
        let store = InMemoryReservationStore::new();
        let order_id = OrderId::new();
        let now = Utc::now();

        assert!(store.record_payment_event("evt_1", order_id, now).await.unwrap());
        assert!(!store.record_payment_event("evt_1", order_id, now).await.unwrap());
        assert!(store.record_payment_event("evt_2", order_id, now).await.unwrap());
    }

    #[tokio::test]
    async fn order_transition_is_status_conditional() {
        let store = InMemoryReservationStore::new();
        let now = Utc::now();
        let order = Order {
            id: OrderId::new(),
            user_id: common::UserId::new(),
            items: vec![LineItem::new("SKU-001", 1)],
            total: domain::Money::from_cents(1000),
            payment_method: domain::PaymentMethod::Prepaid,
            status: OrderStatus::PendingPayment,
            coupon_code: None,
            coupon_state: None,
            payment_session: None,
            idempotency_key: "k1".to_string(),
            created_at: now,
            updated_at: now,
        };
        let order_id = order.id;
        store.insert_order(order).await.unwrap();

        let paid = store
            .transition_order(order_id, OrderStatus::PendingPayment, OrderStatus::Paid, now)
            .await
            .unwrap();
        assert!(paid.is_some());

        let again = store
            .transition_order(order_id, OrderStatus::PendingPayment, OrderStatus::Paid, now)
            .await
            .unwrap();
        assert!(again.is_none());
    }
}
