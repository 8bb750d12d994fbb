//! Checkout orchestrator: turns a cart into an order under resource
//! contention, with compensation on partial failure.

use common::{OrderId, UserId};
use domain::{
    CouponCode, CouponReservationStatus, LineItem, Money, Order, OrderStatus, PaymentMethod,
};
use reservation_store::ReservationStore;
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{CheckoutError, Result};
use crate::idempotency::{IdempotencyGuard, IdempotencyOutcome};
use crate::operator::ReservationOperator;
use crate::services::pricing::PricingService;

/// Route identifier scoping checkout idempotency keys.
pub const ROUTE_CHECKOUT: &str = "checkout";

/// A checkout attempt as handed over by the HTTP layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutRequest {
    /// The customer checking out.
    pub user_id: UserId,

    /// Cart contents.
    pub items: Vec<LineItem>,

    /// Coupon to apply, if any.
    pub coupon_code: Option<CouponCode>,

    /// How the order will be paid.
    pub payment_method: PaymentMethod,

    /// Client-supplied idempotency key.
    pub idempotency_key: String,
}

/// The response returned to the caller and replayed on retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckoutResponse {
    /// The created order.
    pub order_id: OrderId,

    /// Order status right after checkout.
    pub status: OrderStatus,

    /// Amount charged, as quoted.
    pub total: Money,

    /// The coupon that was applied, if any.
    pub coupon: Option<CouponCode>,
}

/// Composes pricing, stock reservation, coupon reservation and order
/// creation into one logical unit.
///
/// The engine never leaves a reservation orphaned as a direct result of a
/// failed call: every failure after the stock step compensates what was
/// acquired before the error propagates. Crash-induced orphans are handled
/// by the repair sweeper instead.
pub struct CheckoutEngine<S, P, C> {
    store: S,
    pricing: P,
    clock: C,
    config: EngineConfig,
    operator: ReservationOperator<S, C>,
    guard: IdempotencyGuard<S, C>,
}

impl<S, P, C> CheckoutEngine<S, P, C>
where
    S: ReservationStore + Clone,
    P: PricingService,
    C: Clock + Clone,
{
    /// Creates a new checkout engine.
    pub fn new(store: S, pricing: P, clock: C, config: EngineConfig) -> Self {
        let operator = ReservationOperator::new(store.clone(), clock.clone());
        let guard =
            IdempotencyGuard::new(store.clone(), clock.clone(), config.idempotency_retention);
        Self {
            store,
            pricing,
            clock,
            config,
            operator,
            guard,
        }
    }

    /// The reservation operator, for callers that manage reservations
    /// outside a full checkout (cancellation paths, admin tooling).
    pub fn operator(&self) -> &ReservationOperator<S, C> {
        &self.operator
    }

    /// The idempotency guard shared by the engine's routes.
    pub fn guard(&self) -> &IdempotencyGuard<S, C> {
        &self.guard
    }

    /// Runs a checkout attempt.
    ///
    /// A retried request with a known idempotency key replays the original
    /// response, including the identical order id, and performs no new
    /// reservation. Resource-contention failures surface with structured
    /// detail after compensating whatever was already acquired.
    #[tracing::instrument(skip(self, request), fields(idempotency_key = %request.idempotency_key))]
    pub async fn checkout(&self, request: CheckoutRequest) -> Result<CheckoutResponse> {
        metrics::counter!("checkout_requests_total").increment(1);
        let started = std::time::Instant::now();

        match self.guard.begin(ROUTE_CHECKOUT, &request.idempotency_key).await? {
            IdempotencyOutcome::Replay(stored) => {
                let response = serde_json::from_value(stored)?;
                tracing::info!("checkout replayed from idempotency record");
                return Ok(response);
            }
            IdempotencyOutcome::Conflict => {
                return Err(CheckoutError::IdempotencyConflict {
                    route: ROUTE_CHECKOUT.to_string(),
                    key: request.idempotency_key.clone(),
                });
            }
            IdempotencyOutcome::Proceed => {}
        }

        let result = self.run_checkout(&request).await;

        match &result {
            Ok(response) => {
                self.guard
                    .complete(ROUTE_CHECKOUT, &request.idempotency_key, response)
                    .await?;
                metrics::counter!("checkout_completed_total").increment(1);
            }
            Err(e) => {
                // Release the claim so the client may retry after the failure.
                self.guard
                    .abandon(ROUTE_CHECKOUT, &request.idempotency_key)
                    .await?;
                metrics::counter!("checkout_failed_total").increment(1);
                tracing::info!(error = %e, "checkout failed");
            }
        }

        metrics::histogram!("checkout_duration_seconds").record(started.elapsed().as_secs_f64());
        result
    }

    async fn run_checkout(&self, request: &CheckoutRequest) -> Result<CheckoutResponse> {
        // 1. Price the cart before touching any capacity.
        let quote = self.pricing.quote(&request.items).await?;

        let order_id = OrderId::new();

        // 2. Reserve stock. On OutOfStock nothing is held and no order exists.
        self.operator
            .reserve_stock(order_id, &request.items, self.config.stock_ttl)
            .await?;

        // 3. Reserve the coupon; a failure here must give the stock back.
        if let Some(code) = &request.coupon_code {
            if let Err(e) = self
                .operator
                .reserve_coupon(code, order_id, Some(request.user_id), self.config.coupon_ttl)
                .await
            {
                self.compensate(order_id, request.coupon_code.as_ref()).await;
                return Err(e);
            }
        }

        // 4. Create the order. Payment-on-delivery settles synchronously;
        //    asynchronous methods wait for the provider event.
        let now = self.clock.now();
        let status = if request.payment_method.settles_at_checkout() {
            OrderStatus::Confirmed
        } else {
            OrderStatus::PendingPayment
        };
        let order = Order {
            id: order_id,
            user_id: request.user_id,
            items: request.items.clone(),
            total: quote.total,
            payment_method: request.payment_method,
            status,
            coupon_code: request.coupon_code.clone(),
            coupon_state: request
                .coupon_code
                .as_ref()
                .map(|_| CouponReservationStatus::Active),
            payment_session: None,
            idempotency_key: request.idempotency_key.clone(),
            created_at: now,
            updated_at: now,
        };

        if let Err(e) = self.store.insert_order(order).await {
            self.compensate(order_id, request.coupon_code.as_ref()).await;
            return Err(e.into());
        }

        if status == OrderStatus::Confirmed
            && let Err(e) = self.settle_synchronously(order_id, request).await
        {
            self.compensate(order_id, request.coupon_code.as_ref()).await;
            return Err(e);
        }

        tracing::info!(%order_id, %status, total = %quote.total, "order created");
        Ok(CheckoutResponse {
            order_id,
            status,
            total: quote.total,
            coupon: request.coupon_code.clone(),
        })
    }

    /// Finalizes the reservations of a payment-on-delivery order: the sale is
    /// settled, so neither may be handed back by a later expiry sweep.
    async fn settle_synchronously(
        &self,
        order_id: OrderId,
        request: &CheckoutRequest,
    ) -> Result<()> {
        self.operator.confirm_stock(order_id).await?;
        if let Some(code) = &request.coupon_code {
            self.operator.consume_coupon(code, order_id).await?;
            self.store
                .set_order_coupon_state(order_id, CouponReservationStatus::Consumed, self.clock.now())
                .await?;
        }
        Ok(())
    }

    /// Releases every reservation the failed checkout acquired. Best-effort:
    /// each release is status-guarded, so repeats and already-closed holds
    /// are no-ops, and individual failures are left to the sweeper.
    async fn compensate(&self, order_id: OrderId, coupon_code: Option<&CouponCode>) {
        if let Err(e) = self.operator.release_stock(order_id).await {
            tracing::error!(%order_id, error = %e, "stock compensation failed");
        }
        if let Some(code) = coupon_code
            && let Err(e) = self.operator.release_coupon(code, order_id).await
        {
            tracing::error!(%order_id, code = %code, error = %e, "coupon compensation failed");
        }
        metrics::counter!("checkout_compensations_total").increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::services::pricing::InMemoryPricingService;
    use chrono::Utc;
    use domain::{Coupon, StockKey};
    use reservation_store::InMemoryReservationStore;

    type TestEngine = CheckoutEngine<InMemoryReservationStore, InMemoryPricingService, ManualClock>;

    async fn setup() -> (TestEngine, InMemoryReservationStore, InMemoryPricingService) {
        let store = InMemoryReservationStore::new();
        let pricing = InMemoryPricingService::new();
        let clock = ManualClock::new(Utc::now());

        store
            .set_stock_level(&StockKey::product("SKU-001"), 10)
            .await
            .unwrap();
        pricing.set_price("SKU-001", Money::from_cents(1_000));

        let engine = CheckoutEngine::new(
            store.clone(),
            pricing.clone(),
            clock,
            EngineConfig::default(),
        );
        (engine, store, pricing)
    }

    fn request(key: &str) -> CheckoutRequest {
        CheckoutRequest {
            user_id: UserId::new(),
            items: vec![LineItem::new("SKU-001", 2)],
            coupon_code: None,
            payment_method: PaymentMethod::Prepaid,
            idempotency_key: key.to_string(),
        }
    }

    #[tokio::test]
    async fn prepaid_checkout_creates_pending_order() {
        let (engine, store, _) = setup().await;

        let response = engine.checkout(request("k1")).await.unwrap();
        assert_eq!(response.status, OrderStatus::PendingPayment);
        assert_eq!(response.total.cents(), 2_400);

        let order = store.get_order(response.order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::PendingPayment);
        assert_eq!(order.idempotency_key, "k1");
        assert_eq!(
            store
                .stock_level(&StockKey::product("SKU-001"))
                .await
                .unwrap(),
            Some(8)
        );
    }

    #[tokio::test]
    async fn cash_on_delivery_settles_synchronously() {
        let (engine, store, _) = setup().await;

        let mut req = request("k1");
        req.payment_method = PaymentMethod::CashOnDelivery;
        let response = engine.checkout(req).await.unwrap();
        assert_eq!(response.status, OrderStatus::Confirmed);

        let reservation = store
            .active_stock_reservation(response.order_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            reservation.status,
            domain::StockReservationStatus::Confirmed
        );
    }

    #[tokio::test]
    async fn out_of_stock_creates_no_order_and_is_retryable() {
        let (engine, store, _) = setup().await;
        store
            .set_stock_level(&StockKey::product("SKU-001"), 1)
            .await
            .unwrap();

        let err = engine.checkout(request("k1")).await.unwrap_err();
        assert!(matches!(err, CheckoutError::OutOfStock { .. }));
        assert_eq!(store.order_count().await, 0);
        assert_eq!(
            store
                .stock_level(&StockKey::product("SKU-001"))
                .await
                .unwrap(),
            Some(1)
        );

        // The key was abandoned, so a retry after restock succeeds.
        store
            .set_stock_level(&StockKey::product("SKU-001"), 2)
            .await
            .unwrap();
        let response = engine.checkout(request("k1")).await.unwrap();
        assert_eq!(response.status, OrderStatus::PendingPayment);
    }

    #[tokio::test]
    async fn coupon_failure_releases_reserved_stock() {
        let (engine, store, _) = setup().await;
        store
            .upsert_coupon(Coupon::new("FULL").with_usage_limit(0))
            .await
            .unwrap();

        let mut req = request("k1");
        req.coupon_code = Some(CouponCode::new("FULL"));
        let err = engine.checkout(req).await.unwrap_err();
        assert!(matches!(err, CheckoutError::CouponLimitReached(_)));

        assert_eq!(store.order_count().await, 0);
        assert_eq!(
            store
                .stock_level(&StockKey::product("SKU-001"))
                .await
                .unwrap(),
            Some(10)
        );
    }

    #[tokio::test]
    async fn pricing_failure_holds_nothing() {
        let (engine, store, pricing) = setup().await;
        pricing.set_fail_on_quote(true);

        let err = engine.checkout(request("k1")).await.unwrap_err();
        assert!(matches!(err, CheckoutError::Pricing(_)));
        assert_eq!(store.stock_reservation_count().await, 0);
        assert_eq!(store.order_count().await, 0);
    }

    #[tokio::test]
    async fn retry_replays_the_original_order() {
        let (engine, store, _) = setup().await;

        let first = engine.checkout(request("k1")).await.unwrap();
        let second = engine.checkout(request("k1")).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(store.order_count().await, 1);
        assert_eq!(store.stock_reservation_count().await, 1);
        assert_eq!(
            store
                .stock_level(&StockKey::product("SKU-001"))
                .await
                .unwrap(),
            Some(8)
        );
    }
}
