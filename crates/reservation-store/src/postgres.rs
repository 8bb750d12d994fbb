use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{OrderId, UserId};
use domain::{
    Coupon, CouponCode, CouponReservation, CouponReservationStatus, Order, OrderStatus,
    ReservationId, StockKey, StockReservation, StockReservationStatus,
};
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    Result, StoreError,
    store::{CouponInsertOutcome, IdempotencyClaim, ReservationStore},
};

/// PostgreSQL-backed reservation store.
///
/// Every conditional primitive maps onto one guarded statement:
/// `UPDATE … WHERE <precondition>` judged by `rows_affected`, or
/// `INSERT … ON CONFLICT` / unique-index violations for the insert-iff-absent
/// paths. No multi-record transactions are required.
#[derive(Clone)]
pub struct PostgresReservationStore {
    pool: PgPool,
}

/// Variant column value marking product-level stock.
const NO_VARIANT: &str = "";

fn variant_column(key: &StockKey) -> &str {
    key.variant_id
        .as_ref()
        .map(|v| v.as_str())
        .unwrap_or(NO_VARIANT)
}

fn parse_status<T: serde::de::DeserializeOwned>(s: String) -> Result<T> {
    serde_json::from_value(serde_json::Value::String(s)).map_err(StoreError::Serialization)
}

impl PostgresReservationStore {
    /// Creates a new PostgreSQL reservation store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    fn row_to_stock_reservation(row: PgRow) -> Result<StockReservation> {
        Ok(StockReservation {
            id: ReservationId::from(row.try_get::<Uuid, _>("id")?),
            order_id: OrderId::from_uuid(row.try_get::<Uuid, _>("order_id")?),
            items: serde_json::from_value(row.try_get("items")?)?,
            status: parse_status(row.try_get("status")?)?,
            expires_at: row.try_get("expires_at")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn row_to_coupon_reservation(row: PgRow) -> Result<CouponReservation> {
        Ok(CouponReservation {
            id: ReservationId::from(row.try_get::<Uuid, _>("id")?),
            code: CouponCode::new(row.try_get::<String, _>("code")?),
            order_id: OrderId::from_uuid(row.try_get::<Uuid, _>("order_id")?),
            user_id: row
                .try_get::<Option<Uuid>, _>("user_id")?
                .map(UserId::from_uuid),
            status: parse_status(row.try_get("status")?)?,
            expires_at: row.try_get("expires_at")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn row_to_coupon(row: PgRow) -> Result<Coupon> {
        Ok(Coupon {
            code: CouponCode::new(row.try_get::<String, _>("code")?),
            usage_limit: row.try_get::<Option<i32>, _>("usage_limit")?.map(|v| v as u32),
            usage_per_user: row
                .try_get::<Option<i32>, _>("usage_per_user")?
                .map(|v| v as u32),
            used_count: row.try_get::<i32, _>("used_count")? as u32,
            reserved_count: row.try_get::<i32, _>("reserved_count")? as u32,
        })
    }

    fn row_to_order(row: PgRow) -> Result<Order> {
        Ok(Order {
            id: OrderId::from_uuid(row.try_get::<Uuid, _>("id")?),
            user_id: UserId::from_uuid(row.try_get::<Uuid, _>("user_id")?),
            items: serde_json::from_value(row.try_get("items")?)?,
            total: domain::Money::from_cents(row.try_get("total_cents")?),
            payment_method: parse_status(row.try_get("payment_method")?)?,
            status: parse_status(row.try_get("status")?)?,
            coupon_code: row
                .try_get::<Option<String>, _>("coupon_code")?
                .map(CouponCode::new),
            coupon_state: row
                .try_get::<Option<String>, _>("coupon_state")?
                .map(parse_status)
                .transpose()?,
            payment_session: row.try_get("payment_session")?,
            idempotency_key: row.try_get("idempotency_key")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl ReservationStore for PostgresReservationStore {
    async fn stock_level(&self, key: &StockKey) -> Result<Option<i64>> {
        let available: Option<i64> = sqlx::query_scalar(
            "SELECT available FROM stock_levels WHERE product_id = $1 AND variant_id = $2",
        )
        .bind(key.product_id.as_str())
        .bind(variant_column(key))
        .fetch_optional(&self.pool)
        .await?;
        Ok(available)
    }

    async fn set_stock_level(&self, key: &StockKey, available: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO stock_levels (product_id, variant_id, available)
            VALUES ($1, $2, $3)
            ON CONFLICT (product_id, variant_id) DO UPDATE SET available = EXCLUDED.available
            "#,
        )
        .bind(key.product_id.as_str())
        .bind(variant_column(key))
        .bind(available)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn try_decrement_stock(&self, key: &StockKey, quantity: u32) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE stock_levels
            SET available = available - $3
            WHERE product_id = $1 AND variant_id = $2 AND available >= $3
            "#,
        )
        .bind(key.product_id.as_str())
        .bind(variant_column(key))
        .bind(quantity as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn restore_stock(&self, key: &StockKey, quantity: u32) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE stock_levels
            SET available = available + $3
            WHERE product_id = $1 AND variant_id = $2
            "#,
        )
        .bind(key.product_id.as_str())
        .bind(variant_column(key))
        .bind(quantity as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_stock_reservation(&self, reservation: StockReservation) -> Result<bool> {
        let items = serde_json::to_value(&reservation.items)?;
        let result = sqlx::query(
            r#"
            INSERT INTO stock_reservations (id, order_id, items, status, expires_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(reservation.id.as_uuid())
        .bind(reservation.order_id.as_uuid())
        .bind(items)
        .bind(reservation.status.as_str())
        .bind(reservation.expires_at)
        .bind(reservation.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(true),
            Err(sqlx::Error::Database(db_err))
                if db_err.constraint() == Some("uniq_active_stock_reservation") =>
            {
                Ok(false)
            }
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    async fn active_stock_reservation(
        &self,
        order_id: OrderId,
    ) -> Result<Option<StockReservation>> {
        let row = sqlx::query(
            r#"
            SELECT id, order_id, items, status, expires_at, created_at
            FROM stock_reservations
            WHERE order_id = $1 AND status IN ('reserved', 'confirmed')
            "#,
        )
        .bind(order_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.map(Self::row_to_stock_reservation).transpose()
    }

    async fn transition_stock_reservation(
        &self,
        order_id: OrderId,
        from: StockReservationStatus,
        to: StockReservationStatus,
    ) -> Result<Option<StockReservation>> {
        let row = sqlx::query(
            r#"
            UPDATE stock_reservations
            SET status = $3
            WHERE order_id = $1 AND status = $2
            RETURNING id, order_id, items, status, expires_at, created_at
            "#,
        )
        .bind(order_id.as_uuid())
        .bind(from.as_str())
        .bind(to.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(Self::row_to_stock_reservation).transpose()
    }

    async fn stock_reservations_in_status(
        &self,
        status: StockReservationStatus,
        limit: usize,
    ) -> Result<Vec<StockReservation>> {
        let rows = sqlx::query(
            r#"
            SELECT id, order_id, items, status, expires_at, created_at
            FROM stock_reservations
            WHERE status = $1
            ORDER BY created_at ASC
            LIMIT $2
            "#,
        )
        .bind(status.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Self::row_to_stock_reservation).collect()
    }

    async fn get_coupon(&self, code: &CouponCode) -> Result<Option<Coupon>> {
        let row = sqlx::query(
            "SELECT code, usage_limit, usage_per_user, used_count, reserved_count FROM coupons WHERE code = $1",
        )
        .bind(code.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(Self::row_to_coupon).transpose()
    }

    async fn upsert_coupon(&self, coupon: Coupon) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO coupons (code, usage_limit, usage_per_user, used_count, reserved_count)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (code) DO UPDATE SET
                usage_limit = EXCLUDED.usage_limit,
                usage_per_user = EXCLUDED.usage_per_user,
                used_count = EXCLUDED.used_count,
                reserved_count = EXCLUDED.reserved_count
            "#,
        )
        .bind(coupon.code.as_str())
        .bind(coupon.usage_limit.map(|v| v as i32))
        .bind(coupon.usage_per_user.map(|v| v as i32))
        .bind(coupon.used_count as i32)
        .bind(coupon.reserved_count as i32)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn try_increment_reserved_count(&self, code: &CouponCode) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE coupons
            SET reserved_count = reserved_count + 1
            WHERE code = $1
              AND (usage_limit IS NULL OR used_count + reserved_count < usage_limit)
            "#,
        )
        .bind(code.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn decrement_reserved_count(&self, code: &CouponCode) -> Result<()> {
        sqlx::query(
            "UPDATE coupons SET reserved_count = reserved_count - 1 WHERE code = $1 AND reserved_count > 0",
        )
        .bind(code.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finalize_coupon_use(&self, code: &CouponCode) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE coupons
            SET used_count = used_count + 1,
                reserved_count = GREATEST(reserved_count - 1, 0)
            WHERE code = $1
            "#,
        )
        .bind(code.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_coupon_reservation(
        &self,
        reservation: CouponReservation,
        enforce_per_user: bool,
    ) -> Result<CouponInsertOutcome> {
        let per_user = enforce_per_user && reservation.user_id.is_some();
        let result = sqlx::query(
            r#"
            INSERT INTO coupon_reservations
                (id, code, order_id, user_id, per_user, status, expires_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(reservation.id.as_uuid())
        .bind(reservation.code.as_str())
        .bind(reservation.order_id.as_uuid())
        .bind(reservation.user_id.map(|u| u.as_uuid()))
        .bind(per_user)
        .bind(reservation.status.as_str())
        .bind(reservation.expires_at)
        .bind(reservation.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(CouponInsertOutcome::Inserted),
            Err(sqlx::Error::Database(db_err))
                if db_err.constraint() == Some("uniq_coupon_order") =>
            {
                Ok(CouponInsertOutcome::AlreadyForOrder)
            }
            Err(sqlx::Error::Database(db_err))
                if db_err.constraint() == Some("uniq_active_coupon_user") =>
            {
                Ok(CouponInsertOutcome::UserHoldsActive)
            }
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    async fn get_coupon_reservation(
        &self,
        code: &CouponCode,
        order_id: OrderId,
    ) -> Result<Option<CouponReservation>> {
        let row = sqlx::query(
            r#"
            SELECT id, code, order_id, user_id, status, expires_at, created_at
            FROM coupon_reservations
            WHERE code = $1 AND order_id = $2
            "#,
        )
        .bind(code.as_str())
        .bind(order_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.map(Self::row_to_coupon_reservation).transpose()
    }

    async fn transition_coupon_reservation(
        &self,
        code: &CouponCode,
        order_id: OrderId,
        from: CouponReservationStatus,
        to: CouponReservationStatus,
    ) -> Result<Option<CouponReservation>> {
        let row = sqlx::query(
            r#"
            UPDATE coupon_reservations
            SET status = $4
            WHERE code = $1 AND order_id = $2 AND status = $3
            RETURNING id, code, order_id, user_id, status, expires_at, created_at
            "#,
        )
        .bind(code.as_str())
        .bind(order_id.as_uuid())
        .bind(from.as_str())
        .bind(to.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(Self::row_to_coupon_reservation).transpose()
    }

    async fn coupon_reservations_in_status(
        &self,
        status: CouponReservationStatus,
        limit: usize,
    ) -> Result<Vec<CouponReservation>> {
        let rows = sqlx::query(
            r#"
            SELECT id, code, order_id, user_id, status, expires_at, created_at
            FROM coupon_reservations
            WHERE status = $1
            ORDER BY created_at ASC
            LIMIT $2
            "#,
        )
        .bind(status.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(Self::row_to_coupon_reservation)
            .collect()
    }

    async fn insert_order(&self, order: Order) -> Result<()> {
        let items = serde_json::to_value(&order.items)?;
        sqlx::query(
            r#"
            INSERT INTO orders
                (id, user_id, items, total_cents, payment_method, status, coupon_code,
                 coupon_state, payment_session, idempotency_key, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(order.id.as_uuid())
        .bind(order.user_id.as_uuid())
        .bind(items)
        .bind(order.total.cents())
        .bind(match order.payment_method {
            domain::PaymentMethod::Prepaid => "prepaid",
            domain::PaymentMethod::CashOnDelivery => "cash_on_delivery",
        })
        .bind(order.status.as_str())
        .bind(order.coupon_code.as_ref().map(|c| c.as_str().to_string()))
        .bind(order.coupon_state.map(|s| s.as_str()))
        .bind(order.payment_session)
        .bind(order.idempotency_key)
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_order(&self, order_id: OrderId) -> Result<Option<Order>> {
        let row = sqlx::query("SELECT * FROM orders WHERE id = $1")
            .bind(order_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Self::row_to_order).transpose()
    }

    async fn transition_order(
        &self,
        order_id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<Order>> {
        let row = sqlx::query(
            r#"
            UPDATE orders
            SET status = $3, updated_at = $4
            WHERE id = $1 AND status = $2
            RETURNING *
            "#,
        )
        .bind(order_id.as_uuid())
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Self::row_to_order).transpose()
    }

    async fn set_order_coupon_state(
        &self,
        order_id: OrderId,
        state: CouponReservationStatus,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query("UPDATE orders SET coupon_state = $2, updated_at = $3 WHERE id = $1")
            .bind(order_id.as_uuid())
            .bind(state.as_str())
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn orders_in_status(&self, status: OrderStatus, limit: usize) -> Result<Vec<Order>> {
        let rows = sqlx::query(
            "SELECT * FROM orders WHERE status = $1 ORDER BY created_at ASC LIMIT $2",
        )
        .bind(status.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Self::row_to_order).collect()
    }

    async fn claim_idempotency(
        &self,
        route: &str,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<IdempotencyClaim> {
        let result = sqlx::query(
            r#"
            INSERT INTO idempotency_keys (route, key, status, created_at)
            VALUES ($1, $2, 'in_progress', $3)
            ON CONFLICT (route, key) DO NOTHING
            "#,
        )
        .bind(route)
        .bind(key)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(IdempotencyClaim::Claimed);
        }

        // Lost the insert race or the key was already known; read the record.
        let row = sqlx::query(
            "SELECT status, response FROM idempotency_keys WHERE route = $1 AND key = $2",
        )
        .bind(route)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let status: String = row.try_get("status")?;
                if status == "completed" {
                    let response: Option<serde_json::Value> = row.try_get("response")?;
                    Ok(IdempotencyClaim::Completed(
                        response.unwrap_or(serde_json::Value::Null),
                    ))
                } else {
                    Ok(IdempotencyClaim::InFlight)
                }
            }
            // The holder released between our insert and read; treat as a
            // concurrent duplicate and let the client retry.
            None => Ok(IdempotencyClaim::InFlight),
        }
    }

    async fn complete_idempotency(
        &self,
        route: &str,
        key: &str,
        response: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE idempotency_keys
            SET status = 'completed', response = $3, completed_at = $4
            WHERE route = $1 AND key = $2
            "#,
        )
        .bind(route)
        .bind(key)
        .bind(response)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn release_idempotency(&self, route: &str, key: &str) -> Result<()> {
        sqlx::query(
            "DELETE FROM idempotency_keys WHERE route = $1 AND key = $2 AND status = 'in_progress'",
        )
        .bind(route)
        .bind(key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn purge_idempotency_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM idempotency_keys WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn record_payment_event(
        &self,
        event_id: &str,
        order_id: OrderId,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO payment_events (event_id, order_id, received_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(event_id)
        .bind(order_id.as_uuid())
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}
