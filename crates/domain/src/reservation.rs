//! Stock and coupon reservation records with their status machines.

use chrono::{DateTime, Utc};
use common::{OrderId, UserId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::value_objects::{CouponCode, LineItem};

/// Unique identifier for a reservation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReservationId(Uuid);

impl ReservationId {
    /// Creates a new random reservation ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ReservationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ReservationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for ReservationId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// The state of a stock reservation in its lifecycle.
///
/// State transitions:
/// ```text
/// Reserved ──┬──► Confirmed ──► Released   (stock already consumed)
///            ├──► Released                 (stock restored)
///            └──► Expired                  (stock restored)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StockReservationStatus {
    /// Capacity is provisionally held, bounded by the expiry lease.
    #[default]
    Reserved,

    /// Payment confirmed; the stock is permanently consumed.
    Confirmed,

    /// The hold was released and stock restored (terminal state).
    Released,

    /// The lease ran out before confirmation; stock restored (terminal state).
    Expired,
}

impl StockReservationStatus {
    /// Returns true if the reservation still holds capacity against an order.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            StockReservationStatus::Reserved | StockReservationStatus::Confirmed
        )
    }

    /// Returns true if releasing from this status must restore stock.
    pub fn restores_on_release(&self) -> bool {
        matches!(self, StockReservationStatus::Reserved)
    }

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StockReservationStatus::Released | StockReservationStatus::Expired
        )
    }

    /// Returns the status name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            StockReservationStatus::Reserved => "reserved",
            StockReservationStatus::Confirmed => "confirmed",
            StockReservationStatus::Released => "released",
            StockReservationStatus::Expired => "expired",
        }
    }
}

impl std::fmt::Display for StockReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A provisional, time-bounded claim on stock tied to one order.
///
/// Items are immutable once the reservation is created. An order has at most
/// one active (reserved or confirmed) stock reservation at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockReservation {
    /// Unique identifier for this reservation.
    pub id: ReservationId,

    /// The order holding the reservation.
    pub order_id: OrderId,

    /// The reserved lines; fixed at creation.
    pub items: Vec<LineItem>,

    /// Current lifecycle status.
    pub status: StockReservationStatus,

    /// Lease end; after this the sweeper may reclaim the capacity.
    pub expires_at: DateTime<Utc>,

    /// When the reservation was created.
    pub created_at: DateTime<Utc>,
}

impl StockReservation {
    /// Creates a new reservation in `Reserved` status.
    pub fn new(
        order_id: OrderId,
        items: Vec<LineItem>,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ReservationId::new(),
            order_id,
            items,
            status: StockReservationStatus::Reserved,
            expires_at,
            created_at,
        }
    }

    /// Returns true if the lease has run out at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// The state of a coupon reservation in its lifecycle.
///
/// State transitions:
/// ```text
/// Active ──┬──► Consumed   (finalized: used_count += 1)
///          ├──► Released   (reserved_count -= 1)
///          └──► Expired    (reserved_count -= 1)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CouponReservationStatus {
    /// A usage slot is provisionally held.
    #[default]
    Active,

    /// The use was finalized; the slot counts against `used_count`.
    Consumed,

    /// The hold was given back (terminal state).
    Released,

    /// The lease ran out before consumption (terminal state).
    Expired,
}

impl CouponReservationStatus {
    /// Returns true if the reservation holds a provisional slot.
    pub fn is_active(&self) -> bool {
        matches!(self, CouponReservationStatus::Active)
    }

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CouponReservationStatus::Released | CouponReservationStatus::Expired
        )
    }

    /// Returns the status name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            CouponReservationStatus::Active => "active",
            CouponReservationStatus::Consumed => "consumed",
            CouponReservationStatus::Released => "released",
            CouponReservationStatus::Expired => "expired",
        }
    }
}

impl std::fmt::Display for CouponReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A provisional claim on one usage slot of a coupon, tied to one order.
///
/// At most one reservation exists per (coupon, order). When per-user usage
/// limiting is enabled there is at most one active reservation per
/// (coupon, user) system-wide.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CouponReservation {
    /// Unique identifier for this reservation.
    pub id: ReservationId,

    /// The coupon whose slot is held.
    pub code: CouponCode,

    /// The order holding the slot.
    pub order_id: OrderId,

    /// The user the slot is held for, when known.
    pub user_id: Option<UserId>,

    /// Current lifecycle status.
    pub status: CouponReservationStatus,

    /// Lease end; after this the sweeper may reclaim the slot.
    pub expires_at: DateTime<Utc>,

    /// When the reservation was created.
    pub created_at: DateTime<Utc>,
}

impl CouponReservation {
    /// Creates a new reservation in `Active` status.
    pub fn new(
        code: CouponCode,
        order_id: OrderId,
        user_id: Option<UserId>,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ReservationId::new(),
            code,
            order_id,
            user_id,
            status: CouponReservationStatus::Active,
            expires_at,
            created_at,
        }
    }

    /// Returns true if the lease has run out at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}
