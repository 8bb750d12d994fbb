//! Data model for the reservation and idempotency engine.
//!
//! This crate defines the records the engine protects and the status state
//! machines they move through:
//! - Stock and coupon reservations with their lifecycle statuses
//! - Coupons with usage counters
//! - Orders with the payment-driven status machine
//! - Idempotency records and the payment event ledger
//!
//! The types here are plain serializable data. All mutation goes through the
//! conditional-update primitives of the `reservation-store` crate.

pub mod coupon;
pub mod idempotency;
pub mod order;
pub mod reservation;
pub mod value_objects;

pub use common::{OrderId, UserId};
pub use coupon::Coupon;
pub use idempotency::{IdempotencyRecord, IdempotencyStatus, PaymentEventRecord};
pub use order::{Order, OrderStatus, PaymentMethod};
pub use reservation::{
    CouponReservation, CouponReservationStatus, ReservationId, StockReservation,
    StockReservationStatus,
};
pub use value_objects::{CouponCode, LineItem, Money, ProductId, StockKey, VariantId};
