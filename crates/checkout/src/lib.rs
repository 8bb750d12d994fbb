//! Reservation and idempotency engine for checkout flows.
//!
//! This crate protects two finite, contended resources (product stock and
//! promotional-coupon usage slots) against overselling when checkout
//! attempts race, while guaranteeing that a retried request never produces a
//! duplicate side effect and that abandoned checkouts do not leak capacity:
//! 1. The reservation operator claims and releases capacity through
//!    first-committer-wins conditional updates.
//! 2. The idempotency guard deduplicates retried mutating requests.
//! 3. The checkout engine composes pricing, stock, coupon and order creation
//!    with compensation on partial failure.
//! 4. The payment confirmation handler applies provider events exactly once.
//! 5. The repair sweeper reclaims capacity held by crashed or abandoned flows.

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod idempotency;
pub mod operator;
pub mod payment;
pub mod services;
pub mod sweeper;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use engine::{CheckoutEngine, CheckoutRequest, CheckoutResponse, ROUTE_CHECKOUT};
pub use error::{CheckoutError, InsufficientStock, Result};
pub use idempotency::{IdempotencyGuard, IdempotencyOutcome};
pub use operator::{CouponReservationOutcome, ReleaseOutcome, ReservationOperator};
pub use payment::{ConfirmationOutcome, PaymentConfirmationHandler};
pub use services::pricing::{InMemoryPricingService, PricingService, Quote};
pub use sweeper::{CheckStats, RepairSweeper, SweepStats};
