//! Reservation store: durable records plus the atomic single-record
//! conditional-update primitives the engine's safety rests on.
//!
//! Two implementations are provided:
//! - [`InMemoryReservationStore`] for tests and single-process deployments
//! - [`PostgresReservationStore`] backed by conditional `UPDATE` guards and
//!   partial unique indexes

pub mod error;
pub mod memory;
pub mod postgres;
pub mod store;

pub use common::{OrderId, UserId};
pub use error::{Result, StoreError};
pub use memory::InMemoryReservationStore;
pub use postgres::PostgresReservationStore;
pub use store::{CouponInsertOutcome, IdempotencyClaim, ReservationStore};
