//! Shared identifier types used across the reservation engine.

pub mod types;

pub use types::{OrderId, UserId};
