//! External collaborators consumed by the engine.

pub mod pricing;

pub use pricing::{InMemoryPricingService, PricingService, Quote};
