//! Pricing service trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use domain::{LineItem, Money, ProductId};

use crate::error::CheckoutError;

/// Monetary totals for a cart, as computed by the external pricing layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quote {
    /// Sum of line prices before tax.
    pub subtotal: Money,
    /// Value-added tax.
    pub vat: Money,
    /// Amount to charge.
    pub total: Money,
}

/// Trait for the external pricing/quote collaborator.
#[async_trait]
pub trait PricingService: Send + Sync {
    /// Computes monetary totals for the given cart items.
    async fn quote(&self, items: &[LineItem]) -> Result<Quote, CheckoutError>;
}

#[derive(Debug, Default)]
struct InMemoryPricingState {
    prices: HashMap<ProductId, Money>,
    vat_rate_bps: i64,
    fail_on_quote: bool,
}

/// In-memory pricing service for testing.
#[derive(Debug, Clone)]
pub struct InMemoryPricingService {
    state: Arc<RwLock<InMemoryPricingState>>,
}

impl InMemoryPricingService {
    /// Creates a pricing service with a 20% VAT rate and no prices.
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(InMemoryPricingState {
                prices: HashMap::new(),
                vat_rate_bps: 2_000,
                fail_on_quote: false,
            })),
        }
    }

    /// Sets the unit price for a product.
    pub fn set_price(&self, product_id: impl Into<ProductId>, unit_price: Money) {
        self.state
            .write()
            .unwrap()
            .prices
            .insert(product_id.into(), unit_price);
    }

    /// Configures the service to fail on the next quote call.
    pub fn set_fail_on_quote(&self, fail: bool) {
        self.state.write().unwrap().fail_on_quote = fail;
    }
}

impl Default for InMemoryPricingService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PricingService for InMemoryPricingService {
    async fn quote(&self, items: &[LineItem]) -> Result<Quote, CheckoutError> {
        let state = self.state.read().unwrap();

        if state.fail_on_quote {
            return Err(CheckoutError::Pricing("pricing unavailable".to_string()));
        }

        let mut subtotal = Money::zero();
        for item in items {
            let unit_price = state.prices.get(&item.product_id).ok_or_else(|| {
                CheckoutError::Pricing(format!("no price for product {}", item.product_id))
            })?;
            subtotal += unit_price.multiply(item.quantity);
        }

        let vat = Money::from_cents(subtotal.cents() * state.vat_rate_bps / 10_000);
        Ok(Quote {
            subtotal,
            vat,
            total: subtotal + vat,
        })
    }
}
