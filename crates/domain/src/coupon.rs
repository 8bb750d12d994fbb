//! Coupon record with usage accounting.

use serde::{Deserialize, Serialize};

use crate::value_objects::CouponCode;

/// A promotional coupon with optional usage limits.
///
/// `used_count` counts finalized uses; `reserved_count` counts provisional
/// uses in flight. When `usage_limit` is set, `used_count + reserved_count`
/// never exceeds it, and `reserved_count` never goes negative. Both are
/// upheld by the store's conditional counter updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coupon {
    /// The code customers enter at checkout.
    pub code: CouponCode,

    /// Total number of uses allowed across all users, if limited.
    pub usage_limit: Option<u32>,

    /// Number of uses allowed per user, if limited.
    pub usage_per_user: Option<u32>,

    /// Finalized uses.
    pub used_count: u32,

    /// Provisional uses currently reserved.
    pub reserved_count: u32,
}

impl Coupon {
    /// Creates an unlimited coupon.
    pub fn new(code: impl Into<CouponCode>) -> Self {
        Self {
            code: code.into(),
            usage_limit: None,
            usage_per_user: None,
            used_count: 0,
            reserved_count: 0,
        }
    }

    /// Sets the total usage limit.
    pub fn with_usage_limit(mut self, limit: u32) -> Self {
        self.usage_limit = Some(limit);
        self
    }

    /// Sets the per-user usage limit.
    pub fn with_usage_per_user(mut self, limit: u32) -> Self {
        self.usage_per_user = Some(limit);
        self
    }

    /// Returns true if one more slot can be reserved right now.
    pub fn has_capacity(&self) -> bool {
        match self.usage_limit {
            Some(limit) => self.used_count + self.reserved_count < limit,
            None => true,
        }
    }

    /// Returns true if reservations for this coupon are deduplicated per user.
    pub fn limits_per_user(&self) -> bool {
        self.usage_per_user.is_some()
    }
}
