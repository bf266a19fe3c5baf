//! Size-tiered upload rate limits.
//!
//! Upload endpoints pay by weight: large files are scarce (2 per 5 minutes),
//! medium ones rationed (5 per minute), small ones cheap (10 per minute).
//! These sit on top of the global per-caller limits, not instead of them.

use std::time::Duration;

use hk_harness::rate_limiter::{RateLimit, RateLimitDecision, RateLimiter};

/// Boundary between small and medium uploads.
pub const SMALL_MAX_BYTES: u64 = 1024 * 1024;
/// Boundary between medium and large uploads.
pub const MEDIUM_MAX_BYTES: u64 = 10 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeTier {
    Small,
    Medium,
    Large,
}

impl SizeTier {
    /// Classify an upload by its declared size.
    pub fn for_size(bytes: u64) -> Self {
        if bytes <= SMALL_MAX_BYTES {
            SizeTier::Small
        } else if bytes <= MEDIUM_MAX_BYTES {
            SizeTier::Medium
        } else {
            SizeTier::Large
        }
    }

    pub fn namespace(&self) -> &'static str {
        match self {
            SizeTier::Small => "upload_small",
            SizeTier::Medium => "upload_medium",
            SizeTier::Large => "upload_large",
        }
    }

    pub fn limit(&self) -> RateLimit {
        match self {
            SizeTier::Small => RateLimit::per_minute(10),
            SizeTier::Medium => RateLimit::per_minute(5),
            SizeTier::Large => RateLimit::new(2, Duration::from_secs(300)),
        }
    }
}

/// Check the tier limit for one caller and declared size.
pub async fn check_upload_limit(
    limiter: &RateLimiter,
    client: &str,
    declared_size: u64,
) -> RateLimitDecision {
    let tier = SizeTier::for_size(declared_size);
    limiter.check(tier.namespace(), client, &tier.limit()).await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
