//! Rate limiting and quota enforcement.
//!
//! Both subsystems linearize per-session decisions through the store's
//! atomic read-modify-write operations; no local lock is held across a
//! store call.

pub mod quota;
pub mod rate;

pub use quota::{QuotaDecision, QuotaManager};
pub use rate::{RateDecision, RateLimiter};
