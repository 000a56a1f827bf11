// ABOUTME: Coordinator module - rate limiting, error classification, and cross-instance claims.
// ABOUTME: Everything a dispatcher consults before it executes a request.

mod classifier;
mod instance;
mod random;
mod rate_limiter;

pub use classifier::*;
pub use instance::*;
pub use random::*;
pub use rate_limiter::*;
