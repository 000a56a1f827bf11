// ABOUTME: Queue module - priority tiers, scheduled requests, and the pause valve.
// ABOUTME: Ordering guarantees hold within a single instance only.

mod manager;
mod request;

pub use manager::*;
pub use request::*;
