// ABOUTME: Store module - the shared coordination store abstraction and its backends.
// ABOUTME: Any key-value store with atomic create-if-absent and TTLs can back it.

mod memory;
#[cfg(feature = "redis")]
mod redis_store;
mod traits;

pub mod keys;

pub use memory::*;
#[cfg(feature = "redis")]
pub use redis_store::*;
pub use traits::*;
