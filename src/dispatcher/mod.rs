// ABOUTME: Dispatcher module - the loop that moves queued requests onto the shared executor.
// ABOUTME: Owns the executor seam, concurrency slots, and the admin surface.

mod dispatcher;
mod executor;
mod outcome;

pub use dispatcher::*;
pub use executor::*;
pub use outcome::*;

#[cfg(test)]
mod dispatcher_test;
