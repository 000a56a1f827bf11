// ABOUTME: Root module for toolgate - dispatch and rate-limit coordination for a shared tool.
// ABOUTME: Re-exports all public types from submodules.

pub mod clock;
pub mod config;
pub mod coordinator;
pub mod dispatcher;
pub mod error;
pub mod health;
pub mod node;
pub mod prelude;
pub mod queue;
pub mod store;

pub use error::ToolgateError;
