//! Gatekeeper - attempt throttling for sensitive operations
//!
//! This crate counts attempts per (identifier, action) pair inside a window
//! and blocks the pair once a configured limit is exceeded. State lives
//! either in this process or in a shared Redis instance; both backends
//! implement the same [`ratelimit::Limiter`] contract.

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;
