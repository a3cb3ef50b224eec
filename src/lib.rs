//! Routegate - a path-routing reverse proxy backed by a pool of worker routers
//!
//! This library provides a reverse proxy that:
//! - Accepts HTTP traffic on a single coordinator listener
//! - Hands every request to one of a fixed pool of worker routers
//! - Routes by first matching path prefix to a configured upstream
//! - Fetches the full upstream body with a fixed GET and relays it back
//! - Correlates replies to requests by id, so workers can run dispatches concurrently
//! - Bounds every dispatch with a deadline and answers 504 when it expires

pub mod balancer;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod router;
pub mod upstream;
pub mod worker;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
