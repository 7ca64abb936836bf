//! Sliding Limiter - Sliding Window Rate Limiting Engine
//!
//! This crate decides, per logical key (an IP address, a user id, ...),
//! whether a request fits a configured rate such as `10 requests in 1 minute`.
//! Requests are counted in fixed time buckets and the trailing window is
//! approximated from the current and previous bucket. Counters live either
//! in process memory or in a shared store such as Redis, updated through
//! detached tasks so that decisions never wait on the store.

pub mod config;
pub mod error;
pub mod ratelimit;
