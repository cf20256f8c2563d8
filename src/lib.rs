//! Floodgate - Durable Sliding-Window Rate Limiting
//!
//! This crate decides whether a caller may perform an action again, based on
//! a rolling window quota and a minimum spacing between attempts. History is
//! kept per caller fingerprint in a pluggable store, so decisions survive
//! across independent processes, and the store cleans up after itself
//! without a background scheduler.

pub mod config;
pub mod error;
pub mod ratelimit;
