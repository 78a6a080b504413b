//! Turnstile - Per-client admission control
//!
//! This crate implements the admission layer of an HTTP service: every
//! request is charged against a token bucket keyed by its client, and
//! clients that exhaust their bucket are turned away with `429 Too Many
//! Requests` until tokens refill. Buckets live in memory only and are
//! reclaimed by a background sweeper once their client goes quiet.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
