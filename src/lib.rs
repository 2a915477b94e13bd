//! Ratekeeper - In-Process Admission Control
//!
//! This crate implements a family of rate limiters behind one capability
//! trait: lazy and ticking token buckets, a leaky bucket, fixed and sliding
//! windows, a multi-tier sliding log, and a composite that enforces several
//! limiters at once. State is local to the process and guarded per limiter.

pub mod config;
pub mod error;
pub mod ratelimit;
