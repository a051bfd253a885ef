//! shrinkray
//!
//! This library provides the core batch orchestration engine for shrinkray,
//! which optimizes sets of image files against a remote, quota-metered
//! compression service: bounded concurrency with adaptive throttling, a
//! circuit breaker for sustained outages, per-credential quota accounting,
//! and a backup/atomic-replace protocol so no source file is ever lost.

pub mod config;
pub mod models;
pub mod progress;
pub mod services;
