//! Gatekeeper - Hierarchical Multi-Tenant Admission Control
//!
//! This crate decides, per incoming API request, whether to admit or reject
//! it. Every request draws from two token buckets in turn: a tenant-wide
//! organization bucket and a per-region bucket nested under it. Buckets live
//! in Redis so that every gateway process sees the same budget, with an
//! in-process store taking over whenever Redis is unreachable.

pub mod clock;
pub mod config;
pub mod error;
pub mod metrics;
pub mod ratelimit;
pub mod tenant;
