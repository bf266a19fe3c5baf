//! Core library for housekeep — shared types, configuration, and retry
//! policy for the property-management platform runtime.
//!
//! Every service crate in the workspace builds on this one. It provides:
//! - Environment-driven configuration with production-hardening checks
//! - Identity types shared across service boundaries (users, services, roles)
//! - The human-readable work-order number format
//! - Exponential backoff with jitter for background retry loops

pub mod backoff;
pub mod config;
pub mod types;
