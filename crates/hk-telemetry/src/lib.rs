//! Telemetry and observability for housekeep services.
//!
//! One shared layer across the cluster: environment-driven structured
//! logging (human in development, JSON towards the log shipper), a
//! thread-safe metrics collector with Prometheus text export, and axum
//! middleware that measures every API request by route family. Breaker
//! states, pool sizes, and session counts are exported as gauges;
//! processing time and substrate latency as histograms with the standard
//! 1 ms – 10 s buckets.

pub mod logging;
pub mod metrics;
pub mod middleware;
