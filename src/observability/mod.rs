//! # Observability
//!
//! Structured logging through `tracing` and Prometheus metrics through the
//! `metrics` facade. Component code only emits events and counters; this
//! module installs the subscriber and recorder at startup and renders the
//! scrape output for `GET /metrics`.

pub mod logging;
pub mod metrics;

pub use logging::init_logging;
pub use metrics::{install_recorder, track_http_metrics};
