//! Observability for the booth service.
//!
//! All instrumentation uses `#[instrument(skip_all)]` with explicit safe
//! fields. Handshake tokens and the Redis URL are never recorded.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `booth_connections_active` | Gauge | `state` |
//! | `booth_advance_total` | Counter | `outcome` |
//! | `booth_advance_duration_seconds` | Histogram | none |
//! | `booth_store_latency_seconds` | Histogram | `operation` |
//! | `booth_lost_messages_buffered_total` | Counter | none |
//! | `booth_bus_messages_total` | Counter | `channel` |
//! | `booth_waitlist_length` | Gauge | none |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
pub use metrics::init_metrics_recorder;
