//! Observability for the relay.
//!
//! All instrumentation uses `#[instrument(skip_all)]` with explicit fields.
//! Message text, tokens and secrets are never recorded.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `relay_connections_active` | Gauge | none |
//! | `relay_rooms_active` | Gauge | none |
//! | `relay_broadcast_deliveries_total` | Counter | none |
//! | `relay_broadcast_drops_total` | Counter | none |
//! | `relay_backbone_publish_total` | Counter | `status` |
//! | `relay_backbone_consume_total` | Counter | `status` |
//! | `relay_admissions_total` | Counter | `outcome` |
//! | `relay_connections_replaced_total` | Counter | none |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
pub use metrics::init_metrics_recorder;
