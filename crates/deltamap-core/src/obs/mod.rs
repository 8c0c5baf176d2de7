//! Observability: runtime telemetry (metrics) and sink abstractions.
//!
//! This module does not look inside commands or change sets; it only
//! counts what the translator reports through [`MetricsEvent`].

pub(crate) mod metrics;
pub(crate) mod sink;

// re-exports
pub use metrics::{EventOps, EventState, TableCounters};
pub use sink::{MetricsEvent, MetricsSink, OpKind, metrics_report, metrics_reset_all};
