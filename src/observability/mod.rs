//! Observability: structured logging, in-process statistics and Prometheus export

pub mod logging;
pub mod metrics;
pub mod prometheus;

pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{metrics, MetricsCollector, MetricsSnapshot};

// Span macros for structured logging
pub use logging::{request_span, stage_span};
