//! Observability: structured logging setup and span macros
//!
//! Session health counters live with the session itself, see
//! [`HealthMetrics`](crate::session::HealthMetrics).

pub mod logging;

// Re-export for convenience
pub use logging::{init_default_logging, init_logging, LogFormat};

// Span macros for structured logging
pub use logging::{mqtt_span, registry_span, session_span};
