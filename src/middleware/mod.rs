//! HTTP middleware.
//!
//! Request logging is handled by `tracing_actix_web::TracingLogger`; the
//! only custom middleware is the per-endpoint metrics recorder.

pub mod metrics;

pub use metrics::RequestMetrics;
