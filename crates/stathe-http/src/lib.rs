//! HTTP surface of the exporter: the scrape endpoint and the middleware
//! that instruments other handlers.

pub mod error;
pub mod handler;
pub mod middleware;

pub use error::MetricsApiError;
pub use handler::{HandlerOptions, MetricsState, metrics_router, serve_metrics};
pub use middleware::{HandlerMetrics, HttpMiddleware, track_http_metrics};
