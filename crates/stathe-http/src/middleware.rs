//! Per-handler request instrumentation.
//!
//! Every instrumented handler gets its own set of families, distinguished
//! by a `handler` const label:
//!
//! * `<ns>_http_requests_total{method,code}`
//! * `<ns>_http_request_duration_seconds{method,code}` (histogram)
//! * `<ns>_http_request_size_bytes{method,code}` (summary)
//! * `<ns>_http_response_size_bytes{method,code}` (summary)
//!
//! Observations are recorded once the inner handler has produced its
//! response. A request whose future is dropped before that, for example
//! because the client went away, records nothing.

use std::{sync::Arc, time::Duration};

use axum::{
    Router,
    body::HttpBody,
    extract::{Request, State},
    http::{HeaderMap, Method, Version, header},
    middleware::{self, Next},
    response::Response,
};
use stathe_common::{config::DEFAULT_NAMESPACE, error::Result};
use stathe_metrics::{
    CounterVec, HistogramOpts, HistogramVec, Observer, Opts, Registry, SummaryOpts, SummaryVec,
    exponential_buckets,
};
use tokio::time::Instant;
use tracing::warn;

pub struct HttpMiddleware {
    registry: Registry,
    namespace: String,
    subsystem: String,
    buckets: Vec<f64>,
}

impl HttpMiddleware {
    /// `buckets` defaults to `exponential_buckets(0.1, 1.5, 5)`.
    pub fn new(registry: Registry, buckets: Option<Vec<f64>>) -> Result<Self> {
        let buckets = match buckets {
            Some(buckets) => buckets,
            None => exponential_buckets(0.1, 1.5, 5)?,
        };
        Ok(Self {
            registry,
            namespace: DEFAULT_NAMESPACE.to_string(),
            subsystem: String::new(),
            buckets,
        })
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn subsystem(mut self, subsystem: impl Into<String>) -> Self {
        self.subsystem = subsystem.into();
        self
    }

    fn opts(&self, name: &str, help: &str) -> Opts {
        Opts::new(name, help)
            .namespace(&self.namespace)
            .subsystem(&self.subsystem)
    }

    /// Registers the families for `handler_name`.
    pub fn instrument(&self, handler_name: &str) -> Result<Arc<HandlerMetrics>> {
        let registry = self.registry.with_const_labels(&[("handler", handler_name)])?;
        let labels = ["method", "code"];

        let requests_total = registry.register_counter_vec(
            self.opts("http_requests_total", "Tracks the number of HTTP requests."),
            &labels,
        )?;
        let request_duration = registry.register_histogram_vec(
            HistogramOpts::new(self.opts(
                "http_request_duration_seconds",
                "Tracks the latencies for HTTP requests.",
            ))
            .buckets(self.buckets.clone()),
            &labels,
        )?;
        let request_size = registry.register_summary_vec(
            SummaryOpts::new(
                self.opts("http_request_size_bytes", "Tracks the size of HTTP requests."),
            ),
            &labels,
        )?;
        let response_size = registry.register_summary_vec(
            SummaryOpts::new(
                self.opts("http_response_size_bytes", "Tracks the size of HTTP responses."),
            ),
            &labels,
        )?;

        Ok(Arc::new(HandlerMetrics {
            handler: handler_name.to_string(),
            requests_total,
            request_duration,
            request_size,
            response_size,
        }))
    }

    /// Instruments every route of `router` under `handler_name`.
    pub fn wrap(&self, handler_name: &str, router: Router) -> Result<Router> {
        let metrics = self.instrument(handler_name)?;
        Ok(router.route_layer(middleware::from_fn_with_state(metrics, track_http_metrics)))
    }
}

pub struct HandlerMetrics {
    handler: String,
    requests_total: Arc<CounterVec>,
    request_duration: Arc<HistogramVec>,
    request_size: Arc<SummaryVec>,
    response_size: Arc<SummaryVec>,
}

impl HandlerMetrics {
    pub fn handler(&self) -> &str {
        &self.handler
    }

    /// Records one completed request in all four families.
    pub fn observe(
        &self,
        method: &Method,
        code: u16,
        duration: Duration,
        request_size: u64,
        response_size: u64,
    ) -> Result<()> {
        let method = method.as_str().to_ascii_lowercase();
        let code = code.to_string();
        let labels = [method.as_str(), code.as_str()];

        self.requests_total.with_label_values(&labels)?.inc();
        self.request_duration
            .with_label_values(&labels)?
            .observe_duration(duration);
        self.request_size
            .with_label_values(&labels)?
            .observe(request_size as f64);
        self.response_size
            .with_label_values(&labels)?
            .observe(response_size as f64);
        Ok(())
    }
}

pub async fn track_http_metrics(
    State(metrics): State<Arc<HandlerMetrics>>,
    request: Request,
    next: Next,
) -> Response {
    let started_at = Instant::now();
    let method = request.method().clone();
    let request_size = approximate_request_size(&request);

    let response = next.run(request).await;
    let response_size = response.body().size_hint().exact().unwrap_or(0);

    if let Err(err) = metrics.observe(
        &method,
        response.status().as_u16(),
        started_at.elapsed(),
        request_size,
        response_size,
    ) {
        warn!(handler = %metrics.handler, error = %err, "failed to record request metrics");
    }
    response
}

/// Request line, headers and declared body length.
fn approximate_request_size(request: &Request) -> u64 {
    let mut size = request.uri().to_string().len() + request.method().as_str().len();
    size += version_len(request.version());
    size += headers_len(request.headers());

    let body = request
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok())
        .or_else(|| request.body().size_hint().exact())
        .unwrap_or(0);
    size as u64 + body
}

fn version_len(version: Version) -> usize {
    match version {
        Version::HTTP_2 => "HTTP/2.0".len(),
        Version::HTTP_3 => "HTTP/3.0".len(),
        _ => "HTTP/1.1".len(),
    }
}

fn headers_len(headers: &HeaderMap) -> usize {
    headers
        .iter()
        .map(|(name, value)| name.as_str().len() + value.len())
        .sum()
}
