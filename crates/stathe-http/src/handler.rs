use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    extract::{RawQuery, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use stathe_common::error::Result;
use stathe_metrics::{
    CounterVec, Gauge, Opts, Registry,
    expfmt::{self, Format, RenderOptions},
};
use tracing::{debug, warn};

use crate::error::MetricsApiError;

#[derive(Debug, Clone, Default)]
pub struct HandlerOptions {
    /// Serve OpenMetrics when the scraper asks for it.
    pub enable_open_metrics: bool,
    /// Add `_created` samples to OpenMetrics output.
    pub created_samples: bool,
    /// Register scrape counters under this namespace into the served registry.
    pub instrument_namespace: Option<String>,
}

struct ScrapeMetrics {
    requests_total: Arc<CounterVec>,
    in_flight: Arc<Gauge>,
    errors_total: Arc<CounterVec>,
}

impl ScrapeMetrics {
    fn register(registry: &Registry, namespace: &str) -> Result<Self> {
        Ok(Self {
            requests_total: registry.register_counter_vec(
                Opts::new(
                    "scrape_requests_total",
                    "Total number of scrapes by HTTP status code.",
                )
                .namespace(namespace),
                &["code"],
            )?,
            in_flight: registry.register_gauge(
                Opts::new(
                    "scrape_requests_in_flight",
                    "Current number of scrapes being served.",
                )
                .namespace(namespace),
            )?,
            errors_total: registry.register_counter_vec(
                Opts::new(
                    "scrape_errors_total",
                    "Total number of internal errors encountered while serving scrapes.",
                )
                .namespace(namespace),
                &["cause"],
            )?,
        })
    }
}

/// Everything a scrape needs. Each request renders into its own buffer.
pub struct MetricsState {
    registry: Registry,
    options: HandlerOptions,
    scrape_metrics: Option<ScrapeMetrics>,
}

impl MetricsState {
    pub fn new(registry: Registry, options: HandlerOptions) -> Result<Self> {
        let scrape_metrics = match &options.instrument_namespace {
            Some(namespace) => Some(ScrapeMetrics::register(&registry, namespace)?),
            None => None,
        };
        Ok(Self {
            registry,
            options,
            scrape_metrics,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn render(&self, format: Format, names: &[String]) -> Result<String> {
        let mut snapshot = self.registry.snapshot()?;
        snapshot.retain_names(names);
        expfmt::render(
            &snapshot,
            RenderOptions::new(format).created_samples(self.options.created_samples),
        )
    }
}

pub fn metrics_router(state: Arc<MetricsState>) -> Router {
    Router::new()
        .route("/metrics", get(serve_metrics))
        .with_state(state)
}

/// `GET /metrics[?name[]=family...]`
pub async fn serve_metrics(
    State(state): State<Arc<MetricsState>>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> Response {
    if let Some(metrics) = &state.scrape_metrics {
        metrics.in_flight.inc();
    }

    let format = if state.options.enable_open_metrics {
        Format::negotiate(
            headers
                .get(header::ACCEPT)
                .and_then(|value| value.to_str().ok()),
        )
    } else {
        Format::Text
    };
    let names = requested_names(query.as_deref());

    let response = match state.render(format, &names) {
        Ok(body) => {
            debug!(bytes = body.len(), ?format, "metrics rendered");
            let mut response = Response::new(Body::from(body));
            *response.status_mut() = StatusCode::OK;
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static(format.content_type()),
            );
            response
        }
        Err(err) => {
            warn!(error = %err, cause = err.kind(), "failed to serve metrics");
            if let Some(metrics) = &state.scrape_metrics {
                count(&metrics.errors_total, err.kind());
            }
            MetricsApiError(err).into_response()
        }
    };

    if let Some(metrics) = &state.scrape_metrics {
        metrics.in_flight.dec();
        count(&metrics.requests_total, response.status().as_str());
    }
    response
}

fn count(vec: &CounterVec, label: &str) {
    match vec.with_label_values(&[label]) {
        Ok(counter) => counter.inc(),
        Err(err) => warn!(error = %err, "failed to count scrape"),
    }
}

fn requested_names(query: Option<&str>) -> Vec<String> {
    let Some(query) = query else {
        return Vec::new();
    };
    url::form_urlencoded::parse(query.as_bytes())
        .filter(|(key, _)| key == "name[]")
        .map(|(_, value)| value.into_owned())
        .collect()
}
