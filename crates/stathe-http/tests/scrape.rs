use std::{io::Write, sync::Arc, time::Duration};

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
    routing::get,
};
use http_body_util::BodyExt;
use stathe_collect::LoadCollector;
use stathe_http::{HandlerOptions, HttpMiddleware, MetricsState, metrics_router};
use stathe_metrics::{MetricValue, Registry};
use tower::ServiceExt;

fn scrape_app(registry: &Registry, options: HandlerOptions) -> Router {
    let state = Arc::new(MetricsState::new(registry.clone(), options).unwrap());
    HttpMiddleware::new(registry.clone(), None)
        .unwrap()
        .wrap("/metrics", metrics_router(state))
        .unwrap()
}

fn get_request(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn nine_scrapes_are_counted_once_each() {
    let registry = Registry::new();
    let app = scrape_app(&registry, HandlerOptions::default());

    for _ in 0..9 {
        let response = app.clone().oneshot(get_request("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/plain; version=0.0.4; charset=utf-8"
        );
    }

    let snapshot = registry.snapshot().unwrap();
    let requests = snapshot.family("stathe_http_requests_total").unwrap();
    assert_eq!(requests.samples.len(), 1);
    let sample = &requests.samples[0];
    assert_eq!(sample.label("handler"), Some("/metrics"));
    assert_eq!(sample.label("method"), Some("get"));
    assert_eq!(sample.label("code"), Some("200"));
    assert!(matches!(sample.value, MetricValue::Counter { value, .. } if value == 9.0));

    let durations = snapshot
        .family("stathe_http_request_duration_seconds")
        .unwrap();
    let MetricValue::Histogram(histogram) = &durations.samples[0].value else {
        panic!("duration family must hold a histogram");
    };
    assert_eq!(histogram.count, 9);
    assert_eq!(histogram.buckets.len(), 6);

    for family in [
        "stathe_http_request_size_bytes",
        "stathe_http_response_size_bytes",
    ] {
        let MetricValue::Summary(summary) = &snapshot.family(family).unwrap().samples[0].value
        else {
            panic!("{family} must hold a summary");
        };
        assert_eq!(summary.count, 9);
    }
}

#[tokio::test]
async fn scrape_output_contains_previous_requests() {
    let registry = Registry::new();
    let app = scrape_app(&registry, HandlerOptions::default());

    app.clone().oneshot(get_request("/metrics")).await.unwrap();
    let body = body_text(app.oneshot(get_request("/metrics")).await.unwrap()).await;

    assert!(body.contains("# TYPE stathe_http_requests_total counter\n"));
    assert!(body.contains(
        "stathe_http_requests_total{code=\"200\",handler=\"/metrics\",method=\"get\"} 1\n"
    ));
    assert!(body.contains(
        "stathe_http_request_duration_seconds_bucket{code=\"200\",handler=\"/metrics\",method=\"get\",le=\"0.15000000000000002\"} 1\n"
    ));
}

#[tokio::test(start_paused = true)]
async fn abandoned_requests_record_nothing() {
    let registry = Registry::new();
    let router = Router::new().route(
        "/slow",
        get(|| async {
            std::future::pending::<()>().await;
            "never"
        }),
    );
    let app = HttpMiddleware::new(registry.clone(), None)
        .unwrap()
        .wrap("/slow", router)
        .unwrap();

    let outcome = tokio::time::timeout(
        Duration::from_secs(1),
        app.oneshot(get_request("/slow")),
    )
    .await;
    assert!(outcome.is_err());

    let snapshot = registry.snapshot().unwrap();
    assert!(snapshot.family("stathe_http_requests_total").is_none());
    assert!(snapshot.family("stathe_http_request_duration_seconds").is_none());
}

#[tokio::test]
async fn handler_outcome_code_is_recorded() {
    let registry = Registry::new();
    let router = Router::new().route("/fail", get(|| async { StatusCode::SERVICE_UNAVAILABLE }));
    let app = HttpMiddleware::new(registry.clone(), None)
        .unwrap()
        .wrap("/fail", router)
        .unwrap();

    let response = app.oneshot(get_request("/fail")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let snapshot = registry.snapshot().unwrap();
    let requests = snapshot.family("stathe_http_requests_total").unwrap();
    assert_eq!(requests.samples[0].label("code"), Some("503"));
}

#[tokio::test]
async fn sampling_failure_is_a_complete_500() {
    let registry = Registry::new();
    let load = registry
        .register(Arc::new(
            LoadCollector::new("stathe", "/nonexistent/loadavg").unwrap(),
        ))
        .unwrap();
    let app = scrape_app(
        &registry,
        HandlerOptions {
            instrument_namespace: Some("stathe".to_string()),
            ..HandlerOptions::default()
        },
    );

    let response = app.clone().oneshot(get_request("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_text(response).await;
    assert!(body.starts_with("An error has occurred while serving metrics"));
    assert!(!body.contains("# TYPE"));

    assert!(registry.unregister_collector(&load));
    let body = body_text(app.oneshot(get_request("/metrics")).await.unwrap()).await;
    assert!(body.contains("stathe_scrape_errors_total{cause=\"sampling\"} 1\n"));
    assert!(body.contains("stathe_scrape_requests_total{code=\"500\"} 1\n"));
    assert!(body.contains("stathe_scrape_requests_in_flight 1\n"));
}

#[tokio::test]
async fn load_average_is_scraped_from_the_source_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"0.52 0.56 0.54 2/1370 226866\n").unwrap();

    let registry = Registry::new();
    registry
        .register(Arc::new(LoadCollector::new("stathe", file.path()).unwrap()))
        .unwrap();
    let app = scrape_app(&registry, HandlerOptions::default());

    let body = body_text(
        app.oneshot(get_request("/metrics?name[]=stathe_system_load_average"))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(
        body,
        "# HELP stathe_system_load_average System 1m/5m/15m load average\n\
         # TYPE stathe_system_load_average gauge\n\
         stathe_system_load_average{time_linux=\"15m\"} 0.54\n\
         stathe_system_load_average{time_linux=\"1m\"} 0.52\n\
         stathe_system_load_average{time_linux=\"5m\"} 0.56\n"
    );
}

#[tokio::test]
async fn openmetrics_is_served_when_negotiated_and_enabled() {
    let registry = Registry::new();
    let app = scrape_app(
        &registry,
        HandlerOptions {
            enable_open_metrics: true,
            ..HandlerOptions::default()
        },
    );
    app.clone().oneshot(get_request("/metrics")).await.unwrap();

    let request = Request::builder()
        .uri("/metrics")
        .header(
            header::ACCEPT,
            "application/openmetrics-text;version=1.0.0,text/plain;q=0.5",
        )
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/openmetrics-text; version=1.0.0; charset=utf-8"
    );
    let body = body_text(response).await;
    assert!(body.contains("# TYPE stathe_http_requests counter\n"));
    assert!(body.ends_with("# EOF\n"));

    // Disabled: the same Accept header still gets the text format.
    let text_app = scrape_app(&Registry::new(), HandlerOptions::default());
    let request = Request::builder()
        .uri("/metrics")
        .header(header::ACCEPT, "application/openmetrics-text;version=1.0.0")
        .body(Body::empty())
        .unwrap();
    let response = text_app.oneshot(request).await.unwrap();
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "text/plain; version=0.0.4; charset=utf-8"
    );
}
