mod cli;

use std::sync::Arc;

use clap::Parser;
use stathe_collect::LoadCollector;
use stathe_http::{HandlerOptions, HttpMiddleware, MetricsState, metrics_router};
use stathe_metrics::Registry;
use stathe_push::Pusher;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::cli::Cli;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::from_default_env().add_directive("stathe=info".parse()?);
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let config = Cli::parse().into_config(|name| std::env::var(name).ok())?;
    let registry = Registry::new();
    let shutdown = CancellationToken::new();

    let load = registry.register(Arc::new(LoadCollector::new(
        &config.namespace,
        config.load_path.clone(),
    )?))?;
    let sampler = match config.load_sample_interval {
        Some(period) => {
            info!(?period, path = %load.path().display(), "background load sampling enabled");
            Some(load.spawn_sampler(period, shutdown.child_token())?)
        }
        None => None,
    };

    let state = Arc::new(MetricsState::new(
        registry.clone(),
        HandlerOptions {
            enable_open_metrics: config.open_metrics,
            created_samples: false,
            instrument_namespace: Some(config.namespace.clone()),
        },
    )?);
    let app = HttpMiddleware::new(registry.clone(), config.duration_buckets.clone())?
        .namespace(config.namespace.clone())
        .subsystem(config.subsystem.clone())
        .wrap("/metrics", metrics_router(state))?
        .layer(TraceLayer::new_for_http());

    let pusher = match &config.push {
        Some(push) => {
            let pusher = Arc::new(Pusher::from_config(registry.clone(), push)?);
            info!(url = %pusher.url()?, "push gateway enabled");
            let task = pusher.spawn_loop(push.interval, shutdown.child_token())?;
            Some((pusher, task))
        }
        None => None,
    };

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    info!("stathe exporter listening on {}", config.listen_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    if let Some(sampler) = sampler {
        sampler.shutdown().await;
    }
    if let Some((pusher, task)) = pusher {
        task.shutdown().await;
        // One last push so the gateway holds the final values.
        if let Err(err) = pusher.trigger().await {
            warn!(error = %err, "final push failed");
        }
    }
    info!("stathe exporter stopped");

    Ok(())
}

async fn shutdown_signal(token: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                warn!(error = %err, "failed to listen for ctrl-c");
                token.cancelled().await;
            }
        }
        _ = token.cancelled() => {}
    }
    info!("shutdown requested");
}
