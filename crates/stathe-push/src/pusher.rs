use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use reqwest::Method;
use stathe_common::{
    config::{PushConfig, PushMethod},
    error::{Result, StatheError},
    task::ScheduledTask,
};
use stathe_metrics::{
    Registry,
    expfmt::{self, TEXT_CONTENT_TYPE},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    grouping::{Grouping, INSTANCE_LABEL},
    transport::{HttpTransport, PushRequest, PushTransport},
};

/// Upper bound on a single request made by a configured pusher.
pub const MAX_PUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Request timeout for a pusher that runs every `interval`: short enough
/// that a stuck gateway gives up before the next tick.
pub fn push_timeout(interval: Duration) -> Duration {
    (interval * 4 / 5)
        .min(MAX_PUSH_TIMEOUT)
        .max(Duration::from_millis(1))
}

/// Where a push cycle currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushState {
    Idle,
    Collecting,
    Rendering,
    Sending,
}

pub struct Pusher {
    registry: Registry,
    gateway: Url,
    grouping: Grouping,
    method: PushMethod,
    transport: Arc<dyn PushTransport>,
    state: Mutex<PushState>,
    in_flight: tokio::sync::Mutex<()>,
}

impl Pusher {
    pub fn new(registry: Registry, gateway_url: &str, job: impl Into<String>) -> Result<Self> {
        let gateway = Url::parse(gateway_url).map_err(|err| {
            StatheError::InvalidArgument(format!("invalid push gateway url {gateway_url}: {err}"))
        })?;
        Ok(Self {
            registry,
            gateway,
            grouping: Grouping::new(job)?,
            method: PushMethod::default(),
            transport: Arc::new(HttpTransport::new()),
            state: Mutex::new(PushState::Idle),
            in_flight: tokio::sync::Mutex::new(()),
        })
    }

    pub fn from_config(registry: Registry, config: &PushConfig) -> Result<Self> {
        config.validate()?;
        let transport = HttpTransport::with_timeout(push_timeout(config.interval))?;
        let mut pusher = Self::new(registry, &config.gateway_url, config.job.clone())?
            .method(config.method)
            .transport(Arc::new(transport));
        if let Some(instance) = &config.instance {
            pusher = pusher.grouping(INSTANCE_LABEL, instance.clone())?;
        }
        Ok(pusher)
    }

    pub fn grouping(mut self, name: &str, value: impl Into<String>) -> Result<Self> {
        self.grouping = self.grouping.label(name, value)?;
        Ok(self)
    }

    /// Method used by [`Pusher::trigger`] and the push loop.
    pub fn method(mut self, method: PushMethod) -> Self {
        self.method = method;
        self
    }

    pub fn transport(mut self, transport: Arc<dyn PushTransport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn url(&self) -> Result<Url> {
        self.grouping.url(&self.gateway)
    }

    pub fn state(&self) -> PushState {
        *self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Replaces every family in the grouping (`PUT`).
    pub async fn push(&self) -> Result<()> {
        self.send_snapshot(Method::PUT).await
    }

    /// Replaces only families with the same names (`POST`).
    pub async fn add(&self) -> Result<()> {
        self.send_snapshot(Method::POST).await
    }

    /// Removes the whole grouping from the gateway.
    pub async fn delete(&self) -> Result<()> {
        let _in_flight = self.in_flight.lock().await;
        let _cycle = CycleGuard::new(&self.state);
        let url = self.url()?;

        self.set_state(PushState::Sending);
        self.transport
            .send(PushRequest {
                method: Method::DELETE,
                url,
                content_type: TEXT_CONTENT_TYPE,
                body: String::new(),
            })
            .await
    }

    /// Runs one cycle with the configured method.
    pub async fn trigger(&self) -> Result<()> {
        match self.method {
            PushMethod::Put => self.push().await,
            PushMethod::Post => self.add().await,
        }
    }

    /// Pushes every `period` until `token` is cancelled. Failed cycles are
    /// logged and the next tick tries again.
    pub fn spawn_loop(
        self: &Arc<Self>,
        period: Duration,
        token: CancellationToken,
    ) -> Result<ScheduledTask> {
        let pusher = Arc::clone(self);
        info!(job = %self.grouping.job(), ?period, "push loop started");
        ScheduledTask::spawn("push-loop", period, token, move || {
            let pusher = Arc::clone(&pusher);
            async move {
                match pusher.trigger().await {
                    Ok(()) => debug!(job = %pusher.grouping.job(), "metrics pushed"),
                    Err(err) => warn!(
                        job = %pusher.grouping.job(),
                        cause = err.kind(),
                        error = %err,
                        "push cycle failed"
                    ),
                }
            }
        })
    }

    async fn send_snapshot(&self, method: Method) -> Result<()> {
        let _in_flight = self.in_flight.lock().await;
        let _cycle = CycleGuard::new(&self.state);
        let url = self.url()?;

        self.set_state(PushState::Collecting);
        let snapshot = self.registry.snapshot()?;
        self.grouping.check_conflicts(&snapshot)?;

        self.set_state(PushState::Rendering);
        let body = expfmt::render_text(&snapshot)?;

        self.set_state(PushState::Sending);
        self.transport
            .send(PushRequest {
                method,
                url,
                content_type: TEXT_CONTENT_TYPE,
                body,
            })
            .await
    }

    fn set_state(&self, state: PushState) {
        *self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = state;
    }
}

/// Returns the pusher to `Idle` however the cycle ends, including when the
/// cycle's future is dropped.
struct CycleGuard<'a> {
    state: &'a Mutex<PushState>,
}

impl<'a> CycleGuard<'a> {
    fn new(state: &'a Mutex<PushState>) -> Self {
        Self { state }
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        *self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = PushState::Idle;
    }
}
