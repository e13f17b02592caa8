//! Cancellable periodic background work.
//!
//! A [`ScheduledTask`] runs its tick function once per period until its
//! cancellation token fires. Cancellation stops future ticks only: a tick
//! that is already running is allowed to finish.

use std::{future::Future, time::Duration};

use tokio::{
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Result, StatheError};

pub struct ScheduledTask {
    name: String,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    /// Spawns the loop on the current tokio runtime. The first tick fires one
    /// full period after spawning.
    pub fn spawn<F, Fut>(
        name: impl Into<String>,
        period: Duration,
        token: CancellationToken,
        mut tick: F,
    ) -> Result<Self>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if period.is_zero() {
            return Err(StatheError::InvalidArgument(
                "scheduled task period must be positive".to_string(),
            ));
        }

        let name = name.into();
        let task_name = name.clone();
        let loop_token = token.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = loop_token.cancelled() => break,
                    _ = interval.tick() => {}
                }
                tick().await;
            }
            debug!(task = %task_name, "scheduled task stopped");
        });

        Ok(Self {
            name,
            token,
            handle,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancels the loop and waits for an in-flight tick to complete.
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(err) = self.handle.await {
            warn!(task = %self.name, error = %err, "scheduled task ended abnormally");
        }
    }
}
