use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use stathe_common::error::{Result, StatheError};
use url::Url;

#[derive(Debug, Clone)]
pub struct PushRequest {
    pub method: Method,
    pub url: Url,
    pub content_type: &'static str,
    /// Empty for `DELETE`.
    pub body: String,
}

/// Delivers a rendered push. Any non-2xx answer is a `Transport` error.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn send(&self, request: PushRequest) -> Result<()>;
}

pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::with_client(reqwest::Client::new())
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| StatheError::Transport(format!("failed to build http client: {err}")))?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PushTransport for HttpTransport {
    async fn send(&self, request: PushRequest) -> Result<()> {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone());
        if request.method != Method::DELETE {
            builder = builder
                .header(reqwest::header::CONTENT_TYPE, request.content_type)
                .body(request.body);
        }

        let response = builder.send().await.map_err(|err| {
            StatheError::Transport(format!(
                "failed to {} metrics to {}: {err}",
                request.method, request.url
            ))
        })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(StatheError::Transport(format!(
                "unexpected status {status} from {} {}: {}",
                request.method,
                request.url,
                detail.trim()
            )));
        }
        Ok(())
    }
}
