use std::{net::SocketAddr, path::PathBuf, time::Duration};

use crate::error::{Result, StatheError};

pub const DEFAULT_NAMESPACE: &str = "stathe";
pub const DEFAULT_LOAD_PATH: &str = "/proc/loadavg";
pub const DEFAULT_PUSH_INTERVAL: Duration = Duration::from_secs(15);

/// HTTP method used for a push cycle.
///
/// `Put` replaces every family in the grouping, `Post` only replaces
/// families with the same name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PushMethod {
    Put,
    #[default]
    Post,
}

impl PushMethod {
    pub fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "put" | "push" => Ok(Self::Put),
            "post" | "add" => Ok(Self::Post),
            other => Err(StatheError::InvalidArgument(format!(
                "unknown push method: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PushConfig {
    pub gateway_url: String,
    pub job: String,
    pub instance: Option<String>,
    pub interval: Duration,
    pub method: PushMethod,
}

impl PushConfig {
    pub fn new(gateway_url: impl Into<String>, job: impl Into<String>) -> Self {
        Self {
            gateway_url: gateway_url.into(),
            job: job.into(),
            instance: None,
            interval: DEFAULT_PUSH_INTERVAL,
            method: PushMethod::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.gateway_url.starts_with("http://") || self.gateway_url.starts_with("https://")) {
            return Err(StatheError::InvalidArgument(format!(
                "push gateway url must be http(s): {}",
                self.gateway_url
            )));
        }
        if self.job.trim().is_empty() {
            return Err(StatheError::InvalidArgument(
                "push job name must not be empty".to_string(),
            ));
        }
        if self.interval.is_zero() {
            return Err(StatheError::InvalidArgument(
                "push interval must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Values handed to the core by the binary. There is no reload contract.
#[derive(Debug, Clone)]
pub struct ExporterConfig {
    pub listen_addr: SocketAddr,
    pub namespace: String,
    pub subsystem: String,
    pub load_path: PathBuf,
    /// `None` selects the middleware default buckets.
    pub duration_buckets: Option<Vec<f64>>,
    pub open_metrics: bool,
    /// Refresh the load gauges in the background as well as on scrape.
    pub load_sample_interval: Option<Duration>,
    pub push: Option<PushConfig>,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            namespace: DEFAULT_NAMESPACE.to_string(),
            subsystem: String::new(),
            load_path: PathBuf::from(DEFAULT_LOAD_PATH),
            duration_buckets: None,
            open_metrics: true,
            load_sample_interval: None,
            push: None,
        }
    }
}

impl ExporterConfig {
    pub fn validate(&self) -> Result<()> {
        if let Some(buckets) = &self.duration_buckets {
            validate_bucket_list(buckets)?;
        }
        if self.load_sample_interval.is_some_and(|interval| interval.is_zero()) {
            return Err(StatheError::InvalidArgument(
                "load sample interval must be positive".to_string(),
            ));
        }
        if let Some(push) = &self.push {
            push.validate()?;
        }
        Ok(())
    }
}

/// Parses a comma separated list of floats such as `0.1,0.5,1`.
pub fn parse_float_list(value: &str) -> Result<Vec<f64>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            item.parse::<f64>().map_err(|err| {
                StatheError::InvalidArgument(format!("invalid number {item:?}: {err}"))
            })
        })
        .collect()
}

fn validate_bucket_list(buckets: &[f64]) -> Result<()> {
    if buckets.is_empty() {
        return Err(StatheError::InvalidArgument(
            "bucket list must not be empty".to_string(),
        ));
    }
    if buckets.windows(2).any(|pair| pair[0] >= pair[1]) {
        return Err(StatheError::InvalidArgument(
            "bucket boundaries must be strictly increasing".to_string(),
        ));
    }
    Ok(())
}
