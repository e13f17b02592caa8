use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use clap::Parser;
use stathe_common::{
    config::{
        DEFAULT_LOAD_PATH, DEFAULT_NAMESPACE, ExporterConfig, PushConfig, PushMethod,
        parse_float_list,
    },
    error::{Result, StatheError},
};
use stathe_metrics::{exponential_buckets, linear_buckets};

pub const PUSH_URL_ENV: &str = "STATHE_PUSHGATEWAY_URL";
pub const PUSH_JOB_ENV: &str = "STATHE_PUSH_JOB";

#[derive(Debug, Parser)]
#[command(name = "stathe", about = "Load-average and HTTP metrics exporter")]
pub struct Cli {
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    #[arg(long, default_value = "8080")]
    port: u16,

    #[arg(long, default_value = DEFAULT_NAMESPACE)]
    namespace: String,

    #[arg(long, default_value = "")]
    subsystem: String,

    #[arg(long, default_value = DEFAULT_LOAD_PATH)]
    load_path: PathBuf,

    /// Also refresh the load gauges every N seconds between scrapes.
    #[arg(long)]
    load_sample_interval: Option<u64>,

    /// Request-duration buckets, e.g. `0.1,0.5,1`.
    #[arg(long, conflicts_with_all = ["exponential_buckets", "linear_buckets"])]
    buckets: Option<String>,

    /// `start,factor,count`
    #[arg(long, conflicts_with = "linear_buckets")]
    exponential_buckets: Option<String>,

    /// `start,width,count`
    #[arg(long)]
    linear_buckets: Option<String>,

    #[arg(long, default_value_t = false)]
    disable_open_metrics: bool,

    /// Push-gateway base URL; falls back to `STATHE_PUSHGATEWAY_URL`.
    #[arg(long)]
    push_url: Option<String>,

    /// Falls back to `STATHE_PUSH_JOB`, then to the namespace.
    #[arg(long)]
    push_job: Option<String>,

    #[arg(long)]
    push_instance: Option<String>,

    #[arg(long, default_value = "15")]
    push_interval: u64,

    /// `post` (replace same-named families) or `put` (replace the group).
    #[arg(long, default_value = "post")]
    push_method: String,
}

impl Cli {
    /// `env` looks up fallback values for unset push flags.
    pub fn into_config(self, env: impl Fn(&str) -> Option<String>) -> Result<ExporterConfig> {
        let host = self.host.parse::<IpAddr>().map_err(|err| {
            StatheError::InvalidArgument(format!("invalid listen host {}: {err}", self.host))
        })?;
        let listen_addr = SocketAddr::new(host, self.port);

        let duration_buckets = match (
            &self.buckets,
            &self.exponential_buckets,
            &self.linear_buckets,
        ) {
            (Some(list), _, _) => Some(parse_float_list(list)?),
            (_, Some(args), _) => {
                let (start, factor, count) = generator_args(args, "--exponential-buckets")?;
                Some(exponential_buckets(start, factor, count)?)
            }
            (_, _, Some(args)) => {
                let (start, width, count) = generator_args(args, "--linear-buckets")?;
                Some(linear_buckets(start, width, count)?)
            }
            _ => None,
        };

        let push = match self
            .push_url
            .or_else(|| env(PUSH_URL_ENV))
            .filter(|url| !url.trim().is_empty())
        {
            Some(url) => {
                let job = self
                    .push_job
                    .or_else(|| env(PUSH_JOB_ENV))
                    .unwrap_or_else(|| self.namespace.clone());
                let mut push = PushConfig::new(url.trim(), job);
                push.instance = self.push_instance;
                push.interval = Duration::from_secs(self.push_interval);
                push.method = PushMethod::parse(&self.push_method)?;
                Some(push)
            }
            None => None,
        };

        let config = ExporterConfig {
            listen_addr,
            namespace: self.namespace,
            subsystem: self.subsystem,
            load_path: self.load_path,
            duration_buckets,
            open_metrics: !self.disable_open_metrics,
            load_sample_interval: self.load_sample_interval.map(Duration::from_secs),
            push,
        };
        config.validate()?;
        Ok(config)
    }
}

fn generator_args(args: &str, flag: &str) -> Result<(f64, f64, usize)> {
    let values = parse_float_list(args)?;
    let &[first, second, count] = values.as_slice() else {
        return Err(StatheError::InvalidArgument(format!(
            "{flag} expects three comma separated values, got {args:?}"
        )));
    };
    if count < 1.0 || count.fract() != 0.0 {
        return Err(StatheError::InvalidArgument(format!(
            "{flag} bucket count must be a positive integer, got {count}"
        )));
    }
    Ok((first, second, count as usize))
}
