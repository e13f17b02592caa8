use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{DateTime, Utc};
use stathe_common::{
    error::{Result, StatheError},
    time,
};
use tokio::time::Instant;

use crate::{
    exemplar::Observer,
    quantile::TargetedStream,
    types::{MetricDescriptor, MetricType, MetricValue, Opts, Quantile, SummaryValue},
    vec::{Metric, MetricVec},
};

pub type SummaryVec = MetricVec<Summary>;

pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_AGE_BUCKETS: usize = 5;
pub const DEFAULT_BUF_CAP: usize = 500;
/// Every age bucket holds its own stream and buffer.
pub const MAX_AGE_BUCKETS: usize = 1_000;
pub const MAX_BUF_CAP: usize = 100_000;

#[derive(Debug, Clone)]
pub struct SummaryOpts {
    pub opts: Opts,
    /// `(quantile, absolute error)` targets. Empty means sum and count only.
    pub objectives: Vec<(f64, f64)>,
    /// Observations older than this stop influencing the quantiles.
    pub max_age: Duration,
    pub age_buckets: usize,
    pub buf_cap: usize,
}

impl SummaryOpts {
    pub fn new(opts: Opts) -> Self {
        Self {
            opts,
            objectives: Vec::new(),
            max_age: DEFAULT_MAX_AGE,
            age_buckets: DEFAULT_AGE_BUCKETS,
            buf_cap: DEFAULT_BUF_CAP,
        }
    }

    pub fn objective(mut self, quantile: f64, error: f64) -> Self {
        self.objectives.push((quantile, error));
        self
    }

    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn age_buckets(mut self, age_buckets: usize) -> Self {
        self.age_buckets = age_buckets;
        self
    }

    /// Returns how long each age bucket stays current.
    fn validate(&self) -> Result<Duration> {
        for &(quantile, error) in &self.objectives {
            if !(0.0..=1.0).contains(&quantile) {
                return Err(StatheError::InvalidArgument(format!(
                    "summary objective quantile {quantile} is outside [0, 1]"
                )));
            }
            if !(0.0..1.0).contains(&error) {
                return Err(StatheError::InvalidArgument(format!(
                    "summary objective error {error} is outside [0, 1)"
                )));
            }
        }
        if self.max_age.is_zero() {
            return Err(StatheError::InvalidArgument(
                "summary max_age must be positive".to_string(),
            ));
        }
        if self.age_buckets == 0 || self.age_buckets > MAX_AGE_BUCKETS {
            return Err(StatheError::InvalidArgument(format!(
                "summary age_buckets {} is outside [1, {MAX_AGE_BUCKETS}]",
                self.age_buckets
            )));
        }
        if self.buf_cap == 0 || self.buf_cap > MAX_BUF_CAP {
            return Err(StatheError::InvalidArgument(format!(
                "summary buf_cap {} is outside [1, {MAX_BUF_CAP}]",
                self.buf_cap
            )));
        }
        // Both bounds above fit in a u32.
        let stream_duration = self.max_age / self.age_buckets as u32;
        if stream_duration.is_zero() {
            return Err(StatheError::InvalidArgument(format!(
                "summary max_age {:?} is too short for {} age buckets",
                self.max_age, self.age_buckets
            )));
        }
        Ok(stream_duration)
    }
}

impl From<Opts> for SummaryOpts {
    fn from(opts: Opts) -> Self {
        Self::new(opts)
    }
}

#[derive(Debug)]
struct SummaryConfig {
    /// Sorted by quantile.
    objectives: Arc<[(f64, f64)]>,
    stream_duration: Duration,
    age_buckets: usize,
    buf_cap: usize,
}

struct SummaryState {
    /// Every stream sees every observation; `head` is the oldest one.
    streams: Vec<TargetedStream>,
    head: usize,
    head_expires: Instant,
    count: u64,
    sum: f64,
}

/// Running sum and count plus targeted quantiles over a sliding window.
pub struct Summary {
    config: Arc<SummaryConfig>,
    state: Mutex<SummaryState>,
    created: DateTime<Utc>,
}

impl Summary {
    fn new(config: Arc<SummaryConfig>) -> Self {
        let streams = if config.objectives.is_empty() {
            Vec::new()
        } else {
            (0..config.age_buckets)
                .map(|_| TargetedStream::new(Arc::clone(&config.objectives), config.buf_cap))
                .collect()
        };
        let head_expires = Instant::now() + config.stream_duration;
        Self {
            config,
            state: Mutex::new(SummaryState {
                streams,
                head: 0,
                head_expires,
                count: 0,
                sum: 0.0,
            }),
            created: time::now(),
        }
    }

    pub fn observe_duration(&self, duration: Duration) {
        self.observe(duration.as_secs_f64());
    }

    pub fn sample_count(&self) -> u64 {
        self.lock().count
    }

    pub fn sample_sum(&self) -> f64 {
        self.lock().sum
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SummaryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Resets every stream whose window has passed and moves the head on.
    fn rotate(&self, state: &mut SummaryState, now: Instant) {
        if state.streams.is_empty() {
            return;
        }
        while now >= state.head_expires {
            let head = state.head;
            state.streams[head].reset();
            state.head = (head + 1) % state.streams.len();
            state.head_expires += self.config.stream_duration;
        }
    }
}

impl Observer for Summary {
    fn observe(&self, value: f64) {
        let mut state = self.lock();
        self.rotate(&mut state, Instant::now());
        state.count += 1;
        state.sum += value;
        if value.is_nan() {
            return;
        }
        for stream in &mut state.streams {
            stream.insert(value);
        }
    }
}

impl Metric for Summary {
    fn value(&self) -> MetricValue {
        let mut state = self.lock();
        self.rotate(&mut state, Instant::now());

        let head = state.head;
        let mut running_max = f64::NEG_INFINITY;
        let mut quantiles = Vec::with_capacity(self.config.objectives.len());
        for &(quantile, _) in self.config.objectives.iter() {
            let estimate = state
                .streams
                .get_mut(head)
                .and_then(|stream| stream.query(quantile));
            let value = match estimate {
                Some(estimate) => {
                    running_max = running_max.max(estimate);
                    running_max
                }
                None => f64::NAN,
            };
            quantiles.push(Quantile { quantile, value });
        }

        MetricValue::Summary(SummaryValue {
            quantiles,
            count: state.count,
            sum: state.sum,
        })
    }

    fn created(&self) -> Option<DateTime<Utc>> {
        Some(self.created)
    }
}

impl MetricVec<Summary> {
    pub fn new(opts: SummaryOpts, variable_labels: &[&str]) -> Result<Self> {
        let stream_duration = opts.validate()?;
        let descriptor = MetricDescriptor::new(&opts.opts, MetricType::Summary, variable_labels)?;

        let mut objectives = opts.objectives.clone();
        objectives.sort_by(|left, right| left.0.total_cmp(&right.0));
        objectives.dedup_by(|left, right| left.0 == right.0);

        let config = Arc::new(SummaryConfig {
            objectives: Arc::from(objectives),
            stream_duration,
            age_buckets: opts.age_buckets,
            buf_cap: opts.buf_cap,
        });

        Ok(Self::from_parts(
            descriptor,
            Box::new(move || Summary::new(Arc::clone(&config))),
        ))
    }
}
