use std::{
    collections::BTreeMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use stathe_common::{
    error::{Result, StatheError},
    time,
};

use crate::{
    atomic::AtomicF64,
    buckets::normalize_bounds,
    exemplar::{Exemplar, ExemplarObserver, Observer},
    types::{
        Bucket, HistogramValue, MetricDescriptor, MetricType, MetricValue, NativeBuckets, Opts,
    },
    vec::{Metric, MetricVec},
};

pub type HistogramVec = MetricVec<Histogram>;

/// 2^-128, the width of the native zero bucket unless configured otherwise.
pub const DEFAULT_NATIVE_ZERO_THRESHOLD: f64 = 2.938735877055719e-39;

#[derive(Debug, Clone)]
pub struct HistogramOpts {
    pub opts: Opts,
    /// Classic bucket upper bounds; empty selects [`crate::DEFAULT_BUCKETS`].
    pub buckets: Vec<f64>,
    /// Growth factor between consecutive sparse buckets. `None` disables them.
    pub native_bucket_factor: Option<f64>,
    pub native_zero_threshold: f64,
}

impl HistogramOpts {
    pub fn new(opts: Opts) -> Self {
        Self {
            opts,
            buckets: Vec::new(),
            native_bucket_factor: None,
            native_zero_threshold: DEFAULT_NATIVE_ZERO_THRESHOLD,
        }
    }

    pub fn buckets(mut self, buckets: Vec<f64>) -> Self {
        self.buckets = buckets;
        self
    }

    pub fn native_bucket_factor(mut self, factor: f64) -> Self {
        self.native_bucket_factor = Some(factor);
        self
    }
}

impl From<Opts> for HistogramOpts {
    fn from(opts: Opts) -> Self {
        Self::new(opts)
    }
}

#[derive(Debug, Clone, Copy)]
struct NativeConfig {
    schema: i32,
    zero_threshold: f64,
}

#[derive(Debug, Default)]
struct NativeState {
    zero_count: u64,
    positive: BTreeMap<i32, u64>,
    negative: BTreeMap<i32, u64>,
}

pub struct Histogram {
    upper_bounds: Arc<[f64]>,
    /// Non-cumulative counts; the last slot is the implicit `+Inf` bucket.
    counts: Box<[AtomicU64]>,
    exemplars: Box<[Mutex<Option<Exemplar>>]>,
    sum: AtomicF64,
    native_config: Option<NativeConfig>,
    native: Mutex<NativeState>,
    created: DateTime<Utc>,
}

impl Histogram {
    fn new(upper_bounds: Arc<[f64]>, native_config: Option<NativeConfig>) -> Self {
        let slots = upper_bounds.len() + 1;
        Self {
            upper_bounds,
            counts: (0..slots).map(|_| AtomicU64::new(0)).collect(),
            exemplars: (0..slots).map(|_| Mutex::new(None)).collect(),
            sum: AtomicF64::new(0.0),
            native_config,
            native: Mutex::new(NativeState::default()),
            created: time::now(),
        }
    }

    pub fn observe_duration(&self, duration: Duration) {
        self.observe(duration.as_secs_f64());
    }

    pub fn sample_count(&self) -> u64 {
        self.counts
            .iter()
            .map(|count| count.load(Ordering::Relaxed))
            .sum()
    }

    pub fn sample_sum(&self) -> f64 {
        self.sum.load()
    }

    /// Index of the first bound `>= value`; NaN lands in `+Inf`.
    fn bucket_index(&self, value: f64) -> usize {
        if value.is_nan() {
            return self.upper_bounds.len();
        }
        self.upper_bounds.partition_point(|bound| *bound < value)
    }

    fn record(&self, value: f64) -> usize {
        let index = self.bucket_index(value);
        self.counts[index].fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(value);
        if let Some(config) = self.native_config {
            self.record_native(config, value);
        }
        index
    }

    fn record_native(&self, config: NativeConfig, value: f64) {
        if value.is_nan() {
            return;
        }
        let mut native = self
            .native
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if value.abs() <= config.zero_threshold {
            native.zero_count += 1;
            return;
        }
        let index = native_index(value.abs(), config.schema);
        let buckets = if value > 0.0 {
            &mut native.positive
        } else {
            &mut native.negative
        };
        *buckets.entry(index).or_insert(0) += 1;
    }

    fn native_snapshot(&self) -> Option<NativeBuckets> {
        let config = self.native_config?;
        let native = self
            .native
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Some(NativeBuckets {
            schema: config.schema,
            zero_threshold: config.zero_threshold,
            zero_count: native.zero_count,
            positive: native.positive.iter().map(|(k, v)| (*k, *v)).collect(),
            negative: native.negative.iter().map(|(k, v)| (*k, *v)).collect(),
        })
    }
}

impl Observer for Histogram {
    fn observe(&self, value: f64) {
        self.record(value);
    }

    fn as_exemplar_observer(&self) -> Option<&dyn ExemplarObserver> {
        Some(self)
    }
}

impl ExemplarObserver for Histogram {
    fn observe_with_exemplar(&self, value: f64, labels: &[(&str, &str)]) -> Result<()> {
        let exemplar = Exemplar::new(value, labels)?;
        let index = self.record(value);
        let mut slot = self.exemplars[index]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(exemplar);
        Ok(())
    }
}

impl Metric for Histogram {
    fn value(&self) -> MetricValue {
        let mut cumulative = 0_u64;
        let mut buckets = Vec::with_capacity(self.counts.len());
        for (index, count) in self.counts.iter().enumerate() {
            cumulative = cumulative.saturating_add(count.load(Ordering::Relaxed));
            let exemplar = self.exemplars[index]
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone();
            buckets.push(Bucket {
                upper_bound: self
                    .upper_bounds
                    .get(index)
                    .copied()
                    .unwrap_or(f64::INFINITY),
                cumulative_count: cumulative,
                exemplar,
            });
        }

        MetricValue::Histogram(HistogramValue {
            buckets,
            count: cumulative,
            sum: self.sum.load(),
            native: self.native_snapshot(),
        })
    }

    fn created(&self) -> Option<DateTime<Utc>> {
        Some(self.created)
    }
}

impl MetricVec<Histogram> {
    pub fn new(opts: HistogramOpts, variable_labels: &[&str]) -> Result<Self> {
        let descriptor =
            MetricDescriptor::new(&opts.opts, MetricType::Histogram, variable_labels)?;
        let upper_bounds: Arc<[f64]> = Arc::from(normalize_bounds(&opts.buckets)?);
        let native_config = match opts.native_bucket_factor {
            Some(factor) => Some(NativeConfig {
                schema: pick_schema(factor)?,
                zero_threshold: opts.native_zero_threshold.abs(),
            }),
            None => None,
        };

        Ok(Self::from_parts(
            descriptor,
            Box::new(move || Histogram::new(Arc::clone(&upper_bounds), native_config)),
        ))
    }
}

/// Largest schema whose growth factor does not exceed `factor`, within `[-4, 8]`.
fn pick_schema(factor: f64) -> Result<i32> {
    if factor.is_nan() || factor <= 1.0 {
        return Err(StatheError::InvalidArgument(format!(
            "native bucket factor must be greater than 1, got {factor}"
        )));
    }
    let floor = factor.log2().log2().floor();
    Ok(if floor <= -8.0 {
        8
    } else if floor >= 4.0 {
        -4
    } else {
        -(floor as i32)
    })
}

fn native_index(abs_value: f64, schema: i32) -> i32 {
    let index = (abs_value.log2() * 2f64.powi(schema)).ceil();
    index.clamp(i32::MIN as f64, i32::MAX as f64) as i32
}
