use stathe_common::{error::Result, time};

use crate::{
    atomic::AtomicF64,
    types::{MetricDescriptor, MetricType, MetricValue, Opts},
    vec::{Metric, MetricVec},
};

pub type GaugeVec = MetricVec<Gauge>;

/// Value that can go up and down. Concurrent `set` calls are last-write-wins.
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicF64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, value: f64) {
        self.value.store(value);
    }

    pub fn inc(&self) {
        self.add(1.0);
    }

    pub fn dec(&self) {
        self.add(-1.0);
    }

    pub fn add(&self, delta: f64) {
        self.value.fetch_add(delta);
    }

    pub fn sub(&self, delta: f64) {
        self.add(-delta);
    }

    pub fn set_to_current_time(&self) {
        self.set(time::unix_seconds(&time::now()));
    }

    pub fn get(&self) -> f64 {
        self.value.load()
    }
}

impl Metric for Gauge {
    fn value(&self) -> MetricValue {
        MetricValue::Gauge(self.get())
    }
}

impl MetricVec<Gauge> {
    pub fn new(opts: Opts, variable_labels: &[&str]) -> Result<Self> {
        let descriptor = MetricDescriptor::new(&opts, MetricType::Gauge, variable_labels)?;
        Ok(Self::from_parts(descriptor, Box::new(Gauge::new)))
    }
}
