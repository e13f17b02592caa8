use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use stathe_common::{
    error::{Result, StatheError},
    time,
};

use crate::{
    atomic::AtomicF64,
    exemplar::{Exemplar, ExemplarAdder},
    types::{MetricDescriptor, MetricType, MetricValue, Opts},
    vec::{Metric, MetricVec},
};

pub type CounterVec = MetricVec<Counter>;

/// Monotonically non-decreasing accumulator.
#[derive(Debug)]
pub struct Counter {
    name: Arc<str>,
    value: AtomicF64,
    exemplar: Mutex<Option<Exemplar>>,
    created: DateTime<Utc>,
}

impl Counter {
    pub(crate) fn new(name: Arc<str>) -> Self {
        Self {
            name,
            value: AtomicF64::new(0.0),
            exemplar: Mutex::new(None),
            created: time::now(),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1.0);
    }

    /// Adds a non-negative delta. Negative or NaN deltas leave the value untouched.
    pub fn add(&self, delta: f64) -> Result<()> {
        self.check_delta(delta)?;
        self.value.fetch_add(delta);
        Ok(())
    }

    pub fn get(&self) -> f64 {
        self.value.load()
    }

    fn check_delta(&self, delta: f64) -> Result<()> {
        if delta.is_nan() || delta < 0.0 {
            return Err(StatheError::NegativeCounterDelta {
                name: self.name.to_string(),
                delta,
            });
        }
        Ok(())
    }
}

impl ExemplarAdder for Counter {
    fn add_with_exemplar(&self, delta: f64, labels: &[(&str, &str)]) -> Result<()> {
        self.check_delta(delta)?;
        let exemplar = Exemplar::new(delta, labels)?;
        self.value.fetch_add(delta);
        let mut slot = self
            .exemplar
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(exemplar);
        Ok(())
    }
}

impl Metric for Counter {
    fn value(&self) -> MetricValue {
        let exemplar = self
            .exemplar
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        MetricValue::Counter {
            value: self.get(),
            exemplar,
        }
    }

    fn created(&self) -> Option<DateTime<Utc>> {
        Some(self.created)
    }
}

impl MetricVec<Counter> {
    pub fn new(opts: Opts, variable_labels: &[&str]) -> Result<Self> {
        let descriptor = MetricDescriptor::new(&opts, MetricType::Counter, variable_labels)?;
        let name: Arc<str> = Arc::from(descriptor.fq_name.as_str());
        Ok(Self::from_parts(
            descriptor,
            Box::new(move || Counter::new(Arc::clone(&name))),
        ))
    }
}
