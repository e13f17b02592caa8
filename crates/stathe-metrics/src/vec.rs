//! Label vectors: one metric instance per distinct label-value tuple.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use stathe_common::error::{Result, StatheError};

use crate::{
    registry::Collector,
    types::{MetricDescriptor, MetricFamily, MetricSample, MetricValue},
};

type LabelValues = Vec<String>;

/// A concrete accumulator that can be read into a snapshot value.
pub trait Metric: Send + Sync + 'static {
    fn value(&self) -> MetricValue;

    fn created(&self) -> Option<DateTime<Utc>> {
        None
    }
}

pub struct MetricVec<M: Metric> {
    descriptor: MetricDescriptor,
    children: DashMap<LabelValues, Arc<M>>,
    factory: Box<dyn Fn() -> M + Send + Sync>,
}

impl<M: Metric> MetricVec<M> {
    pub(crate) fn from_parts(
        descriptor: MetricDescriptor,
        factory: Box<dyn Fn() -> M + Send + Sync>,
    ) -> Self {
        let vec = Self {
            descriptor,
            children: DashMap::new(),
            factory,
        };
        // Label-less families always expose their single instance.
        if vec.descriptor.variable_labels.is_empty() {
            vec.children
                .insert(Vec::new(), Arc::new((vec.factory)()));
        }
        vec
    }

    pub fn descriptor(&self) -> &MetricDescriptor {
        &self.descriptor
    }

    /// Returns the instance for the given values, creating it on first use.
    /// Values are positional and must match the declared label names.
    pub fn with_label_values(&self, values: &[&str]) -> Result<Arc<M>> {
        let key = self.label_key(values)?;
        if let Some(existing) = self.children.get(&key) {
            return Ok(Arc::clone(existing.value()));
        }

        let child = self
            .children
            .entry(key)
            .or_insert_with(|| Arc::new((self.factory)()));
        Ok(Arc::clone(child.value()))
    }

    /// Looks the instance up by label name instead of position.
    pub fn with(&self, labels: &[(&str, &str)]) -> Result<Arc<M>> {
        let values = self.values_from_pairs(labels)?;
        self.with_label_values(&values)
    }

    pub fn delete_label_values(&self, values: &[&str]) -> Result<bool> {
        let key = self.label_key(values)?;
        Ok(self.children.remove(&key).is_some())
    }

    pub fn delete(&self, labels: &[(&str, &str)]) -> Result<bool> {
        let values = self.values_from_pairs(labels)?;
        self.delete_label_values(&values)
    }

    /// Drops every instance. Label-less families get a fresh zero instance.
    pub fn reset(&self) {
        self.children.clear();
        if self.descriptor.variable_labels.is_empty() {
            self.children
                .insert(Vec::new(), Arc::new((self.factory)()));
        }
    }

    /// Number of live label-value tuples.
    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn collect_family(&self) -> MetricFamily {
        // Clone the handles first so shard locks are not held while reading values.
        let children = self
            .children
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect::<Vec<_>>();

        let mut samples = children
            .into_iter()
            .map(|(values, metric)| MetricSample {
                labels: self.materialize_labels(&values),
                value: metric.value(),
                created: metric.created(),
            })
            .collect::<Vec<_>>();
        samples.sort_by(|left, right| left.labels.cmp(&right.labels));

        MetricFamily {
            descriptor: self.descriptor.clone(),
            samples,
        }
    }

    fn label_key(&self, values: &[&str]) -> Result<LabelValues> {
        let expected = self.descriptor.variable_labels.len();
        if values.len() != expected {
            return Err(StatheError::LabelArity {
                name: self.descriptor.fq_name.clone(),
                expected,
                got: values.len(),
            });
        }
        Ok(values.iter().map(|value| (*value).to_string()).collect())
    }

    fn values_from_pairs<'a>(&self, labels: &[(&'a str, &'a str)]) -> Result<Vec<&'a str>> {
        let expected = self.descriptor.variable_labels.len();
        if labels.len() != expected {
            return Err(StatheError::LabelArity {
                name: self.descriptor.fq_name.clone(),
                expected,
                got: labels.len(),
            });
        }

        self.descriptor
            .variable_labels
            .iter()
            .map(|name| {
                labels
                    .iter()
                    .find(|(label, _)| label == name)
                    .map(|(_, value)| *value)
                    .ok_or_else(|| StatheError::InconsistentLabels {
                        name: self.descriptor.fq_name.clone(),
                        reason: format!("missing label {name:?}"),
                    })
            })
            .collect()
    }

    fn materialize_labels(&self, values: &[String]) -> Vec<(String, String)> {
        let mut labels = self
            .descriptor
            .variable_labels
            .iter()
            .zip(values.iter())
            .map(|(name, value)| (name.clone(), value.clone()))
            .chain(self.descriptor.const_labels.iter().cloned())
            .collect::<Vec<_>>();
        labels.sort_by(|left, right| left.0.cmp(&right.0));
        labels
    }
}

impl<M: Metric> Collector for MetricVec<M> {
    fn describe(&self) -> Vec<MetricDescriptor> {
        vec![self.descriptor.clone()]
    }

    fn collect(&self) -> Result<Vec<MetricFamily>> {
        Ok(vec![self.collect_family()])
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::{counter::CounterVec, gauge::GaugeVec, types::Opts};

    fn requests() -> CounterVec {
        CounterVec::new(
            Opts::new("http_requests_total", "Tracks the number of HTTP requests.")
                .namespace("stathe"),
            &["method", "code"],
        )
        .unwrap()
    }

    #[test]
    fn arity_mismatch_is_reported() {
        let vec = requests();
        let err = vec.with_label_values(&["get"]).unwrap_err();
        assert!(matches!(
            err,
            StatheError::LabelArity {
                expected: 2,
                got: 1,
                ..
            }
        ));
        let err = vec.with_label_values(&["get", "200", "extra"]).unwrap_err();
        assert!(matches!(err, StatheError::LabelArity { got: 3, .. }));
        assert!(vec.is_empty());
    }

    #[test]
    fn identical_tuples_share_one_instance() {
        let vec = requests();
        let first = vec.with_label_values(&["get", "200"]).unwrap();
        let second = vec.with(&[("code", "200"), ("method", "get")]).unwrap();

        first.inc();
        assert_eq!(second.get(), 1.0);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(vec.len(), 1);

        vec.with_label_values(&["post", "500"]).unwrap();
        assert_eq!(vec.len(), 2);
    }

    #[test]
    fn lookup_by_name_requires_declared_labels() {
        let vec = requests();
        let err = vec.with(&[("method", "get"), ("status", "200")]).unwrap_err();
        assert!(matches!(err, StatheError::InconsistentLabels { .. }));
    }

    #[test]
    fn concurrent_creation_yields_single_instance() {
        let vec = Arc::new(requests());
        let handles = (0..8)
            .map(|_| {
                let vec = Arc::clone(&vec);
                thread::spawn(move || {
                    for _ in 0..500 {
                        vec.with_label_values(&["get", "200"]).unwrap().inc();
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(vec.len(), 1);
        assert_eq!(vec.with_label_values(&["get", "200"]).unwrap().get(), 4000.0);
    }

    #[test]
    fn delete_and_reset() {
        let vec = requests();
        vec.with_label_values(&["get", "200"]).unwrap();
        vec.with_label_values(&["get", "404"]).unwrap();

        assert!(vec.delete_label_values(&["get", "404"]).unwrap());
        assert!(!vec.delete(&[("method", "get"), ("code", "404")]).unwrap());
        assert_eq!(vec.len(), 1);

        vec.reset();
        assert!(vec.is_empty());
    }

    #[test]
    fn label_less_family_has_one_instance_from_the_start() {
        let vec = GaugeVec::new(Opts::new("up", "Whether the exporter is up."), &[]).unwrap();
        assert_eq!(vec.len(), 1);
        vec.reset();
        assert_eq!(vec.len(), 1);

        let family = vec.collect_family();
        assert_eq!(family.samples.len(), 1);
        assert!(family.samples[0].labels.is_empty());
    }

    #[test]
    fn samples_merge_const_labels_sorted_by_name() {
        let vec = CounterVec::new(
            Opts::new("http_requests_total", "help").const_label("handler", "/metrics"),
            &["method", "code"],
        )
        .unwrap();
        vec.with_label_values(&["get", "200"]).unwrap().inc();

        let family = vec.collect_family();
        let names = family.samples[0]
            .labels
            .iter()
            .map(|(name, _)| name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["code", "handler", "method"]);
        assert_eq!(family.samples[0].label("handler"), Some("/metrics"));
    }
}
