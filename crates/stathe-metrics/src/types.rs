use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use stathe_common::error::{Result, StatheError};

use crate::exemplar::Exemplar;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
    Summary,
}

impl MetricType {
    pub fn as_prometheus_type(&self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Histogram => "histogram",
            Self::Summary => "summary",
        }
    }

    pub fn from_prometheus_type(value: &str) -> Option<Self> {
        match value {
            "counter" => Some(Self::Counter),
            "gauge" => Some(Self::Gauge),
            "histogram" => Some(Self::Histogram),
            "summary" => Some(Self::Summary),
            _ => None,
        }
    }

    /// Label name this type reserves for its own sample lines.
    fn reserved_label(&self) -> Option<&'static str> {
        match self {
            Self::Histogram => Some("le"),
            Self::Summary => Some("quantile"),
            Self::Counter | Self::Gauge => None,
        }
    }
}

/// Naming and help text shared by every metric kind.
#[derive(Debug, Clone, Default)]
pub struct Opts {
    pub namespace: String,
    pub subsystem: String,
    pub name: String,
    pub help: String,
    pub const_labels: Vec<(String, String)>,
}

impl Opts {
    pub fn new(name: impl Into<String>, help: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
            ..Self::default()
        }
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn subsystem(mut self, subsystem: impl Into<String>) -> Self {
        self.subsystem = subsystem.into();
        self
    }

    pub fn const_label(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.const_labels.push((name.into(), value.into()));
        self
    }

    pub fn fq_name(&self) -> String {
        build_fq_name(&self.namespace, &self.subsystem, &self.name)
    }
}

/// Joins the non-empty parts with `_`. An empty name yields an empty string.
pub fn build_fq_name(namespace: &str, subsystem: &str, name: &str) -> String {
    if name.is_empty() {
        return String::new();
    }
    [namespace, subsystem, name]
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("_")
}

/// Identity and shape of a metric family. Const labels are kept sorted by name.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricDescriptor {
    pub fq_name: String,
    pub help: String,
    pub metric_type: MetricType,
    pub variable_labels: Vec<String>,
    pub const_labels: Vec<(String, String)>,
}

impl MetricDescriptor {
    pub fn new(opts: &Opts, metric_type: MetricType, variable_labels: &[&str]) -> Result<Self> {
        let mut const_labels = opts.const_labels.clone();
        const_labels.sort_by(|left, right| left.0.cmp(&right.0));

        let descriptor = Self {
            fq_name: opts.fq_name(),
            help: opts.help.clone(),
            metric_type,
            variable_labels: variable_labels.iter().map(|label| (*label).to_string()).collect(),
            const_labels,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }

    pub fn validate(&self) -> Result<()> {
        if !is_valid_metric_name(&self.fq_name) {
            return Err(StatheError::InvalidDescriptor(format!(
                "{:?} is not a valid metric name",
                self.fq_name
            )));
        }

        let mut seen = BTreeSet::new();
        let names = self
            .variable_labels
            .iter()
            .map(String::as_str)
            .chain(self.const_labels.iter().map(|(name, _)| name.as_str()));
        for name in names {
            if !is_valid_label_name(name) {
                return Err(StatheError::InvalidDescriptor(format!(
                    "{}: {name:?} is not a valid label name",
                    self.fq_name
                )));
            }
            if self.metric_type.reserved_label() == Some(name) {
                return Err(StatheError::InvalidDescriptor(format!(
                    "{}: label {name:?} is reserved for {} metrics",
                    self.fq_name,
                    self.metric_type.as_prometheus_type()
                )));
            }
            if !seen.insert(name) {
                return Err(StatheError::InvalidDescriptor(format!(
                    "{}: duplicate label name {name:?}",
                    self.fq_name
                )));
            }
        }
        Ok(())
    }

    pub fn label_names(&self) -> BTreeSet<&str> {
        self.variable_labels
            .iter()
            .map(String::as_str)
            .chain(self.const_labels.iter().map(|(name, _)| name.as_str()))
            .collect()
    }

    /// Same kind, help text and label-name set. Const label values may differ.
    pub fn is_compatible(&self, other: &MetricDescriptor) -> bool {
        self.fq_name == other.fq_name
            && self.metric_type == other.metric_type
            && self.help == other.help
            && self.label_names() == other.label_names()
    }

    /// Explains why `other` cannot share this descriptor's name.
    pub(crate) fn incompatibility(&self, other: &MetricDescriptor) -> Option<String> {
        if self.metric_type != other.metric_type {
            return Some(format!(
                "registered as {}, now {}",
                self.metric_type.as_prometheus_type(),
                other.metric_type.as_prometheus_type()
            ));
        }
        if self.help != other.help {
            return Some("help text differs".to_string());
        }
        if self.label_names() != other.label_names() {
            return Some("label names differ".to_string());
        }
        None
    }
}

pub fn is_valid_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (first.is_ascii_alphabetic() || first == '_' || first == ':')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

pub fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    !name.starts_with("__")
        && (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[derive(Debug, Clone, PartialEq)]
pub struct Bucket {
    pub upper_bound: f64,
    pub cumulative_count: u64,
    pub exemplar: Option<Exemplar>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Quantile {
    pub quantile: f64,
    pub value: f64,
}

/// Sparse exponential buckets. Bucket `i` covers `(base^(i-1), base^i]`
/// with `base = 2^(2^-schema)`.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeBuckets {
    pub schema: i32,
    pub zero_threshold: f64,
    pub zero_count: u64,
    pub positive: Vec<(i32, u64)>,
    pub negative: Vec<(i32, u64)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistogramValue {
    /// Cumulative buckets in ascending order, ending with `+Inf`.
    pub buckets: Vec<Bucket>,
    pub count: u64,
    pub sum: f64,
    pub native: Option<NativeBuckets>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SummaryValue {
    pub quantiles: Vec<Quantile>,
    pub count: u64,
    pub sum: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    Counter {
        value: f64,
        exemplar: Option<Exemplar>,
    },
    Gauge(f64),
    Histogram(HistogramValue),
    Summary(SummaryValue),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    /// Const and variable labels, sorted by name.
    pub labels: Vec<(String, String)>,
    pub value: MetricValue,
    pub created: Option<DateTime<Utc>>,
}

impl MetricSample {
    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|(label, _)| label == name)
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricFamily {
    pub descriptor: MetricDescriptor,
    pub samples: Vec<MetricSample>,
}

impl MetricFamily {
    pub fn name(&self) -> &str {
        &self.descriptor.fq_name
    }
}

/// Point-in-time copy of every registered family, sorted by name.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub families: Vec<MetricFamily>,
    pub taken_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn family(&self, name: &str) -> Option<&MetricFamily> {
        self.families.iter().find(|family| family.name() == name)
    }

    /// Keeps only the named families. An empty filter keeps everything.
    pub fn retain_names(&mut self, names: &[String]) {
        if names.is_empty() {
            return;
        }
        self.families
            .retain(|family| names.iter().any(|name| name == family.name()));
    }
}
