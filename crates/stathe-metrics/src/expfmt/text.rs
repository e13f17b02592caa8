use std::collections::BTreeSet;

use stathe_common::{
    error::{Result, StatheError},
    time,
};

use super::{Format, RenderOptions};
use crate::{
    exemplar::Exemplar,
    types::{
        MetricFamily, MetricSample, MetricType, MetricValue, is_valid_label_name,
        is_valid_metric_name,
    },
};

/// Rejects families whose values break the invariants the formats rely on.
pub(super) fn validate_family(family: &MetricFamily) -> Result<()> {
    let name = family.name();
    if !is_valid_metric_name(name) {
        return Err(StatheError::Render(format!("invalid metric name {name:?}")));
    }
    let declared = family.descriptor.label_names();

    for sample in &family.samples {
        let names = sample
            .labels
            .iter()
            .map(|(label, _)| label.as_str())
            .collect::<BTreeSet<_>>();
        if names.len() != sample.labels.len() || names != declared {
            return Err(StatheError::Render(format!(
                "{name}: sample labels {:?} do not match the declared label names",
                sample.labels
            )));
        }
        if let Some(label) = names.iter().find(|label| !is_valid_label_name(label)) {
            return Err(StatheError::Render(format!(
                "{name}: invalid label name {label:?}"
            )));
        }

        match (&sample.value, family.descriptor.metric_type) {
            (MetricValue::Counter { .. }, MetricType::Counter)
            | (MetricValue::Gauge(_), MetricType::Gauge) => {}
            (MetricValue::Histogram(histogram), MetricType::Histogram) => {
                let Some(last) = histogram.buckets.last() else {
                    return Err(StatheError::Render(format!("{name}: histogram without buckets")));
                };
                if last.upper_bound != f64::INFINITY || last.cumulative_count != histogram.count {
                    return Err(StatheError::Render(format!(
                        "{name}: +Inf bucket must hold the total count"
                    )));
                }
                let ordered = histogram.buckets.windows(2).all(|pair| {
                    pair[0].upper_bound < pair[1].upper_bound
                        && pair[0].cumulative_count <= pair[1].cumulative_count
                });
                if !ordered {
                    return Err(StatheError::Render(format!(
                        "{name}: histogram buckets are not cumulative in bound order"
                    )));
                }
            }
            (MetricValue::Summary(summary), MetricType::Summary) => {
                if summary
                    .quantiles
                    .iter()
                    .any(|quantile| !(0.0..=1.0).contains(&quantile.quantile))
                {
                    return Err(StatheError::Render(format!(
                        "{name}: quantile outside [0, 1]"
                    )));
                }
            }
            (_, metric_type) => {
                return Err(StatheError::Render(format!(
                    "{name}: sample value does not match family type {}",
                    metric_type.as_prometheus_type()
                )));
            }
        }
    }
    Ok(())
}

pub(super) fn write_family(output: &mut String, family: &MetricFamily, options: &RenderOptions) {
    let open_metrics = options.format == Format::OpenMetrics;
    let name = family.name();
    let metric_type = family.descriptor.metric_type;

    // OpenMetrics names counter families without the `_total` suffix.
    let family_name = if open_metrics && metric_type == MetricType::Counter {
        name.strip_suffix("_total").unwrap_or(name)
    } else {
        name
    };

    output.push_str("# HELP ");
    output.push_str(family_name);
    output.push(' ');
    output.push_str(&escape_help(&family.descriptor.help, open_metrics));
    output.push('\n');
    output.push_str("# TYPE ");
    output.push_str(family_name);
    output.push(' ');
    output.push_str(metric_type.as_prometheus_type());
    output.push('\n');

    let writer = SampleWriter {
        open_metrics,
        created_samples: open_metrics && options.created_samples,
    };
    for sample in &family.samples {
        writer.write_sample(output, family_name, sample);
    }
}

struct SampleWriter {
    open_metrics: bool,
    created_samples: bool,
}

impl SampleWriter {
    fn write_sample(&self, output: &mut String, name: &str, sample: &MetricSample) {
        let labels = &sample.labels;
        match &sample.value {
            MetricValue::Counter { value, exemplar } => {
                let sample_name = if self.open_metrics {
                    format!("{name}_total")
                } else {
                    name.to_string()
                };
                self.write_line(
                    output,
                    &sample_name,
                    labels,
                    None,
                    &self.float(*value),
                    exemplar.as_ref(),
                );
            }
            MetricValue::Gauge(value) => {
                self.write_line(output, name, labels, None, &self.float(*value), None);
            }
            MetricValue::Histogram(histogram) => {
                let bucket_name = format!("{name}_bucket");
                for bucket in &histogram.buckets {
                    let bound = self.float(bucket.upper_bound);
                    self.write_line(
                        output,
                        &bucket_name,
                        labels,
                        Some(("le", &bound)),
                        &bucket.cumulative_count.to_string(),
                        bucket.exemplar.as_ref(),
                    );
                }
                let sum = self.float(histogram.sum);
                self.write_line(output, &format!("{name}_sum"), labels, None, &sum, None);
                self.write_line(
                    output,
                    &format!("{name}_count"),
                    labels,
                    None,
                    &histogram.count.to_string(),
                    None,
                );
            }
            MetricValue::Summary(summary) => {
                for quantile in &summary.quantiles {
                    let rank = self.float(quantile.quantile);
                    self.write_line(
                        output,
                        name,
                        labels,
                        Some(("quantile", &rank)),
                        &self.float(quantile.value),
                        None,
                    );
                }
                let sum = self.float(summary.sum);
                self.write_line(output, &format!("{name}_sum"), labels, None, &sum, None);
                self.write_line(
                    output,
                    &format!("{name}_count"),
                    labels,
                    None,
                    &summary.count.to_string(),
                    None,
                );
            }
        }

        if self.created_samples
            && let Some(created) = sample.created
        {
            let created = self.float(time::unix_seconds(&created));
            self.write_line(output, &format!("{name}_created"), labels, None, &created, None);
        }
    }

    fn write_line(
        &self,
        output: &mut String,
        name: &str,
        labels: &[(String, String)],
        extra: Option<(&str, &str)>,
        value: &str,
        exemplar: Option<&Exemplar>,
    ) {
        output.push_str(name);
        let pairs = labels
            .iter()
            .map(|(label, value)| (label.as_str(), value.as_str()))
            .chain(extra);
        write_label_set(output, pairs, false);
        output.push(' ');
        output.push_str(value);

        if self.open_metrics
            && let Some(exemplar) = exemplar
        {
            output.push_str(" # ");
            let pairs = exemplar
                .labels
                .iter()
                .map(|(label, value)| (label.as_str(), value.as_str()));
            write_label_set(output, pairs, true);
            output.push(' ');
            output.push_str(&self.float(exemplar.value));
            output.push(' ');
            output.push_str(&format_float(time::unix_seconds(&exemplar.timestamp)));
        }
        output.push('\n');
    }

    fn float(&self, value: f64) -> String {
        if self.open_metrics {
            format_openmetrics_float(value)
        } else {
            format_float(value)
        }
    }
}

fn write_label_set<'a>(
    output: &mut String,
    pairs: impl Iterator<Item = (&'a str, &'a str)>,
    always_braces: bool,
) {
    let mut pairs = pairs.peekable();
    if pairs.peek().is_none() {
        if always_braces {
            output.push_str("{}");
        }
        return;
    }
    output.push('{');
    let mut first = true;
    for (label, value) in pairs {
        if !first {
            output.push(',');
        }
        first = false;
        output.push_str(label);
        output.push_str("=\"");
        output.push_str(&escape_label_value(value));
        output.push('"');
    }
    output.push('}');
}

pub(super) fn format_float(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value == f64::INFINITY {
        "+Inf".to_string()
    } else if value == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else {
        value.to_string()
    }
}

/// OpenMetrics spells integral floats with a trailing `.0`.
fn format_openmetrics_float(value: f64) -> String {
    let formatted = format_float(value);
    if value.is_finite() && value.fract() == 0.0 {
        format!("{formatted}.0")
    } else {
        formatted
    }
}

fn escape_help(value: &str, open_metrics: bool) -> String {
    let escaped = value.replace('\\', "\\\\").replace('\n', "\\n");
    if open_metrics {
        escaped.replace('"', "\\\"")
    } else {
        escaped
    }
}

fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('\n', "\\n")
        .replace('"', "\\\"")
}
