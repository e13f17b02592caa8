//! Exposition formats: Prometheus text 0.0.4 and OpenMetrics 1.0.
//!
//! Rendering works on an immutable [`Snapshot`] and builds the whole body
//! before returning, so a failure never yields a truncated exposition.

mod parse;
mod text;

use stathe_common::error::Result;

use crate::types::Snapshot;

pub use parse::{ParsedFamily, ParsedSample, parse_text};

pub const TEXT_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";
pub const OPENMETRICS_CONTENT_TYPE: &str =
    "application/openmetrics-text; version=1.0.0; charset=utf-8";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Format {
    #[default]
    Text,
    OpenMetrics,
}

impl Format {
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Text => TEXT_CONTENT_TYPE,
            Self::OpenMetrics => OPENMETRICS_CONTENT_TYPE,
        }
    }

    /// Picks the format from an `Accept` header. Media ranges are tried in
    /// order of decreasing `q`; anything unrecognized falls back to text.
    pub fn negotiate(accept: Option<&str>) -> Self {
        let Some(accept) = accept else {
            return Self::Text;
        };

        let mut ranges = accept
            .split(',')
            .filter_map(|range| {
                let mut parts = range.split(';').map(str::trim);
                let media_type = parts.next().filter(|media| !media.is_empty())?;
                let mut quality = 1.0_f64;
                let mut version = None;
                for param in parts {
                    let Some((key, value)) = param.split_once('=') else {
                        continue;
                    };
                    match key.trim() {
                        "q" => quality = value.trim().parse().unwrap_or(0.0),
                        "version" => version = Some(value.trim().to_string()),
                        _ => {}
                    }
                }
                Some((media_type.to_ascii_lowercase(), quality, version))
            })
            .filter(|(_, quality, _)| *quality > 0.0)
            .collect::<Vec<_>>();
        ranges.sort_by(|left, right| right.1.total_cmp(&left.1));

        for (media_type, _, version) in ranges {
            match media_type.as_str() {
                "application/openmetrics-text" => {
                    if matches!(version.as_deref(), None | Some("1.0.0") | Some("0.0.1")) {
                        return Self::OpenMetrics;
                    }
                }
                "text/plain" => {
                    if matches!(version.as_deref(), None | Some("0.0.4")) {
                        return Self::Text;
                    }
                }
                _ => {}
            }
        }
        Self::Text
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderOptions {
    pub format: Format,
    /// Emit `_created` samples. Only honored by OpenMetrics.
    pub created_samples: bool,
}

impl RenderOptions {
    pub fn new(format: Format) -> Self {
        Self {
            format,
            created_samples: false,
        }
    }

    pub fn created_samples(mut self, enabled: bool) -> Self {
        self.created_samples = enabled;
        self
    }
}

pub fn render(snapshot: &Snapshot, options: RenderOptions) -> Result<String> {
    let mut output = String::new();
    for family in &snapshot.families {
        text::validate_family(family)?;
        text::write_family(&mut output, family, &options);
    }
    if options.format == Format::OpenMetrics {
        output.push_str("# EOF\n");
    }
    Ok(output)
}

pub fn render_text(snapshot: &Snapshot) -> Result<String> {
    render(snapshot, RenderOptions::default())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::{TimeZone, Utc};
    use stathe_common::error::StatheError;

    use super::*;
    use crate::{
        HistogramOpts, Observer, Registry, SummaryOpts,
        exemplar::{Exemplar, ExemplarAdder},
        types::{
            Bucket, HistogramValue, MetricDescriptor, MetricFamily, MetricSample, MetricType,
            MetricValue, Opts,
        },
    };

    fn gauge_family(name: &str, samples: Vec<(Vec<(&str, &str)>, f64)>) -> MetricFamily {
        let label_names = samples
            .first()
            .map(|(labels, _)| labels.iter().map(|(name, _)| *name).collect::<Vec<_>>())
            .unwrap_or_default();
        MetricFamily {
            descriptor: MetricDescriptor::new(
                &Opts::new(name, "A gauge."),
                MetricType::Gauge,
                &label_names,
            )
            .unwrap(),
            samples: samples
                .into_iter()
                .map(|(labels, value)| MetricSample {
                    labels: labels
                        .into_iter()
                        .map(|(name, value)| (name.to_string(), value.to_string()))
                        .collect(),
                    value: MetricValue::Gauge(value),
                    created: None,
                })
                .collect(),
        }
    }

    fn snapshot_of(families: Vec<MetricFamily>) -> Snapshot {
        Snapshot {
            families,
            taken_at: Utc::now(),
        }
    }

    #[test]
    fn negotiation_prefers_openmetrics_only_when_asked() {
        assert_eq!(Format::negotiate(None), Format::Text);
        assert_eq!(Format::negotiate(Some("*/*")), Format::Text);
        assert_eq!(
            Format::negotiate(Some(
                "application/openmetrics-text;version=1.0.0,text/plain;version=0.0.4;q=0.5,*/*;q=0.1"
            )),
            Format::OpenMetrics
        );
        assert_eq!(
            Format::negotiate(Some(
                "application/openmetrics-text;q=0.2,text/plain;version=0.0.4"
            )),
            Format::Text
        );
        assert_eq!(
            Format::negotiate(Some("application/openmetrics-text;version=2.0.0")),
            Format::Text
        );
        assert!(Format::OpenMetrics.content_type().starts_with("application/openmetrics-text"));
    }

    #[test]
    fn label_values_and_help_are_escaped() {
        let mut family = gauge_family(
            "escaped",
            vec![(vec![("path", "C:\\dir \"quoted\"\nnext")], 1.0)],
        );
        family.descriptor.help = "Line one\nback\\slash".to_string();

        let output = render_text(&snapshot_of(vec![family])).unwrap();
        assert_eq!(
            output,
            "# HELP escaped Line one\\nback\\\\slash\n\
             # TYPE escaped gauge\n\
             escaped{path=\"C:\\\\dir \\\"quoted\\\"\\nnext\"} 1\n"
        );
    }

    #[test]
    fn special_values_use_reserved_tokens() {
        let family = gauge_family(
            "specials",
            vec![
                (vec![("case", "a")], f64::INFINITY),
                (vec![("case", "b")], f64::NEG_INFINITY),
                (vec![("case", "c")], f64::NAN),
                (vec![("case", "d")], 0.000_25),
                (vec![("case", "e")], 1_500_000.0),
            ],
        );
        let output = render_text(&snapshot_of(vec![family])).unwrap();
        assert!(output.contains("specials{case=\"a\"} +Inf\n"));
        assert!(output.contains("specials{case=\"b\"} -Inf\n"));
        assert!(output.contains("specials{case=\"c\"} NaN\n"));
        assert!(output.contains("specials{case=\"d\"} 0.00025\n"));
        assert!(output.contains("specials{case=\"e\"} 1500000\n"));
    }

    #[test]
    fn histogram_lines_carry_decimal_le_sum_and_count() {
        let registry = Registry::new();
        let histogram = registry
            .register_histogram(
                HistogramOpts::new(Opts::new("latency_seconds", "Request latency.").namespace("stathe"))
                    .buckets(vec![0.005, 0.5, 1.0]),
            )
            .unwrap();
        histogram.observe(0.2);
        histogram.observe(3.0);

        let output = render_text(&registry.snapshot().unwrap()).unwrap();
        assert_eq!(
            output,
            "# HELP stathe_latency_seconds Request latency.\n\
             # TYPE stathe_latency_seconds histogram\n\
             stathe_latency_seconds_bucket{le=\"0.005\"} 0\n\
             stathe_latency_seconds_bucket{le=\"0.5\"} 1\n\
             stathe_latency_seconds_bucket{le=\"1\"} 1\n\
             stathe_latency_seconds_bucket{le=\"+Inf\"} 2\n\
             stathe_latency_seconds_sum 3.2\n\
             stathe_latency_seconds_count 2\n"
        );
    }

    #[test]
    fn summary_lines_carry_quantile_label() {
        let registry = Registry::new();
        let summary = registry
            .register_summary_vec(
                SummaryOpts::new(Opts::new("rpc_durations_seconds", "RPC latency distributions."))
                    .objective(0.5, 0.05)
                    .objective(0.9, 0.01),
                &["service"],
            )
            .unwrap();
        summary.with_label_values(&["exponential"]).unwrap().observe(2.0);

        let output = render_text(&registry.snapshot().unwrap()).unwrap();
        assert!(output.contains("# TYPE rpc_durations_seconds summary\n"));
        assert!(output.contains("rpc_durations_seconds{service=\"exponential\",quantile=\"0.5\"} 2\n"));
        assert!(output.contains("rpc_durations_seconds{service=\"exponential\",quantile=\"0.9\"} 2\n"));
        assert!(output.contains("rpc_durations_seconds_sum{service=\"exponential\"} 2\n"));
        assert!(output.contains("rpc_durations_seconds_count{service=\"exponential\"} 1\n"));
    }

    #[test]
    fn openmetrics_adds_total_suffix_exemplars_and_eof() {
        let registry = Registry::new();
        let counter = registry
            .register_counter(Opts::new("requests_total", "Requests served."))
            .unwrap();
        counter.add_with_exemplar(3.0, &[("trace_id", "abc")]).unwrap();
        let histogram = registry
            .register_histogram(
                HistogramOpts::new(Opts::new("latency", "Latency.")).buckets(vec![1.0, 5.0]),
            )
            .unwrap();
        crate::exemplar::observe_maybe_with_exemplar(&*histogram, 4.0, &[("dummyID", "7")])
            .unwrap();

        let output = render(
            &registry.snapshot().unwrap(),
            RenderOptions::new(Format::OpenMetrics).created_samples(true),
        )
        .unwrap();

        assert!(output.contains("# HELP requests Requests served.\n# TYPE requests counter\n"));
        assert!(output.contains("requests_total 3.0 # {trace_id=\"abc\"} 3.0 "));
        assert!(output.contains("\nrequests_created "));
        assert!(output.contains("latency_bucket{le=\"1.0\"} 0\n"));
        assert!(output.contains("latency_bucket{le=\"5.0\"} 1 # {dummyID=\"7\"} 4.0 "));
        assert!(output.contains("latency_bucket{le=\"+Inf\"} 1\n"));
        assert!(output.contains("latency_count 1\n"));
        assert!(output.ends_with("# EOF\n"));

        // The text format never carries exemplars or created samples.
        let text = render(
            &registry.snapshot().unwrap(),
            RenderOptions::new(Format::Text).created_samples(true),
        )
        .unwrap();
        assert!(!text.contains("# {"));
        assert!(!text.contains("_created"));
        assert!(text.contains("requests_total 3\n"));
    }

    #[test]
    fn rendering_is_deterministic() {
        let registry = Registry::new();
        let requests = registry
            .register_counter_vec(
                Opts::new("http_requests_total", "Tracks the number of HTTP requests."),
                &["method", "code"],
            )
            .unwrap();
        for (method, code) in [("post", "500"), ("get", "200"), ("get", "404")] {
            requests.with_label_values(&[method, code]).unwrap().inc();
        }

        let snapshot = registry.snapshot().unwrap();
        let first = render_text(&snapshot).unwrap();
        let second = render_text(&snapshot).unwrap();
        assert_eq!(first, second);
        let lines = first.lines().skip(2).collect::<Vec<_>>();
        assert_eq!(
            lines,
            vec![
                "http_requests_total{code=\"200\",method=\"get\"} 1",
                "http_requests_total{code=\"404\",method=\"get\"} 1",
                "http_requests_total{code=\"500\",method=\"post\"} 1",
            ]
        );
    }

    #[test]
    fn broken_histogram_is_a_render_error() {
        let descriptor = MetricDescriptor::new(
            &Opts::new("broken", "help"),
            MetricType::Histogram,
            &[],
        )
        .unwrap();
        let family = MetricFamily {
            descriptor,
            samples: vec![MetricSample {
                labels: Vec::new(),
                value: MetricValue::Histogram(HistogramValue {
                    buckets: vec![
                        Bucket {
                            upper_bound: 1.0,
                            cumulative_count: 5,
                            exemplar: None,
                        },
                        Bucket {
                            upper_bound: f64::INFINITY,
                            cumulative_count: 3,
                            exemplar: None,
                        },
                    ],
                    count: 3,
                    sum: 1.0,
                    native: None,
                }),
                created: None,
            }],
        };
        let err = render_text(&snapshot_of(vec![family])).unwrap_err();
        assert!(matches!(err, StatheError::Render(_)));
    }

    #[test]
    fn mismatched_value_kind_is_a_render_error() {
        let mut family = gauge_family("mismatch", vec![(vec![], 1.0)]);
        family.samples[0].value = MetricValue::Counter {
            value: 1.0,
            exemplar: Some(Exemplar::new(1.0, &[]).unwrap()),
        };
        assert!(matches!(
            render_text(&snapshot_of(vec![family])),
            Err(StatheError::Render(_))
        ));
    }

    #[test]
    fn render_then_parse_recovers_every_series() {
        let registry = Registry::new();
        let requests = registry
            .register_counter_vec(
                Opts::new("http_requests_total", "Tracks the number of HTTP requests.")
                    .namespace("stathe"),
                &["method", "code"],
            )
            .unwrap();
        requests.with_label_values(&["get", "200"]).unwrap().add(9.0).unwrap();
        requests
            .with_label_values(&["post", "a \"quoted\"\nvalue"])
            .unwrap()
            .inc();
        let load = registry
            .register_gauge_vec(
                Opts::new("load_average", "System load average.")
                    .namespace("stathe")
                    .subsystem("system"),
                &["time_linux"],
            )
            .unwrap();
        load.with_label_values(&["1m"]).unwrap().set(0.52);
        load.with_label_values(&["5m"]).unwrap().set(f64::NAN);
        let histogram = registry
            .register_histogram(
                HistogramOpts::new(Opts::new("latency_seconds", "help"))
                    .buckets(crate::exponential_buckets(0.1, 1.5, 5).unwrap()),
            )
            .unwrap();
        for value in [0.05, 0.12, 0.4, 7.0] {
            histogram.observe(value);
        }
        let summary = registry
            .register_summary(
                SummaryOpts::new(Opts::new("size_bytes", "help")).objective(0.5, 0.05),
            )
            .unwrap();
        summary.observe(12.0);

        let snapshot = registry.snapshot().unwrap();
        let expected = flatten(&snapshot);

        for format in [Format::Text, Format::OpenMetrics] {
            let output = render(&snapshot, RenderOptions::new(format)).unwrap();
            let parsed = parse_text(&output).unwrap();
            let mut recovered = BTreeMap::new();
            for family in &parsed {
                for sample in &family.samples {
                    recovered.insert(
                        (sample.name.clone(), normalize_bounds(sample.labels.clone())),
                        sample.value,
                    );
                }
            }

            assert_eq!(
                recovered.keys().collect::<Vec<_>>(),
                expected.keys().collect::<Vec<_>>(),
                "{format:?}"
            );
            for (key, value) in &expected {
                let got = recovered[key];
                assert!(
                    (value.is_nan() && got.is_nan()) || (value - got).abs() < 1e-9,
                    "{key:?}: {value} != {got}"
                );
            }
        }
    }

    type SeriesKey = (String, Vec<(String, String)>);

    /// `le` and `quantile` are spelled differently by the two formats.
    fn normalize_bounds(labels: Vec<(String, String)>) -> Vec<(String, String)> {
        labels
            .into_iter()
            .map(|(name, value)| match name.as_str() {
                "le" | "quantile" => {
                    let bound = parse::parse_value(&value).unwrap();
                    (name, bound.to_string())
                }
                _ => (name, value),
            })
            .collect()
    }

    /// Expected series in text-format naming, built from the snapshot itself.
    fn flatten(snapshot: &Snapshot) -> BTreeMap<SeriesKey, f64> {
        let mut series = BTreeMap::new();
        for family in &snapshot.families {
            let name = family.name();
            for sample in &family.samples {
                let with = |extra: Option<(&str, String)>| {
                    let mut labels = sample.labels.clone();
                    if let Some((label, value)) = extra {
                        labels.push((label.to_string(), value));
                    }
                    labels.sort();
                    labels
                };
                match &sample.value {
                    MetricValue::Counter { value, .. } => {
                        let name = if name.ends_with("_total") {
                            name.to_string()
                        } else {
                            format!("{name}_total")
                        };
                        series.insert((name, with(None)), *value);
                    }
                    MetricValue::Gauge(value) => {
                        series.insert((name.to_string(), with(None)), *value);
                    }
                    MetricValue::Histogram(histogram) => {
                        for bucket in &histogram.buckets {
                            series.insert(
                                (
                                    format!("{name}_bucket"),
                                    with(Some(("le", bucket.upper_bound.to_string()))),
                                ),
                                bucket.cumulative_count as f64,
                            );
                        }
                        series.insert((format!("{name}_sum"), with(None)), histogram.sum);
                        series.insert((format!("{name}_count"), with(None)), histogram.count as f64);
                    }
                    MetricValue::Summary(summary) => {
                        for quantile in &summary.quantiles {
                            series.insert(
                                (
                                    name.to_string(),
                                    with(Some(("quantile", quantile.quantile.to_string()))),
                                ),
                                quantile.value,
                            );
                        }
                        series.insert((format!("{name}_sum"), with(None)), summary.sum);
                        series.insert((format!("{name}_count"), with(None)), summary.count as f64);
                    }
                }
            }
        }
        series
    }

    #[test]
    fn created_timestamps_are_rendered_as_unix_seconds() {
        let mut family = gauge_family("ignored", vec![(vec![], 1.0)]);
        family.descriptor.metric_type = MetricType::Counter;
        family.descriptor.fq_name = "jobs_total".to_string();
        family.samples[0].value = MetricValue::Counter {
            value: 2.0,
            exemplar: None,
        };
        family.samples[0].created = Some(Utc.timestamp_millis_opt(1_700_000_000_500).unwrap());

        let output = render(
            &snapshot_of(vec![family]),
            RenderOptions::new(Format::OpenMetrics).created_samples(true),
        )
        .unwrap();
        assert_eq!(
            output,
            "# HELP jobs A gauge.\n\
             # TYPE jobs counter\n\
             jobs_total 2.0\n\
             jobs_created 1700000000.5\n\
             # EOF\n"
        );
    }
}
