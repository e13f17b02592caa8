//! System load average from `/proc/loadavg`.
//!
//! The file holds three whitespace separated averages (1, 5 and 15 minutes)
//! followed by scheduler fields that are ignored:
//!
//! ```text
//! 0.52 0.56 0.54 2/1370 226866
//! ```

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use stathe_common::{
    error::{Result, StatheError},
    task::ScheduledTask,
};
use stathe_metrics::{Collector, GaugeVec, MetricDescriptor, MetricFamily, Opts};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// `time_linux` label values, in file order.
const WINDOWS: [&str; 3] = ["1m", "5m", "15m"];

/// Parses the first three fields of a loadavg line.
pub fn parse_load(data: &str) -> Result<[f64; 3]> {
    let fields = data.split_whitespace().collect::<Vec<_>>();
    if fields.len() < 3 {
        return Err(StatheError::Sampling(format!(
            "unexpected loadavg content: expected 3 fields, found {}",
            fields.len()
        )));
    }

    let mut loads = [0.0; 3];
    for (slot, field) in loads.iter_mut().zip(&fields[..3]) {
        *slot = field.parse::<f64>().map_err(|err| {
            StatheError::Sampling(format!("could not parse load {field:?}: {err}"))
        })?;
    }
    Ok(loads)
}

pub fn read_load(path: &Path) -> Result<[f64; 3]> {
    let data = std::fs::read_to_string(path).map_err(|err| {
        StatheError::Sampling(format!("failed to read {}: {err}", path.display()))
    })?;
    parse_load(&data)
}

/// Exposes `<namespace>_system_load_average{time_linux="1m"|"5m"|"15m"}`,
/// re-reading the source on every collection.
pub struct LoadCollector {
    path: PathBuf,
    gauges: GaugeVec,
}

impl LoadCollector {
    pub fn new(namespace: &str, path: impl Into<PathBuf>) -> Result<Self> {
        let gauges = GaugeVec::new(
            Opts::new("system_load_average", "System 1m/5m/15m load average")
                .namespace(namespace),
            &["time_linux"],
        )?;
        Ok(Self {
            path: path.into(),
            gauges,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the source and updates all three gauges. On failure none of
    /// them change.
    pub fn sample(&self) -> Result<[f64; 3]> {
        let loads = read_load(&self.path)?;
        for (window, load) in WINDOWS.into_iter().zip(loads) {
            self.gauges.with_label_values(&[window])?.set(load);
        }
        Ok(loads)
    }

    /// Last sampled value for `window` (`"1m"`, `"5m"` or `"15m"`).
    pub fn current(&self, window: &str) -> Result<f64> {
        Ok(self.gauges.with_label_values(&[window])?.get())
    }

    /// Samples in the background as well, so the gauges stay fresh for
    /// consumers that read them between scrapes.
    pub fn spawn_sampler(
        self: &Arc<Self>,
        period: Duration,
        token: CancellationToken,
    ) -> Result<ScheduledTask> {
        let collector = Arc::clone(self);
        ScheduledTask::spawn("load-sampler", period, token, move || {
            let collector = Arc::clone(&collector);
            async move {
                if let Err(err) = collector.sample() {
                    warn!(error = %err, path = %collector.path.display(), "load sampling failed");
                }
            }
        })
    }
}

impl Collector for LoadCollector {
    fn describe(&self) -> Vec<MetricDescriptor> {
        vec![self.gauges.descriptor().clone()]
    }

    fn collect(&self) -> Result<Vec<MetricFamily>> {
        self.sample()?;
        Ok(vec![self.gauges.collect_family()])
    }
}
