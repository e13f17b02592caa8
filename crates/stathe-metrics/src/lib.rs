//! In-process metric aggregation.
//!
//! ```text
//! MetricVec<M>  ── with_label_values() ──► Arc<M> (Counter / Gauge / Histogram / Summary)
//!      │
//! Registry ── snapshot() ──► Snapshot ── expfmt::render() ──► text / OpenMetrics
//! ```

mod atomic;
pub mod buckets;
pub mod counter;
pub mod exemplar;
pub mod expfmt;
pub mod gauge;
pub mod histogram;
mod quantile;
pub mod registry;
pub mod summary;
pub mod types;
pub mod vec;

pub use buckets::{DEFAULT_BUCKETS, exponential_buckets, exponential_buckets_range, linear_buckets};
pub use counter::{Counter, CounterVec};
pub use exemplar::{Exemplar, ExemplarAdder, ExemplarObserver, Observer};
pub use gauge::{Gauge, GaugeVec};
pub use histogram::{Histogram, HistogramOpts, HistogramVec};
pub use registry::{Collector, DuplicatePolicy, Registry};
pub use summary::{Summary, SummaryOpts, SummaryVec};
pub use types::{
    Bucket, HistogramValue, MetricDescriptor, MetricFamily, MetricSample, MetricType, MetricValue,
    NativeBuckets, Opts, Quantile, Snapshot, SummaryValue,
};
pub use vec::{Metric, MetricVec};
