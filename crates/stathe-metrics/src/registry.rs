use std::{
    any::Any,
    collections::{BTreeMap, BTreeSet},
    sync::{
        Arc, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use stathe_common::{
    error::{Result, StatheError},
    time,
};
use tracing::debug;

use crate::{
    counter::{Counter, CounterVec},
    gauge::{Gauge, GaugeVec},
    histogram::{Histogram, HistogramOpts, HistogramVec},
    summary::{Summary, SummaryOpts, SummaryVec},
    types::{MetricDescriptor, MetricFamily, Opts, Snapshot},
};

/// Produces metric families on demand.
///
/// `describe` must list every family `collect` can emit; the registry uses
/// it for conflict checks at registration time and rejects undeclared
/// families at snapshot time.
pub trait Collector: Send + Sync {
    fn describe(&self) -> Vec<MetricDescriptor>;
    fn collect(&self) -> Result<Vec<MetricFamily>>;
}

/// What to do when the exact same descriptor is registered twice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DuplicatePolicy {
    /// Fail with [`StatheError::AlreadyRegistered`].
    #[default]
    Reject,
    /// Hand back the collector that is already registered.
    ReuseExisting,
}

struct Entry {
    id: u64,
    /// Descriptors as exposed, after any view wrapping.
    descriptors: Vec<MetricDescriptor>,
    collector: Arc<dyn Collector>,
    /// The caller's collector, kept for identity checks and reuse.
    handle: Arc<dyn Any + Send + Sync>,
}

struct RegistryInner {
    policy: DuplicatePolicy,
    entries: RwLock<Vec<Entry>>,
    next_id: AtomicU64,
}

/// Owns metric identity and produces snapshots.
///
/// Cloning is cheap and yields a handle to the same registry. Views created
/// with [`Registry::with_const_labels`] or [`Registry::with_prefix`] share the
/// underlying registry but rewrite what is registered through them.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
    const_labels: Vec<(String, String)>,
    prefix: String,
}

impl Registry {
    pub fn new() -> Self {
        Self::with_policy(DuplicatePolicy::default())
    }

    pub fn with_policy(policy: DuplicatePolicy) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                policy,
                entries: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
            const_labels: Vec::new(),
            prefix: String::new(),
        }
    }

    pub fn policy(&self) -> DuplicatePolicy {
        self.inner.policy
    }

    /// A view that adds `labels` to every family registered through it.
    pub fn with_const_labels(&self, labels: &[(&str, &str)]) -> Result<Self> {
        let mut const_labels = self.const_labels.clone();
        for (name, value) in labels {
            if const_labels.iter().any(|(existing, _)| existing == name) {
                return Err(StatheError::InvalidDescriptor(format!(
                    "const label {name:?} is already set on this registry view"
                )));
            }
            const_labels.push(((*name).to_string(), (*value).to_string()));
        }
        const_labels.sort_by(|left, right| left.0.cmp(&right.0));

        Ok(Self {
            inner: Arc::clone(&self.inner),
            const_labels,
            prefix: self.prefix.clone(),
        })
    }

    /// A view that prepends `prefix` to every family name registered through it.
    pub fn with_prefix(&self, prefix: &str) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            const_labels: self.const_labels.clone(),
            prefix: format!("{prefix}{}", self.prefix),
        }
    }

    pub fn register<C: Collector + 'static>(&self, collector: Arc<C>) -> Result<Arc<C>> {
        let descriptors = collector
            .describe()
            .into_iter()
            .map(|descriptor| self.wrap_descriptor(descriptor))
            .collect::<Result<Vec<_>>>()?;
        if descriptors.is_empty() {
            return Err(StatheError::InvalidDescriptor(
                "collector describes no metric families".to_string(),
            ));
        }
        let mut seen = BTreeSet::new();
        for descriptor in &descriptors {
            if !seen.insert(descriptor.fq_name.as_str()) {
                return Err(StatheError::DuplicateDescriptor {
                    name: descriptor.fq_name.clone(),
                    reason: "described twice by the same collector".to_string(),
                });
            }
        }

        let mut entries = self.inner.entries.write().map_err(|_| {
            StatheError::Render("failed to acquire metrics registry lock".to_string())
        })?;

        for descriptor in &descriptors {
            for entry in entries.iter() {
                for existing in &entry.descriptors {
                    if existing.fq_name != descriptor.fq_name {
                        continue;
                    }
                    if let Some(reason) = existing.incompatibility(descriptor) {
                        return Err(StatheError::DuplicateDescriptor {
                            name: descriptor.fq_name.clone(),
                            reason,
                        });
                    }
                    if existing == descriptor {
                        return self.resolve_duplicate(entry, &descriptors);
                    }
                }
            }
        }

        let wrapped: Arc<dyn Collector> = if self.is_view() {
            Arc::new(WrappingCollector {
                inner: collector.clone(),
                prefix: self.prefix.clone(),
                const_labels: self.const_labels.clone(),
            })
        } else {
            collector.clone()
        };
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(
            id,
            families = ?descriptors.iter().map(|d| d.fq_name.as_str()).collect::<Vec<_>>(),
            "collector registered"
        );
        entries.push(Entry {
            id,
            descriptors,
            collector: wrapped,
            handle: collector.clone(),
        });
        Ok(collector)
    }

    pub fn register_counter_vec(&self, opts: Opts, labels: &[&str]) -> Result<Arc<CounterVec>> {
        self.register(Arc::new(CounterVec::new(opts, labels)?))
    }

    /// Registers a label-less counter and returns its single instance.
    pub fn register_counter(&self, opts: Opts) -> Result<Arc<Counter>> {
        self.register_counter_vec(opts, &[])?.with_label_values(&[])
    }

    pub fn register_gauge_vec(&self, opts: Opts, labels: &[&str]) -> Result<Arc<GaugeVec>> {
        self.register(Arc::new(GaugeVec::new(opts, labels)?))
    }

    pub fn register_gauge(&self, opts: Opts) -> Result<Arc<Gauge>> {
        self.register_gauge_vec(opts, &[])?.with_label_values(&[])
    }

    pub fn register_histogram_vec(
        &self,
        opts: HistogramOpts,
        labels: &[&str],
    ) -> Result<Arc<HistogramVec>> {
        self.register(Arc::new(HistogramVec::new(opts, labels)?))
    }

    pub fn register_histogram(&self, opts: HistogramOpts) -> Result<Arc<Histogram>> {
        self.register_histogram_vec(opts, &[])?.with_label_values(&[])
    }

    pub fn register_summary_vec(
        &self,
        opts: SummaryOpts,
        labels: &[&str],
    ) -> Result<Arc<SummaryVec>> {
        self.register(Arc::new(SummaryVec::new(opts, labels)?))
    }

    pub fn register_summary(&self, opts: SummaryOpts) -> Result<Arc<Summary>> {
        self.register_summary_vec(opts, &[])?.with_label_values(&[])
    }

    /// Removes the collector that registered `descriptor`, with all its instances.
    ///
    /// `descriptor` is matched after this registry's const labels and prefix
    /// are applied, so a collector registered through a
    /// [`with_const_labels`](Self::with_const_labels) or
    /// [`with_prefix`](Self::with_prefix) view can only be removed through an
    /// equivalent view. The base registry returns `false` for it.
    pub fn unregister(&self, descriptor: &MetricDescriptor) -> bool {
        let Ok(descriptor) = self.wrap_descriptor(descriptor.clone()) else {
            return false;
        };
        self.remove_where(|entry| entry.descriptors.contains(&descriptor))
    }

    pub fn unregister_collector<C: Collector + 'static>(&self, collector: &Arc<C>) -> bool {
        let target = Arc::as_ptr(collector) as *const ();
        self.remove_where(|entry| Arc::as_ptr(&entry.handle) as *const () == target)
    }

    /// Number of registered collectors.
    pub fn len(&self) -> usize {
        self.inner
            .entries
            .read()
            .map(|entries| entries.len())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Collects every registered family into one snapshot, sorted by name.
    ///
    /// The registry lock is held only while the collector list is copied;
    /// each collector is then read on its own.
    pub fn snapshot(&self) -> Result<Snapshot> {
        let collectors = {
            let entries = self.inner.entries.read().map_err(|_| {
                StatheError::Render("failed to acquire metrics registry lock".to_string())
            })?;
            entries
                .iter()
                .map(|entry| {
                    (
                        entry.id,
                        entry.descriptors.clone(),
                        Arc::clone(&entry.collector),
                    )
                })
                .collect::<Vec<_>>()
        };

        let mut by_name: BTreeMap<String, MetricFamily> = BTreeMap::new();
        for (id, declared, collector) in collectors {
            for family in collector.collect()? {
                if !declared
                    .iter()
                    .any(|descriptor| descriptor.is_compatible(&family.descriptor))
                {
                    return Err(StatheError::Render(format!(
                        "collector {id} produced undeclared family {}",
                        family.name()
                    )));
                }
                match by_name.get_mut(family.name()) {
                    Some(merged) => {
                        if !merged.descriptor.is_compatible(&family.descriptor) {
                            return Err(StatheError::Render(format!(
                                "family {} collected with inconsistent shapes",
                                family.name()
                            )));
                        }
                        merged.samples.extend(family.samples);
                    }
                    None => {
                        by_name.insert(family.name().to_string(), family);
                    }
                }
            }
        }

        let mut families = Vec::with_capacity(by_name.len());
        for (name, mut family) in by_name {
            if family.samples.is_empty() {
                continue;
            }
            family
                .samples
                .sort_by(|left, right| left.labels.cmp(&right.labels));
            if let Some(pair) = family
                .samples
                .windows(2)
                .find(|pair| pair[0].labels == pair[1].labels)
            {
                return Err(StatheError::Render(format!(
                    "family {name} has duplicate samples for labels {:?}",
                    pair[0].labels
                )));
            }
            families.push(family);
        }

        Ok(Snapshot {
            families,
            taken_at: time::now(),
        })
    }

    fn is_view(&self) -> bool {
        !self.prefix.is_empty() || !self.const_labels.is_empty()
    }

    fn wrap_descriptor(&self, descriptor: MetricDescriptor) -> Result<MetricDescriptor> {
        if !self.is_view() {
            descriptor.validate()?;
            return Ok(descriptor);
        }
        let wrapped = wrap_descriptor(descriptor, &self.prefix, &self.const_labels);
        wrapped.validate()?;
        Ok(wrapped)
    }

    fn resolve_duplicate<C: Collector + 'static>(
        &self,
        entry: &Entry,
        descriptors: &[MetricDescriptor],
    ) -> Result<Arc<C>> {
        let name = descriptors
            .first()
            .map(|descriptor| descriptor.fq_name.clone())
            .unwrap_or_default();
        match self.inner.policy {
            DuplicatePolicy::Reject => Err(StatheError::AlreadyRegistered(name)),
            DuplicatePolicy::ReuseExisting => {
                if entry.descriptors != descriptors {
                    return Err(StatheError::AlreadyRegistered(name));
                }
                Arc::clone(&entry.handle)
                    .downcast::<C>()
                    .map_err(|_| StatheError::AlreadyRegistered(name))
            }
        }
    }

    fn remove_where(&self, predicate: impl Fn(&Entry) -> bool) -> bool {
        let Ok(mut entries) = self.inner.entries.write() else {
            return false;
        };
        let before = entries.len();
        entries.retain(|entry| !predicate(entry));
        entries.len() != before
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

fn wrap_descriptor(
    mut descriptor: MetricDescriptor,
    prefix: &str,
    const_labels: &[(String, String)],
) -> MetricDescriptor {
    descriptor.fq_name = format!("{prefix}{}", descriptor.fq_name);
    descriptor.const_labels.extend(const_labels.iter().cloned());
    descriptor
        .const_labels
        .sort_by(|left, right| left.0.cmp(&right.0));
    descriptor
}

/// Applies a registry view's prefix and const labels at collect time, so the
/// wrapped collector's own descriptors stay untouched.
struct WrappingCollector {
    inner: Arc<dyn Collector>,
    prefix: String,
    const_labels: Vec<(String, String)>,
}

impl Collector for WrappingCollector {
    fn describe(&self) -> Vec<MetricDescriptor> {
        self.inner
            .describe()
            .into_iter()
            .map(|descriptor| wrap_descriptor(descriptor, &self.prefix, &self.const_labels))
            .collect()
    }

    fn collect(&self) -> Result<Vec<MetricFamily>> {
        let mut families = self.inner.collect()?;
        for family in &mut families {
            family.descriptor =
                wrap_descriptor(family.descriptor.clone(), &self.prefix, &self.const_labels);
            for sample in &mut family.samples {
                sample.labels.extend(self.const_labels.iter().cloned());
                sample.labels.sort_by(|left, right| left.0.cmp(&right.0));
            }
        }
        Ok(families)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        exemplar::Observer,
        types::{MetricFamily, MetricSample, MetricType, MetricValue},
    };

    fn requests_opts() -> Opts {
        Opts::new("http_requests_total", "Tracks the number of HTTP requests.").namespace("stathe")
    }

    #[test]
    fn identical_registration_follows_policy() {
        let registry = Registry::new();
        registry
            .register_counter_vec(requests_opts(), &["method", "code"])
            .unwrap();
        let err = registry
            .register_counter_vec(requests_opts(), &["method", "code"])
            .err()
            .unwrap();
        assert!(matches!(&err, StatheError::AlreadyRegistered(name) if name == "stathe_http_requests_total"));
        assert!(err.is_registration());

        let registry = Registry::with_policy(DuplicatePolicy::ReuseExisting);
        let first = registry
            .register_counter_vec(requests_opts(), &["method", "code"])
            .unwrap();
        let second = registry
            .register_counter_vec(requests_opts(), &["method", "code"])
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn incompatible_shape_is_a_duplicate_descriptor() {
        let registry = Registry::with_policy(DuplicatePolicy::ReuseExisting);
        registry
            .register_counter_vec(requests_opts(), &["method", "code"])
            .unwrap();

        let err = registry
            .register_gauge_vec(requests_opts(), &["method", "code"])
            .err()
            .unwrap();
        assert!(matches!(err, StatheError::DuplicateDescriptor { .. }));

        let err = registry
            .register_counter_vec(requests_opts(), &["method"])
            .err()
            .unwrap();
        assert!(matches!(err, StatheError::DuplicateDescriptor { .. }));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn const_label_values_distinguish_families_of_one_name() {
        let registry = Registry::new();
        let a = registry
            .with_const_labels(&[("handler", "/a")])
            .unwrap()
            .register_counter_vec(requests_opts(), &["method", "code"])
            .unwrap();
        let b = registry
            .with_const_labels(&[("handler", "/b")])
            .unwrap()
            .register_counter_vec(requests_opts(), &["method", "code"])
            .unwrap();
        a.with_label_values(&["get", "200"]).unwrap().inc();
        b.with_label_values(&["get", "200"]).unwrap().add(2.0).unwrap();

        // The underlying descriptors are not rewritten by the view.
        assert!(a.descriptor().const_labels.is_empty());

        let snapshot = registry.snapshot().unwrap();
        let family = snapshot.family("stathe_http_requests_total").unwrap();
        assert_eq!(family.samples.len(), 2);
        assert_eq!(family.samples[0].label("handler"), Some("/a"));
        assert_eq!(family.samples[1].label("handler"), Some("/b"));
        assert_eq!(
            family.samples[1].value,
            MetricValue::Counter {
                value: 2.0,
                exemplar: None
            }
        );
    }

    #[test]
    fn view_label_conflicts_are_rejected() {
        let registry = Registry::new();
        let view = registry.with_const_labels(&[("code", "200")]).unwrap();
        let err = view
            .register_counter_vec(requests_opts(), &["method", "code"])
            .err()
            .unwrap();
        assert!(matches!(err, StatheError::InvalidDescriptor(_)));
        assert!(view.with_const_labels(&[("code", "500")]).is_err());
    }

    #[test]
    fn prefix_view_renames_families() {
        let registry = Registry::new();
        registry
            .with_prefix("edge_")
            .register_gauge(Opts::new("up", "Whether the target is up."))
            .unwrap()
            .set(1.0);

        let snapshot = registry.snapshot().unwrap();
        assert!(snapshot.family("edge_up").is_some());
        assert!(snapshot.family("up").is_none());
    }

    #[test]
    fn unregister_removes_family_and_instances() {
        let registry = Registry::new();
        let vec = registry
            .register_counter_vec(requests_opts(), &["method", "code"])
            .unwrap();
        vec.with_label_values(&["get", "200"]).unwrap().inc();

        assert!(registry.unregister(vec.descriptor()));
        assert!(!registry.unregister(vec.descriptor()));
        assert!(registry.snapshot().unwrap().families.is_empty());

        // The name is free again.
        let gauge = registry.register_gauge_vec(requests_opts(), &[]).unwrap();
        assert!(registry.unregister_collector(&gauge));
        assert!(registry.is_empty());
    }

    #[test]
    fn views_unregister_what_they_registered() {
        let registry = Registry::new();
        let view = registry.with_prefix("edge_");
        let vec = view.register_gauge_vec(requests_opts(), &[]).unwrap();

        assert!(!registry.unregister(vec.descriptor()));
        assert_eq!(registry.len(), 1);
        assert!(registry.with_prefix("edge_").unregister(vec.descriptor()));
        assert!(registry.is_empty());
    }

    #[test]
    fn snapshot_is_sorted_and_skips_empty_vecs() {
        let registry = Registry::new();
        registry
            .register_counter_vec(requests_opts(), &["method", "code"])
            .unwrap();
        registry
            .register_gauge(Opts::new("b_gauge", "help"))
            .unwrap()
            .set(2.0);
        registry
            .register_histogram(HistogramOpts::new(Opts::new("a_latency", "help")))
            .unwrap()
            .observe(0.2);

        let snapshot = registry.snapshot().unwrap();
        let names = snapshot
            .families
            .iter()
            .map(|family| family.name())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["a_latency", "b_gauge"]);
    }

    struct RogueCollector {
        declared: MetricDescriptor,
        emitted: MetricDescriptor,
        samples: usize,
    }

    impl Collector for RogueCollector {
        fn describe(&self) -> Vec<MetricDescriptor> {
            vec![self.declared.clone()]
        }

        fn collect(&self) -> Result<Vec<MetricFamily>> {
            Ok(vec![MetricFamily {
                descriptor: self.emitted.clone(),
                samples: (0..self.samples)
                    .map(|_| MetricSample {
                        labels: Vec::new(),
                        value: MetricValue::Gauge(1.0),
                        created: None,
                    })
                    .collect(),
            }])
        }
    }

    fn gauge_descriptor(name: &str) -> MetricDescriptor {
        MetricDescriptor::new(&Opts::new(name, "help"), MetricType::Gauge, &[]).unwrap()
    }

    #[test]
    fn malformed_collector_output_fails_the_snapshot() {
        let registry = Registry::new();
        let rogue = registry
            .register(Arc::new(RogueCollector {
                declared: gauge_descriptor("declared"),
                emitted: gauge_descriptor("surprise"),
                samples: 1,
            }))
            .unwrap();
        assert!(matches!(registry.snapshot(), Err(StatheError::Render(_))));
        registry.unregister_collector(&rogue);

        registry
            .register(Arc::new(RogueCollector {
                declared: gauge_descriptor("twice"),
                emitted: gauge_descriptor("twice"),
                samples: 2,
            }))
            .unwrap();
        assert!(matches!(registry.snapshot(), Err(StatheError::Render(_))));
    }
}
