//! Prometheus registry of NewRelic gauges plus the exporter's own series.
//!
//! Gauge vectors are created lazily, one per distinct metric name, and are
//! never removed. All access goes through one mutex, held only for the
//! duration of a single call.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{Encoder, Gauge, GaugeVec, IntCounter, Opts, Registry, TextEncoder};
use tracing::warn;

use crate::model::Sample;

pub const NAMESPACE: &str = "newrelic";

const LABELS: [&str; 2] = ["app", "component"];

/// Map a metric name onto the Prometheus name alphabet `[A-Za-z0-9_:]`.
pub fn normalize_name(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == ':' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if out.chars().next().map_or(true, |c| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

/// Fully-qualified series identifier for a metric name.
pub fn metric_identifier(name: &str) -> String {
    format!("{NAMESPACE}_{}", normalize_name(name))
}

struct Inner {
    series: HashMap<String, GaugeVec>,
    duration: Gauge,
    total_scrapes: IntCounter,
    error: Gauge,
}

impl Inner {
    fn fixed(&self) -> [&dyn Collector; 3] {
        [&self.duration as &dyn Collector, &self.total_scrapes, &self.error]
    }

    fn is_reserved(&self, id: &str) -> bool {
        self.fixed()
            .iter()
            .flat_map(|c| c.desc())
            .any(|d| d.fq_name == id)
    }
}

/// Shared store of every series the exporter publishes.
pub struct MetricRegistry {
    inner: Mutex<Inner>,
}

impl MetricRegistry {
    pub fn new() -> Result<Self, prometheus::Error> {
        let duration = Gauge::with_opts(
            Opts::new(
                "exporter_last_scrape_duration_seconds",
                "The last scrape duration.",
            )
            .namespace(NAMESPACE),
        )?;
        let total_scrapes = IntCounter::with_opts(
            Opts::new("exporter_scrapes_total", "Total scraped metrics").namespace(NAMESPACE),
        )?;
        let error = Gauge::with_opts(
            Opts::new("exporter_last_scrape_error", "The last scrape error status.")
                .namespace(NAMESPACE),
        )?;

        Ok(Self {
            inner: Mutex::new(Inner {
                series: HashMap::new(),
                duration,
                total_scrapes,
                error,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a sample, creating its gauge vector on first sight.
    /// A later sample for the same (metric, app, category) overwrites the value.
    pub fn ingest(&self, sample: &Sample) -> Result<(), prometheus::Error> {
        let id = metric_identifier(&sample.name);
        let mut inner = self.lock();

        if !inner.series.contains_key(&id) {
            if inner.is_reserved(&id) {
                return Err(prometheus::Error::AlreadyReg);
            }
            let opts = Opts::new(
                normalize_name(&sample.name),
                format!("NewRelic metric {}", sample.name),
            )
            .namespace(NAMESPACE);
            let gauge = GaugeVec::new(opts, &LABELS)?;
            inner.series.insert(id.clone(), gauge);
        }

        if let Some(gauge) = inner.series.get(&id) {
            gauge
                .get_metric_with_label_values(&[sample.app.as_str(), sample.category.as_str()])?
                .set(sample.value);
        }
        Ok(())
    }

    /// Count a new scrape cycle.
    pub fn begin_scrape(&self) {
        self.lock().total_scrapes.inc();
    }

    /// Publish the outcome of a finished scrape cycle.
    pub fn finish_scrape(&self, elapsed: Duration, failed: bool) {
        let inner = self.lock();
        inner.duration.set(elapsed.as_secs_f64());
        inner.error.set(if failed { 1.0 } else { 0.0 });
    }

    /// Descriptors of every known series, the fixed ones included.
    pub fn describe(&self) -> Vec<Desc> {
        let inner = self.lock();
        let mut descs: Vec<Desc> = inner
            .series
            .values()
            .flat_map(|g| g.desc())
            .cloned()
            .collect();
        descs.extend(inner.fixed().iter().flat_map(|c| c.desc()).cloned());
        descs
    }

    /// Current values of every series, sorted by family name.
    pub fn collect_snapshot(&self) -> Vec<MetricFamily> {
        let snapshot = Registry::new();
        {
            let inner = self.lock();
            let collectors = inner
                .series
                .values()
                .map(|g| Box::new(g.clone()) as Box<dyn Collector>)
                .chain([
                    Box::new(inner.duration.clone()) as Box<dyn Collector>,
                    Box::new(inner.total_scrapes.clone()),
                    Box::new(inner.error.clone()),
                ]);
            for collector in collectors {
                if let Err(e) = snapshot.register(collector) {
                    warn!(error = %e, "Skipping series in snapshot");
                }
            }
        }
        snapshot.gather()
    }

    /// Number of dynamically created series.
    pub fn series_count(&self) -> usize {
        self.lock().series.len()
    }
}

/// Encode metric families in the Prometheus text exposition format.
pub fn encode_text(families: &[MetricFamily]) -> Result<String, prometheus::Error> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
