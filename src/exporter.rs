//! exporter.rs
//!
//! A collection cycle: derive a fresh window, run the scraper and feed its
//! samples into the registry as they arrive, then record duration and error
//! state. Cycles are never cancelled; overlapping cycles each run their own
//! scrape and only meet at the registry lock.

use std::sync::Arc;
use std::time::Instant;

use prometheus::proto::MetricFamily;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::client::NewRelicApi;
use crate::errors::ExporterError;
use crate::metrics::{encode_text, MetricRegistry};
use crate::scraper::{ScrapeReport, ScrapeWindow, Scraper};

pub struct Exporter {
    scraper: Scraper,
    registry: Arc<MetricRegistry>,
    period: u64,
}

impl Exporter {
    /// `period` is the queried window width in seconds.
    pub fn new(api: NewRelicApi, period: u64) -> Result<Self, ExporterError> {
        Ok(Self {
            scraper: Scraper::new(Arc::new(api)),
            registry: Arc::new(MetricRegistry::new()?),
            period,
        })
    }

    pub fn registry(&self) -> &Arc<MetricRegistry> {
        &self.registry
    }

    /// Scrape upstream and ingest every sample. Always completes; failures
    /// only show up in the report and the `last_scrape_error` gauge.
    pub async fn run_cycle(&self) -> ScrapeReport {
        let window = ScrapeWindow::ending_now(self.period);
        let start = Instant::now();
        self.registry.begin_scrape();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let ingest = async {
            let mut rejected = 0usize;
            while let Some(sample) = rx.recv().await {
                if let Err(e) = self.registry.ingest(&sample) {
                    warn!(metric = %sample.name, app = %sample.app, error = %e, "Rejected sample");
                    rejected += 1;
                }
            }
            rejected
        };

        let (mut report, rejected) = tokio::join!(self.scraper.scrape(window, tx), ingest);
        report.failed |= rejected > 0;

        let elapsed = start.elapsed();
        self.registry.finish_scrape(elapsed, report.failed);

        info!(
            applications = report.applications,
            samples = report.samples,
            rejected,
            failed = report.failed,
            duration_s = elapsed.as_secs_f64(),
            "Scrape cycle complete"
        );
        report
    }

    /// Run a cycle and snapshot the registry.
    pub async fn collect(&self) -> Vec<MetricFamily> {
        self.run_cycle().await;
        self.registry.collect_snapshot()
    }

    /// Run a cycle and encode the result in the text exposition format.
    pub async fn render(&self) -> Result<String, ExporterError> {
        let families = self.collect().await;
        Ok(encode_text(&families)?)
    }
}
