//! scraper.rs
//!
//! One scrape of the NewRelic API: the application list, then for every
//! application its metric catalog and the metric data in chunks of
//! [`CHUNK_SIZE`] names, all flattened into [`Sample`]s. Failures are logged
//! and reported through [`ScrapeReport::failed`]; they never stop sibling work.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error};

use crate::client::NewRelicApi;
use crate::errors::ExporterError;
use crate::model::{
    decode_documents, Application, ApplicationList, Document, MetricDataSet, MetricNameCatalog,
    Sample,
};

/// Metric names per data request. The API rejects oversized queries and
/// offers no way to continue one.
pub const CHUNK_SIZE: usize = 10;

pub const APPLICATIONS_PATH: &str = "/v2/applications.json";

/// Time range and aggregation period shared by every request of one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrapeWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    /// Seconds
    pub period: u64,
}

impl ScrapeWindow {
    /// `None` when the window start falls outside the representable range.
    pub fn try_ending_at(to: DateTime<Utc>, period: u64) -> Option<Self> {
        let width = i64::try_from(period)
            .ok()
            .and_then(chrono::Duration::try_seconds)?;
        Some(Self {
            from: to.checked_sub_signed(width)?,
            to,
            period,
        })
    }

    /// Like [`ScrapeWindow::try_ending_at`], clamping an unrepresentable
    /// start to the earliest instant.
    pub fn ending_at(to: DateTime<Utc>, period: u64) -> Self {
        Self::try_ending_at(to, period).unwrap_or(Self {
            from: DateTime::<Utc>::MIN_UTC,
            to,
            period,
        })
    }

    pub fn ending_now(period: u64) -> Self {
        Self::ending_at(Utc::now(), period)
    }

    /// Query for one data chunk: summarized raw values over the window.
    pub fn query(&self, names: &[String]) -> Vec<(&'static str, String)> {
        let mut query: Vec<(&'static str, String)> =
            names.iter().map(|n| ("names[]", n.clone())).collect();
        query.extend([
            ("raw", "true".to_string()),
            ("summarize", "true".to_string()),
            ("period", self.period.to_string()),
            ("from", self.from.to_rfc3339_opts(SecondsFormat::Secs, true)),
            ("to", self.to.to_rfc3339_opts(SecondsFormat::Secs, true)),
        ]);
        query
    }
}

/// Split metric names into request-sized batches.
pub fn chunk_names(names: &[String]) -> std::slice::Chunks<'_, String> {
    names.chunks(CHUNK_SIZE)
}

/// Outcome of one scrape.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScrapeReport {
    pub failed: bool,
    pub applications: usize,
    pub samples: usize,
}

struct AppOutcome {
    samples: Vec<Sample>,
    failed: bool,
}

pub struct Scraper {
    api: Arc<NewRelicApi>,
}

impl Scraper {
    pub fn new(api: Arc<NewRelicApi>) -> Self {
        Self { api }
    }

    /// Run one scrape, streaming samples into `tx` as each application
    /// finishes. The channel closes when every application is done.
    pub async fn scrape(&self, window: ScrapeWindow, tx: UnboundedSender<Sample>) -> ScrapeReport {
        let mut report = ScrapeReport::default();

        debug!(server = %self.api.server(), "Requesting application list");
        let apps = match self.fetch_decoded::<ApplicationList>(APPLICATIONS_PATH, &[]).await {
            Ok(apps) => apps,
            Err(e) => {
                error!(error = %e, "Error getting application list");
                report.failed = true;
                ApplicationList::default()
            }
        };
        report.applications = apps.applications.len();
        report.samples += emit(&tx, apps.summary_samples());

        let mut pipelines: FuturesUnordered<_> = apps
            .applications
            .iter()
            .map(|app| self.scrape_application(app, window))
            .collect();

        while let Some(outcome) = pipelines.next().await {
            report.failed |= outcome.failed;
            report.samples += emit(&tx, outcome.samples);
        }

        report
    }

    async fn scrape_application(&self, app: &Application, window: ScrapeWindow) -> AppOutcome {
        debug!(app = %app.name, app_id = app.id, "Requesting metric names");
        let path = format!("/v2/applications/{}/metrics.json", app.id);

        let catalog = match self.fetch_decoded::<MetricNameCatalog>(&path, &[]).await {
            Ok(catalog) => catalog,
            Err(e) => {
                error!(app = %app.name, app_id = app.id, error = %e, "Error getting metric names");
                return AppOutcome {
                    samples: Vec::new(),
                    failed: true,
                };
            }
        };

        let (data, failed) = self.metric_data(app, &catalog.names(), window).await;
        AppOutcome {
            samples: data.samples(&app.name).collect(),
            failed,
        }
    }

    /// Fetch every chunk concurrently and merge whatever succeeded.
    async fn metric_data(
        &self,
        app: &Application,
        names: &[String],
        window: ScrapeWindow,
    ) -> (MetricDataSet, bool) {
        let path = format!("/v2/applications/{}/metrics/data.json", app.id);
        debug!(app = %app.name, app_id = app.id, count = names.len(), "Requesting metrics");

        let chunks = chunk_names(names).map(|chunk| {
            let path = &path;
            async move {
                self.fetch_decoded::<MetricDataSet>(path, &window.query(chunk))
                    .await
            }
        });

        let mut merged = MetricDataSet::default();
        let mut failed = false;
        for result in join_all(chunks).await {
            match result {
                Ok(data) => merged.merge(data),
                Err(e) => {
                    error!(app = %app.name, app_id = app.id, error = %e, "Error requesting metrics");
                    failed = true;
                }
            }
        }
        (merged, failed)
    }

    async fn fetch_decoded<T: Document>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ExporterError> {
        let body = self.api.fetch(path, query).await?;
        decode_documents(&body).map_err(|e| ExporterError::Decode(path.to_string(), e))
    }
}

fn emit(tx: &UnboundedSender<Sample>, samples: impl IntoIterator<Item = Sample>) -> usize {
    let mut sent = 0;
    for sample in samples {
        if tx.send(sample).is_err() {
            break;
        }
        sent += 1;
    }
    sent
}
