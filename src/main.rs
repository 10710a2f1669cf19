//! Entrypoint: set up tracing, load and validate settings, and serve the
//! metrics, index and health endpoints. Every request to the metrics path
//! runs one scrape of the NewRelic API.

use std::{convert::Infallible, sync::Arc};

use hyper::service::{make_service_fn, service_fn};
use hyper::Server;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use newrelic_exporter::client::{ClientOptions, NewRelicApi};
use newrelic_exporter::config::Settings;
use newrelic_exporter::errors::ExporterError;
use newrelic_exporter::exporter::Exporter;
use newrelic_exporter::server;

/// Application entrypoint for the NewRelic exporter.
///
/// **Workflow**:
/// 1. Initialise tracing/logging from `RUST_LOG` (or default to `info`).
/// 2. Load `Config.toml` (and apply any `NEWRELIC_…` env-var overrides).
/// 3. Refuse to start without an API key or with an unparsable API URL.
/// 4. Serve `/`, `/healthz` and the metrics path until terminated.
#[tokio::main]
async fn main() -> Result<(), ExporterError> {
    // ───────────────────────────────────────────────────────────────
    // 1. Initialise tracing / logging
    // ───────────────────────────────────────────────────────────────
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();
    info!("Starting NewRelic exporter…");

    // ───────────────────────────────────────────────────────────────
    // 2. Load configuration
    // ───────────────────────────────────────────────────────────────
    let settings = Settings::new()?;
    info!(?settings, "Loaded configuration");

    // ───────────────────────────────────────────────────────────────
    // 3. Upstream client & exporter
    // ───────────────────────────────────────────────────────────────
    settings.validate()?;
    let api = NewRelicApi::new(
        &settings.api_server,
        &settings.api_key,
        ClientOptions::with_timeout(settings.api_timeout),
    )?;
    let exporter = Arc::new(Exporter::new(api, settings.api_period)?);

    // ───────────────────────────────────────────────────────────────
    // 4. HTTP server
    // ───────────────────────────────────────────────────────────────
    let addr = settings.socket_addr()?;
    let metrics_path: Arc<str> = Arc::from(settings.metrics_path.as_str());

    let make_svc = make_service_fn(move |_conn| {
        let exporter = exporter.clone();
        let metrics_path = metrics_path.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                server::handle(req, exporter.clone(), metrics_path.clone())
            }))
        }
    });

    info!(%addr, metrics_path = %settings.metrics_path, "Listening");
    Server::try_bind(&addr)?.serve(make_svc).await?;

    info!("HTTP server stopped.");
    Ok(())
}
