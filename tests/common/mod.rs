#![allow(dead_code)]

use newrelic_exporter::client::{ClientOptions, NewRelicApi};
use newrelic_exporter::model::Sample;
use newrelic_exporter::scraper::{ScrapeReport, ScrapeWindow, Scraper};
use std::sync::Arc;
use tokio::sync::mpsc;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const API_KEY: &str = "205071e37e95bdaa327c62ccd3201da9289ccd17";
pub const APP_ID: u64 = 9045822;

pub fn fixture(name: &str) -> String {
    let file = format!("{}/tests/fixtures/{name}", env!("CARGO_MANIFEST_DIR"));
    std::fs::read_to_string(&file).unwrap_or_else(|e| panic!("reading {file}: {e}"))
}

pub fn api(server: &MockServer) -> NewRelicApi {
    NewRelicApi::new(&server.uri(), API_KEY, ClientOptions::default()).unwrap()
}

pub fn ok_json(body: impl Into<String>) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("Content-Type", "application/json")
        .set_body_string(body.into())
}

/// `GET path` answers `body` for requests carrying the API key.
pub async fn mount(server: &MockServer, at: &str, body: impl Into<String>) {
    Mock::given(method("GET"))
        .and(path(at))
        .and(header("X-Api-Key", API_KEY))
        .respond_with(ok_json(body))
        .mount(server)
        .await;
}

/// The fixture set of the original regression test: one application with a
/// two-page metric catalog.
pub async fn regression_server() -> MockServer {
    let server = MockServer::start().await;
    let uri = server.uri();
    let names_path = format!("/v2/applications/{APP_ID}/metrics.json");

    mount(&server, "/v2/applications.json", fixture("application_list.json")).await;

    let second_link = format!(
        r#"<{uri}{names_path}?page=1>; rel="first", <{uri}{names_path}?page=1>; rel="prev""#
    );
    Mock::given(method("GET"))
        .and(path(names_path.as_str()))
        .and(query_param("page", "2"))
        .and(header("X-Api-Key", API_KEY))
        .respond_with(
            ok_json(fixture("metric_names_2.json")).insert_header("Link", second_link.as_str()),
        )
        .with_priority(1)
        .mount(&server)
        .await;

    let first_link = format!(
        r#"<{uri}{names_path}?page=2>; rel="next", <{uri}{names_path}?page=2>; rel="last""#
    );
    Mock::given(method("GET"))
        .and(path(names_path.as_str()))
        .and(header("X-Api-Key", API_KEY))
        .respond_with(
            ok_json(fixture("metric_names.json")).insert_header("Link", first_link.as_str()),
        )
        .mount(&server)
        .await;

    mount(
        &server,
        &format!("/v2/applications/{APP_ID}/metrics/data.json"),
        fixture("metric_data.json"),
    )
    .await;

    server
}

/// Run one scrape and collect everything it emitted.
pub async fn scrape_all(api: NewRelicApi) -> (ScrapeReport, Vec<Sample>) {
    let scraper = Scraper::new(Arc::new(api));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let collect = async {
        let mut samples = Vec::new();
        while let Some(sample) = rx.recv().await {
            samples.push(sample);
        }
        samples
    };
    tokio::join!(scraper.scrape(ScrapeWindow::ending_now(60), tx), collect)
}

/// Catalog JSON listing `n` metric names `Metric/0..n`.
pub fn catalog_json(n: usize) -> String {
    let metrics: Vec<String> = (0..n)
        .map(|i| format!(r#"{{"name":"Metric/{i}","values":["call_count"]}}"#))
        .collect();
    format!(r#"{{"metrics":[{}]}}"#, metrics.join(","))
}
