//! client.rs
//!
//! Authenticated access to the NewRelic REST API. A single `fetch` follows
//! `Link: <...>; rel="next"` headers and hands back every page's body
//! concatenated, so callers see one byte buffer holding N JSON documents.

use std::collections::HashSet;
use std::time::Duration;

use reqwest::{header::LINK, Client, StatusCode};
use tracing::{debug, warn};
use url::Url;

use crate::errors::ExporterError;

pub const USER_AGENT: &str = "NewRelic Exporter";

const API_KEY_HEADER: &str = "X-Api-Key";

/// HTTP client knobs for [`NewRelicApi`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Per-request timeout; the pipeline itself never times out.
    pub timeout: Duration,
    accept_invalid_certs: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            accept_invalid_certs: false,
        }
    }
}

impl ClientOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }

    /// Skip TLS certificate verification. Only for self-signed test servers.
    #[cfg(test)]
    pub(crate) fn accept_invalid_certs(mut self) -> Self {
        self.accept_invalid_certs = true;
        self
    }
}

/// Paginating client bound to one API server and key.
pub struct NewRelicApi {
    server: Url,
    api_key: String,
    client: Client,
}

impl NewRelicApi {
    pub fn new(server: &str, api_key: &str, options: ClientOptions) -> Result<Self, ExporterError> {
        if api_key.trim().is_empty() {
            return Err(ExporterError::MissingApiKey);
        }
        let server =
            Url::parse(server).map_err(|e| ExporterError::InvalidUrl(server.to_string(), e))?;

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(options.timeout)
            .gzip(true)
            .danger_accept_invalid_certs(options.accept_invalid_certs)
            .build()
            .map_err(|e| ExporterError::Transport(server.to_string(), e))?;

        Ok(Self {
            server,
            api_key: api_key.to_string(),
            client,
        })
    }

    pub fn server(&self) -> &Url {
        &self.server
    }

    /// GET `path` with `query` and every following page.
    ///
    /// Any page answering with a status other than 200 fails the whole
    /// fetch. A missing or unparsable `Link` header ends pagination, as does
    /// a `next` link pointing at a page already fetched.
    pub async fn fetch(&self, path: &str, query: &[(&str, String)]) -> Result<Vec<u8>, ExporterError> {
        let mut url = self
            .server
            .join(path)
            .map_err(|e| ExporterError::InvalidUrl(path.to_string(), e))?;
        if !query.is_empty() {
            url.query_pairs_mut()
                .extend_pairs(query.iter().map(|(k, v)| (*k, v.as_str())));
        }

        let mut data = Vec::new();
        let mut visited = HashSet::new();
        let mut next = Some(url);

        while let Some(url) = next.take() {
            debug!(url = %url, "Making API call");
            visited.insert(url.clone());

            let resp = self
                .client
                .get(url.clone())
                .header(API_KEY_HEADER, &self.api_key)
                .send()
                .await
                .map_err(|e| ExporterError::Transport(url.to_string(), e))?;

            if resp.status() != StatusCode::OK {
                return Err(ExporterError::UpstreamStatus(url.to_string(), resp.status()));
            }

            next = resp
                .headers()
                .get(LINK)
                .and_then(|v| v.to_str().ok())
                .and_then(|h| next_link(h, &url));
            if next.as_ref().is_some_and(|n| visited.contains(n)) {
                warn!(url = %url, "Pagination loops back to a fetched page, stopping");
                next = None;
            }

            let body = resp
                .bytes()
                .await
                .map_err(|e| ExporterError::Transport(url.to_string(), e))?;
            data.extend_from_slice(&body);
        }

        debug!(path, pages = visited.len(), bytes = data.len(), "Fetched all pages");
        Ok(data)
    }
}

/// Find the `rel="next"` target in a `Link` header value.
///
/// Relative targets resolve against `current`. Returns `None` when there is
/// no next relation or the header is malformed.
pub fn next_link(header: &str, current: &Url) -> Option<Url> {
    let mut rest = header.trim();

    while !rest.is_empty() {
        let (target, tail) = rest.strip_prefix('<')?.split_once('>')?;
        let (mut params, remaining) = split_unquoted(tail, ',');

        let mut is_next = false;
        while !params.is_empty() {
            let (param, more) = split_unquoted(params, ';');
            params = more;
            let Some((key, value)) = param.split_once('=') else {
                continue;
            };
            if key.trim().eq_ignore_ascii_case("rel") {
                is_next |= value
                    .trim()
                    .trim_matches('"')
                    .split_whitespace()
                    .any(|r| r.eq_ignore_ascii_case("next"));
            }
        }
        if is_next {
            return current.join(target.trim()).ok();
        }

        rest = remaining.trim_start();
    }

    None
}

/// Split at the first `sep` outside a quoted string.
fn split_unquoted(s: &str, sep: char) -> (&str, &str) {
    let mut quoted = false;
    for (i, c) in s.char_indices() {
        match c {
            '"' => quoted = !quoted,
            c if c == sep && !quoted => return (&s[..i], &s[i + c.len_utf8()..]),
            _ => {}
        }
    }
    (s, "")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const KEY: &str = "205071e37e95bdaa327c62ccd3201da9289ccd17";

    fn current() -> Url {
        Url::parse("https://api.newrelic.com/v2/applications/1/metrics.json").unwrap()
    }

    fn api(server: &MockServer) -> NewRelicApi {
        NewRelicApi::new(&server.uri(), KEY, ClientOptions::default().accept_invalid_certs()).unwrap()
    }

    #[test]
    fn next_link_picks_next_relation() {
        let h = r#"<https://api.newrelic.com/v2/a.json?page=2>; rel="next", <https://api.newrelic.com/v2/a.json?page=9>; rel="last""#;
        let next = next_link(h, &current()).unwrap();
        assert_eq!(next.as_str(), "https://api.newrelic.com/v2/a.json?page=2");
    }

    #[test]
    fn next_link_ignores_other_relations() {
        let h = r#"<https://x/a?page=1>; rel="first", <https://x/a?page=1>; rel="prev""#;
        assert!(next_link(h, &current()).is_none());
    }

    #[test]
    fn next_link_accepts_unquoted_and_multi_valued_rel() {
        let h = "<https://x/a?page=3>; rel=next";
        assert_eq!(next_link(h, &current()).unwrap().query(), Some("page=3"));

        let h = r#"<https://x/a?page=4>; title="x"; rel="last next""#;
        assert_eq!(next_link(h, &current()).unwrap().query(), Some("page=4"));
    }

    #[test]
    fn separators_inside_quoted_parameters_are_literal() {
        let h = r#"<https://x/a?page=5>; title="a, b"; rel="next""#;
        assert_eq!(next_link(h, &current()).unwrap().query(), Some("page=5"));

        let h = r#"<https://x/a?page=1>; title="x; rel=next, <https://x/a?page=9>"; rel="prev""#;
        assert!(next_link(h, &current()).is_none());
    }

    #[test]
    fn next_link_resolves_relative_targets() {
        let h = r#"</v2/applications/1/metrics.json?page=2>; rel="next""#;
        let next = next_link(h, &current()).unwrap();
        assert_eq!(
            next.as_str(),
            "https://api.newrelic.com/v2/applications/1/metrics.json?page=2"
        );
    }

    #[test]
    fn malformed_link_means_no_next_page() {
        assert!(next_link("https://x/a; rel=\"next\"", &current()).is_none());
        assert!(next_link("<https://x/a; rel=\"next\"", &current()).is_none());
        assert!(next_link("", &current()).is_none());
    }

    #[test]
    fn empty_api_key_is_rejected() {
        let res = NewRelicApi::new("https://api.newrelic.com", "", ClientOptions::default());
        assert!(matches!(res, Err(ExporterError::MissingApiKey)));
    }

    #[tokio::test]
    async fn single_page_body_is_returned_verbatim() {
        let server = MockServer::start().await;
        let body = r#"{"applications":[]}"#;
        Mock::given(method("GET"))
            .and(path("/v2/applications.json"))
            .and(header(API_KEY_HEADER, KEY))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .expect(1)
            .mount(&server)
            .await;

        let bytes = assert_ok!(api(&server).fetch("/v2/applications.json", &[]).await);
        assert_eq!(bytes, body.as_bytes());
    }

    #[tokio::test]
    async fn follows_next_links_and_concatenates_pages() {
        let server = MockServer::start().await;
        let uri = server.uri();
        let first = format!(
            r#"<{uri}/v2/x.json?page=2>; rel="next", <{uri}/v2/x.json?page=3>; rel="last""#
        );
        let second = format!(r#"<{uri}/v2/x.json?page=3>; rel="next""#);
        let third = format!(r#"<{uri}/v2/x.json?page=1>; rel="first""#);

        for (page, link, body) in [("2", second, "[2]"), ("3", third, "[3]")] {
            Mock::given(path("/v2/x.json"))
                .and(query_param("page", page))
                .and(header(API_KEY_HEADER, KEY))
                .respond_with(
                    ResponseTemplate::new(200)
                        .insert_header("Link", link.as_str())
                        .set_body_string(body),
                )
                .with_priority(1)
                .expect(1)
                .mount(&server)
                .await;
        }
        Mock::given(path("/v2/x.json"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Link", first.as_str())
                    .set_body_string("[1]"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let bytes = assert_ok!(api(&server).fetch("/v2/x.json", &[]).await);
        assert_eq!(bytes, b"[1][2][3]");
    }

    #[tokio::test]
    async fn next_link_cycle_stops_at_first_repeated_page() {
        let server = MockServer::start().await;
        let uri = server.uri();
        for (page, next, body) in [("1", "2", "[1]"), ("2", "1", "[2]")] {
            let link = format!(r#"<{uri}/v2/x.json?page={next}>; rel="next""#);
            Mock::given(path("/v2/x.json"))
                .and(query_param("page", page))
                .respond_with(
                    ResponseTemplate::new(200)
                        .insert_header("Link", link.as_str())
                        .set_body_string(body),
                )
                .expect(1)
                .mount(&server)
                .await;
        }

        let query = [("page", "1".to_string())];
        let bytes = assert_ok!(
            tokio::time::timeout(
                Duration::from_secs(5),
                api(&server).fetch("/v2/x.json", &query)
            )
            .await
            .expect("pagination did not terminate")
        );
        assert_eq!(bytes, b"[1][2]");
    }

    #[tokio::test]
    async fn self_link_is_fetched_once() {
        let server = MockServer::start().await;
        let link = format!(r#"<{}/v2/x.json>; rel="next""#, server.uri());
        Mock::given(path("/v2/x.json"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Link", link.as_str())
                    .set_body_string("[1]"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let bytes = assert_ok!(api(&server).fetch("/v2/x.json", &[]).await);
        assert_eq!(bytes, b"[1]");
    }

    #[tokio::test]
    async fn malformed_link_header_stops_after_current_page() {
        let server = MockServer::start().await;
        Mock::given(path("/v2/x.json"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Link", "garbage; rel=\"next\"")
                    .set_body_string("[1]"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let bytes = assert_ok!(api(&server).fetch("/v2/x.json", &[]).await);
        assert_eq!(bytes, b"[1]");
    }

    #[tokio::test]
    async fn non_200_status_fails_the_fetch() {
        let server = MockServer::start().await;
        Mock::given(path("/v2/x.json"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let err = assert_err!(api(&server).fetch("/v2/x.json", &[]).await);
        match err {
            ExporterError::UpstreamStatus(_, status) => assert_eq!(status, StatusCode::FORBIDDEN),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn query_parameters_are_sent_in_order() {
        let server = MockServer::start().await;
        Mock::given(path("/v2/x.json"))
            .and(query_param("names[]", "a/b"))
            .and(query_param("raw", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .expect(1)
            .mount(&server)
            .await;

        let query = [
            ("names[]", "a/b".to_string()),
            ("names[]", "c".to_string()),
            ("raw", "true".to_string()),
        ];
        assert_ok!(api(&server).fetch("/v2/x.json", &query).await);

        let requests = server.received_requests().await.unwrap();
        let names: Vec<String> = requests[0]
            .url
            .query_pairs()
            .filter(|(k, _)| k == "names[]")
            .map(|(_, v)| v.into_owned())
            .collect();
        assert_eq!(names, vec!["a/b", "c"]);
    }

    #[tokio::test]
    async fn unreachable_server_is_a_transport_error() {
        let api = NewRelicApi::new("http://127.0.0.1:1", KEY, ClientOptions::default()).unwrap();
        let err = assert_err!(api.fetch("/v2/applications.json", &[]).await);
        assert!(matches!(err, ExporterError::Transport(..)));
    }
}
