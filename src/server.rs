//! Request routing for the metrics server.

use std::convert::Infallible;
use std::sync::Arc;

use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Body, Method, Request, Response, StatusCode};
use tracing::error;

use crate::exporter::Exporter;

/// Static landing page linking to the metrics path.
pub fn index_page(metrics_path: &str) -> String {
    format!(
        "<html>\n\
         <head><title>NewRelic exporter</title></head>\n\
         <body>\n\
         <h1>NewRelic exporter</h1>\n\
         <p><a href='{}'>Metrics</a></p>\n\
         </body>\n\
         </html>\n",
        htmlescape::encode_attribute(metrics_path)
    )
}

fn with_status(status: StatusCode, body: Body) -> Response<Body> {
    let mut resp = Response::new(body);
    *resp.status_mut() = status;
    resp
}

pub async fn handle(
    req: Request<Body>,
    exporter: Arc<Exporter>,
    metrics_path: Arc<str>,
) -> Result<Response<Body>, Infallible> {
    if req.method() != Method::GET {
        return Ok(with_status(StatusCode::METHOD_NOT_ALLOWED, Body::empty()));
    }

    let path = req.uri().path().to_string();
    let resp = if path == *metrics_path {
        match exporter.render().await {
            Ok(text) => {
                // Prometheus rejects scrapes without the versioned content type.
                let mut resp = Response::new(Body::from(text));
                resp.headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_static(prometheus::TEXT_FORMAT));
                resp
            }
            Err(e) => {
                error!(error = %e, "Failed to encode metrics");
                with_status(StatusCode::INTERNAL_SERVER_ERROR, Body::from(e.to_string()))
            }
        }
    } else if path == "/" {
        let mut resp = Response::new(Body::from(index_page(&metrics_path)));
        resp.headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8"));
        resp
    } else if path == "/healthz" {
        Response::new(Body::from("OK"))
    } else {
        with_status(StatusCode::NOT_FOUND, Body::empty())
    };

    Ok(resp)
}
