//! Point sinks.
//!
//! [`InfluxSink`] writes points to the InfluxDB v2 HTTP API as line protocol,
//! one request per point. Write failures are reported to the caller, which
//! logs them and moves on; nothing is retried or buffered.

use crate::config::InfluxConfig;
use crate::error::AppResult;
use crate::point::Point;
use async_trait::async_trait;
use hyper::client::HttpConnector;
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::{Body, Client, Method, Request, Uri};
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, error};

/// Errors raised while writing points.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("Failed to build request: {0}")]
    Request(#[from] hyper::http::Error),

    #[error("Write rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Invalid URI '{0}'")]
    InvalidUri(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
}

/// What a sink did with an accepted point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Stored by the backend
    Written,
    /// Nothing to store, no request was made
    Skipped,
}

/// Destination for assembled points.
#[async_trait]
pub trait PointSink: Send + Sync {
    /// Write one point.
    async fn write(&self, point: &Point) -> Result<WriteOutcome, SinkError>;
}

/// Write `point` and log the outcome. Returns `None` when the write failed.
pub async fn write_logged(sink: &dyn PointSink, point: &Point) -> Option<WriteOutcome> {
    match sink.write(point).await {
        Ok(WriteOutcome::Written) => {
            debug!(measurement = point.measurement(), "Point written");
            Some(WriteOutcome::Written)
        }
        Ok(WriteOutcome::Skipped) => {
            debug!(measurement = point.measurement(), "Point skipped, no fields");
            Some(WriteOutcome::Skipped)
        }
        Err(e) => {
            error!(
                measurement = point.measurement(),
                error = %e,
                "Failed to write point"
            );
            None
        }
    }
}

/// InfluxDB v2 line protocol writer.
#[derive(Clone)]
pub struct InfluxSink {
    client: Client<HttpConnector>,
    write_uri: Uri,
    ping_uri: Uri,
    auth: String,
    timeout: Duration,
}

impl InfluxSink {
    /// Build a sink for the configured server. No connection is made yet.
    ///
    /// Fails on an invalid timeout or a host that does not form a valid URI.
    pub fn new(config: &InfluxConfig) -> AppResult<Self> {
        let base = config.base_url();
        let write = format!(
            "{base}/api/v2/write?org={}&bucket={}&precision=ns",
            encode_query_value(&config.org),
            encode_query_value(&config.bucket)
        );
        let ping = format!("{base}/ping");

        Ok(Self {
            client: Client::new(),
            write_uri: write.parse().map_err(|_| SinkError::InvalidUri(write))?,
            ping_uri: ping.parse().map_err(|_| SinkError::InvalidUri(ping))?,
            auth: format!("Token {}", config.token),
            timeout: config.timeout()?,
        })
    }

    /// URI points are posted to.
    pub fn write_uri(&self) -> &Uri {
        &self.write_uri
    }

    /// Check that the server answers `GET /ping`.
    pub async fn ping(&self) -> Result<(), SinkError> {
        let request = Request::builder()
            .method(Method::GET)
            .uri(self.ping_uri.clone())
            .body(Body::empty())?;
        self.send(request).await
    }

    async fn send(&self, request: Request<Body>) -> Result<(), SinkError> {
        let response = timeout(self.timeout, self.client.request(request))
            .await
            .map_err(|_| SinkError::Timeout(self.timeout))??;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = hyper::body::to_bytes(response.into_body()).await?;
        Err(SinkError::Rejected {
            status: status.as_u16(),
            body: String::from_utf8_lossy(&body).trim().to_string(),
        })
    }
}

#[async_trait]
impl PointSink for InfluxSink {
    async fn write(&self, point: &Point) -> Result<WriteOutcome, SinkError> {
        let line = point.to_line_protocol();
        if line.is_empty() {
            // InfluxDB rejects points without fields
            return Ok(WriteOutcome::Skipped);
        }

        let request = Request::builder()
            .method(Method::POST)
            .uri(self.write_uri.clone())
            .header(AUTHORIZATION, &self.auth)
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(Body::from(line))?;
        self.send(request).await?;
        Ok(WriteOutcome::Written)
    }
}

impl std::fmt::Debug for InfluxSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InfluxSink")
            .field("write_uri", &self.write_uri)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Percent-encode a query parameter value.
fn encode_query_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(char::from(byte));
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DaqError;
    use tracing_test::traced_test;

    fn influx_config() -> InfluxConfig {
        InfluxConfig {
            host: "localhost".to_string(),
            port: 8086,
            token: "secret".to_string(),
            org: "my org".to_string(),
            bucket: "lambda/raw".to_string(),
            timeout_secs: 1.0,
        }
    }

    #[test]
    fn builds_write_uri_with_encoded_query() {
        let sink = InfluxSink::new(&influx_config()).unwrap();
        assert_eq!(
            sink.write_uri().to_string(),
            "http://localhost:8086/api/v2/write?org=my%20org&bucket=lambda%2Fraw&precision=ns"
        );
    }

    #[test]
    fn rejects_unparseable_host() {
        let mut cfg = influx_config();
        cfg.host = "bad host".to_string();
        assert!(matches!(
            InfluxSink::new(&cfg),
            Err(DaqError::Sink(SinkError::InvalidUri(_)))
        ));
    }

    #[test]
    fn rejects_oversized_timeout() {
        let mut cfg = influx_config();
        cfg.timeout_secs = 1e20;
        assert!(matches!(
            InfluxSink::new(&cfg),
            Err(DaqError::Configuration(_))
        ));
    }

    #[test]
    fn encodes_query_values() {
        assert_eq!(encode_query_value("home"), "home");
        assert_eq!(encode_query_value("a&b=c"), "a%26b%3Dc");
    }

    #[traced_test]
    #[tokio::test]
    async fn empty_point_is_skipped_without_request() {
        // Nothing listens on this port; a request would fail
        let mut cfg = influx_config();
        cfg.port = 9;
        let sink = InfluxSink::new(&cfg).unwrap();
        let point = Point::new("heat_pump").tag("mode", "DHW");

        assert_eq!(sink.write(&point).await.unwrap(), WriteOutcome::Skipped);
        assert_eq!(
            write_logged(&sink, &point).await,
            Some(WriteOutcome::Skipped)
        );
        assert!(logs_contain("Point skipped, no fields"));
        assert!(!logs_contain("Point written"));
    }

    #[tokio::test]
    async fn unreachable_server_is_reported() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut cfg = influx_config();
        cfg.host = "127.0.0.1".to_string();
        cfg.port = port;
        let sink = InfluxSink::new(&cfg).unwrap();
        let point = Point::new("heat_pump").field("temp", 21.5);
        assert!(sink.write(&point).await.is_err());
        assert_eq!(write_logged(&sink, &point).await, None);
    }
}
