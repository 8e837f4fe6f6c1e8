// SPDX-License-Identifier: Apache-2.0

use crate::insights::config::InsightsConfig;
use crate::insights::envelope::Envelope;
use crate::insights::tls;
use async_trait::async_trait;
use bytes::Bytes;
use flate2::read::GzEncoder;
use flate2::Compression;
use http::header::{CONTENT_ENCODING, CONTENT_TYPE};
use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use std::io::Read;
use std::time::Duration;
use tokio::time::timeout;

const CONTENT_TYPE_JSON_STREAM: &str = "application/x-json-stream";
const API_KEY_HEADER: &str = "x-api-key";

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("failed to send event - {status} - {body}")]
    Status { status: StatusCode, body: String },

    #[error("request timed out")]
    Timeout,

    #[error("http error: {0}")]
    Http(String),

    #[error("failed to encode envelope batch: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Delivery seam between the worker's batching state machine and the wire.
/// One implementation talks HTTP; tests substitute their own.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Attempts one delivery of the given batch. Any error is recoverable
    /// from the worker's point of view; retry/drop policy lives there.
    async fn post_batch(&self, batch: &[Envelope]) -> Result<(), DeliveryError>;
}

pub struct HttpTransport {
    client: HyperClient<HttpsConnector<HttpConnector>, Full<Bytes>>,
    endpoint: String,
    instrumentation_key: String,
    gzip: Option<Compression>,
    send_timeout: Duration,
}

impl HttpTransport {
    pub fn new(config: &InsightsConfig) -> Result<Self, DeliveryError> {
        let client_config = tls::client_config(config.insecure_skip_verify)
            .map_err(|e| DeliveryError::Http(e.to_string()))?;

        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(client_config)
            .https_or_http()
            .enable_http1()
            .build();

        let client = hyper_util::client::legacy::Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(30))
            .timer(TokioTimer::new())
            .build::<_, Full<Bytes>>(https);

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            instrumentation_key: config.instrumentation_key.clone(),
            gzip: config.gzip.then(|| Compression::new(config.gzip_level)),
            send_timeout: config.send_timeout,
        })
    }

    /// Preflight probe: one OPTIONS request against the endpoint. Used at
    /// worker construction to fail session setup early when the remote is
    /// unreachable.
    pub async fn verify_connection(&self) -> Result<(), DeliveryError> {
        let request = Request::builder()
            .method(Method::OPTIONS)
            .uri(self.endpoint.as_str())
            .body(Full::new(Bytes::new()))
            .map_err(|e| DeliveryError::Http(e.to_string()))?;

        let response = timeout(self.send_timeout, self.client.request(request))
            .await
            .map_err(|_| DeliveryError::Timeout)?
            .map_err(|e| DeliveryError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = read_body_text(response.into_body()).await;
            return Err(DeliveryError::Status { status, body });
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post_batch(&self, batch: &[Envelope]) -> Result<(), DeliveryError> {
        if batch.is_empty() {
            return Ok(());
        }

        let body = encode_body(batch, self.gzip)?;

        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(self.endpoint.as_str())
            .header(CONTENT_TYPE, CONTENT_TYPE_JSON_STREAM)
            .header(API_KEY_HEADER, self.instrumentation_key.as_str());
        if self.gzip.is_some() {
            builder = builder.header(CONTENT_ENCODING, "gzip");
        }
        let request = builder
            .body(Full::new(body))
            .map_err(|e| DeliveryError::Http(e.to_string()))?;

        let response = timeout(self.send_timeout, self.client.request(request))
            .await
            .map_err(|_| DeliveryError::Timeout)?
            .map_err(|e| DeliveryError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = read_body_text(response.into_body()).await;
            return Err(DeliveryError::Status { status, body });
        }
        Ok(())
    }
}

/// Serializes each envelope to JSON and joins them with newlines, piping the
/// result through gzip at the configured level when compression is enabled.
fn encode_body(batch: &[Envelope], gzip: Option<Compression>) -> Result<Bytes, DeliveryError> {
    let mut raw = Vec::new();
    for (i, envelope) in batch.iter().enumerate() {
        if i > 0 {
            raw.push(b'\n');
        }
        serde_json::to_writer(&mut raw, envelope)?;
    }

    match gzip {
        None => Ok(Bytes::from(raw)),
        Some(level) => {
            let mut compressed = Vec::new();
            let mut encoder = GzEncoder::new(&raw[..], level);
            encoder.read_to_end(&mut compressed)?;
            Ok(Bytes::from(compressed))
        }
    }
}

async fn read_body_text(body: hyper::body::Incoming) -> String {
    match body.collect().await {
        Ok(collected) => String::from_utf8_lossy(&collected.to_bytes()).into_owned(),
        Err(e) => format!("<failed to read response body: {}>", e),
    }
}
