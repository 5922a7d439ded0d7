//! Buffered HTTP(S) fetcher with progress reporting

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::debug;

use crate::config::WorkerConfig;
use crate::error::{Result, WorkerError};

/// Upper bound on the up-front buffer reservation
const MAX_PREALLOC: u64 = 64 * 1024 * 1024;

/// A fully buffered response body
#[derive(Debug, Clone)]
pub struct Fetched {
    pub data: Bytes,
    /// Content-Type header, empty when absent
    pub content_type: String,
    pub size: u64,
}

/// HTTP client shared by the workers
#[derive(Clone)]
pub struct Fetcher {
    http_client: Client,
    lookup_timeout: Duration,
}

impl Fetcher {
    /// Create a new fetcher
    pub fn new(config: &WorkerConfig) -> Result<Self> {
        let http_client = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| WorkerError::RequestError {
                url: String::new(),
                source: e,
            })?;

        Ok(Self {
            http_client,
            lookup_timeout: config.lookup_timeout(),
        })
    }

    /// Underlying client, for callers issuing their own requests
    pub fn client(&self) -> &Client {
        &self.http_client
    }

    pub fn lookup_timeout(&self) -> Duration {
        self.lookup_timeout
    }

    /// GET a URL into memory
    pub async fn fetch(&self, url: &str) -> Result<Fetched> {
        self.fetch_with_progress(url, |_| {}).await
    }

    /// GET a URL into memory, reporting percent complete per chunk
    ///
    /// Progress is only reported when the response carries a content-length.
    pub async fn fetch_with_progress<F>(&self, url: &str, mut on_progress: F) -> Result<Fetched>
    where
        F: FnMut(f64) + Send,
    {
        check_scheme(url)?;
        debug!("Fetching {}", url);

        let response = self
            .http_client
            .get(url)
            .send()
            .await
            .map_err(|e| WorkerError::transport(url, e))?;

        let status = response.status();
        if status != StatusCode::OK {
            // Drain the body so the connection is released
            let _ = response.bytes().await;
            return Err(WorkerError::RequestFailed {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let content_type = header_content_type(&response);
        let total = response.content_length().unwrap_or(0);

        let mut buffer = BytesMut::with_capacity(total.min(MAX_PREALLOC) as usize);
        let mut received: u64 = 0;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| WorkerError::transport(url, e))?;
            received += chunk.len() as u64;
            buffer.extend_from_slice(&chunk);

            if total > 0 {
                on_progress(received as f64 / total as f64 * 100.0);
            }
        }

        debug!("Fetched {} bytes ({}) from {}", received, content_type, url);

        Ok(Fetched {
            data: buffer.freeze(),
            content_type,
            size: received,
        })
    }

    /// Content type of a URL via HEAD; empty string on any failure
    pub async fn content_type(&self, url: &str) -> String {
        match self.head_content_type(url).await {
            Ok(content_type) => content_type,
            Err(e) => {
                debug!("Content-type lookup failed for {}: {}", url, e);
                String::new()
            }
        }
    }

    async fn head_content_type(&self, url: &str) -> Result<String> {
        check_scheme(url)?;

        let response = self
            .http_client
            .head(url)
            .timeout(self.lookup_timeout)
            .send()
            .await
            .map_err(|e| WorkerError::transport(url, e))?;

        if !response.status().is_success() {
            return Err(WorkerError::RequestFailed {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        Ok(header_content_type(&response))
    }
}

fn header_content_type(response: &reqwest::Response) -> String {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

/// Only plaintext and TLS HTTP are supported
fn check_scheme(url: &str) -> Result<()> {
    match url::Url::parse(url) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(()),
        _ => Err(WorkerError::UnsupportedUrl(url.to_string())),
    }
}
