//! Remote data capabilities.
//!
//! The pipelines never talk to HTTP directly; they depend on two traits:
//!
//! - [`RawFetcher`] - stream the body of a `GET` into a sink
//! - [`OpenDataClient`] - the two open-data platform calls the HHS pipeline
//!   needs: dataset metadata and the full rows export as CSV
//!
//! [`HttpFetcher`] and [`SocrataClient`] are the blocking `reqwest`
//! implementations. In-memory fakes live in [`crate::testing`].

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use reqwest::Url;
use reqwest::blocking::{Client, Response};
use serde::Deserialize;
use std::io::{Read, Write};
use std::time::Duration;
use tracing::{debug, info};

/// Bytes per body chunk copied from the network to the sink.
pub const DOWNLOAD_CHUNK_BYTES: usize = 1 << 20;

/// Default request timeout for portal downloads.
pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Default request timeout for open-data platform calls.
pub const DEFAULT_OPEN_DATA_TIMEOUT: Duration = Duration::from_secs(60);

const USER_AGENT: &str = concat!("dataset-sync/", env!("CARGO_PKG_VERSION"));

/// Fetch a URL and stream its body.
pub trait RawFetcher: Send + Sync {
    /// `GET url`, writing the (decoded) body into `sink`.
    ///
    /// # Returns
    /// Number of body bytes written.
    ///
    /// # Errors
    /// [`Error::Transport`] on connection failures or non-success statuses;
    /// [`Error::Filesystem`] if writing to `sink` fails.
    fn fetch(&self, url: &Url, sink: &mut dyn Write) -> Result<u64>;
}

/// Metadata returned by the open-data platform for one dataset.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetMetadata {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Unix seconds of the last upstream row change.
    pub rows_updated_at: i64,
}

impl DatasetMetadata {
    /// `rows_updated_at` as a UTC instant.
    ///
    /// # Errors
    /// [`Error::MalformedInput`] if the timestamp is out of range.
    pub fn rows_updated(&self) -> Result<DateTime<Utc>> {
        DateTime::from_timestamp(self.rows_updated_at, 0).ok_or_else(|| {
            Error::malformed(
                format!("metadata for {}", self.id),
                format!("rowsUpdatedAt {} out of range", self.rows_updated_at),
            )
        })
    }
}

/// The open-data platform operations used by the HHS pipeline.
pub trait OpenDataClient: Send + Sync {
    /// Platform metadata for `dataset_id`.
    ///
    /// # Errors
    /// [`Error::Transport`] on request failure, [`Error::MalformedInput`] if
    /// the response is not the expected JSON.
    fn get_metadata(&self, dataset_id: &str) -> Result<DatasetMetadata>;

    /// Stream every row of `dataset_id` as CSV (with header) into `sink`.
    ///
    /// # Errors
    /// As for [`RawFetcher::fetch`].
    fn fetch_rows_as_csv(&self, dataset_id: &str, sink: &mut dyn Write) -> Result<u64>;
}

/// Blocking HTTP fetcher.
///
/// Requests advertise `Accept-Encoding: gzip`; `reqwest` decodes the body
/// transparently, so the sink always receives the plain payload.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    /// # Errors
    /// [`Error::Configuration`] if the HTTP client cannot be built.
    pub fn new(timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout, None)?,
        })
    }
}

impl RawFetcher for HttpFetcher {
    fn fetch(&self, url: &Url, sink: &mut dyn Write) -> Result<u64> {
        info!(%url, "downloading");
        let response = self
            .client
            .get(url.clone())
            .send()
            .map_err(|e| Error::transport(url.as_str(), e))?;
        stream_body(response, url, sink)
    }
}

/// Blocking client for Socrata-style open-data platforms.
#[derive(Debug, Clone)]
pub struct SocrataClient {
    domain: String,
    client: Client,
}

impl SocrataClient {
    /// Client for `domain` (e.g. `data.cdc.gov`), sending `app_token` as
    /// `X-App-Token` when present.
    ///
    /// # Errors
    /// [`Error::Configuration`] if the HTTP client cannot be built.
    pub fn new(domain: impl Into<String>, app_token: Option<&str>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            domain: domain.into(),
            client: build_client(timeout, app_token)?,
        })
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    fn url(&self, path: &str) -> Result<Url> {
        Url::parse(&format!("https://{}/{path}", self.domain))
            .map_err(|e| Error::Configuration(format!("open-data domain {:?}: {e}", self.domain)))
    }
}

impl OpenDataClient for SocrataClient {
    fn get_metadata(&self, dataset_id: &str) -> Result<DatasetMetadata> {
        let url = self.url(&format!("api/views/{dataset_id}.json"))?;
        debug!(%url, "fetching metadata");
        let response = self
            .client
            .get(url.clone())
            .send()
            .map_err(|e| Error::transport(url.as_str(), e))?;
        let response = check_status(response, &url)?;
        let body = response.text().map_err(|e| Error::transport(url.as_str(), e))?;
        serde_json::from_str(&body).map_err(|e| Error::malformed(format!("metadata from {url}"), e))
    }

    fn fetch_rows_as_csv(&self, dataset_id: &str, sink: &mut dyn Write) -> Result<u64> {
        let url = self.url(&format!("api/views/{dataset_id}/rows.csv?accessType=DOWNLOAD"))?;
        info!(%url, "downloading rows");
        let response = self
            .client
            .get(url.clone())
            .send()
            .map_err(|e| Error::transport(url.as_str(), e))?;
        stream_body(response, &url, sink)
    }
}

fn build_client(timeout: Duration, app_token: Option<&str>) -> Result<Client> {
    let mut headers = reqwest::header::HeaderMap::new();
    if let Some(token) = app_token {
        let value = reqwest::header::HeaderValue::from_str(token)
            .map_err(|e| Error::Configuration(format!("app token is not a valid header value: {e}")))?;
        headers.insert("X-App-Token", value);
    }
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .gzip(true)
        .default_headers(headers)
        .build()
        .map_err(|e| Error::Configuration(format!("HTTP client: {e}")))
}

fn check_status(response: Response, url: &Url) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(Error::transport(url.as_str(), format!("HTTP {status}")))
    }
}

/// Copy a response body to `sink` in large chunks, keeping network and
/// sink failures distinguishable.
fn stream_body(response: Response, url: &Url, sink: &mut dyn Write) -> Result<u64> {
    let mut response = check_status(response, url)?;
    let mut buf = vec![0u8; DOWNLOAD_CHUNK_BYTES];
    let mut total = 0u64;
    loop {
        let n = match response.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::transport(url.as_str(), e)),
        };
        sink.write_all(&buf[..n])
            .map_err(|e| Error::fs("<download sink>", e))?;
        total += n as u64;
    }
    debug!(%url, bytes = total, "download complete");
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_parses_rows_updated_at() {
        let meta: DatasetMetadata =
            serde_json::from_str(r#"{"id":"g62h-syeh","name":"x","rowsUpdatedAt":1646092800,"other":1}"#)
                .unwrap();
        assert_eq!(meta.rows_updated().unwrap().to_rfc3339(), "2022-03-01T00:00:00+00:00");
    }

    #[test]
    fn socrata_urls() {
        let client = SocrataClient::new("data.cdc.gov", None, DEFAULT_OPEN_DATA_TIMEOUT).unwrap();
        assert_eq!(
            client.url("api/views/unsk-b7fc.json").unwrap().as_str(),
            "https://data.cdc.gov/api/views/unsk-b7fc.json"
        );
    }
}
