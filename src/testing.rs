//! In-memory fakes for testing pipelines without a network.
//!
//! - [`FakeFetcher`] serves canned bodies or HTTP statuses per URL
//! - [`FakeOpenDataClient`] serves canned metadata and CSV exports per dataset
//!
//! Both record the requests they receive so tests can assert on ordering.
//!
//! # Example
//!
//! ```no_run
//! use dataset_sync::testing::FakeFetcher;
//!
//! let fetcher = FakeFetcher::new()
//!     .with_body("https://example.org/ok", r#"[{"a":1}]"#)
//!     .with_status("https://example.org/broken", 500);
//! ```

use crate::error::{Error, Result};
use crate::fetch::{DatasetMetadata, OpenDataClient, RawFetcher};
use reqwest::Url;
use std::collections::HashMap;
use std::io::Write;
use std::sync::Mutex;

/// A canned response.
#[derive(Debug, Clone)]
pub enum FakeResponse {
    /// 200 with this body.
    Body(Vec<u8>),
    /// Non-success status; no body is written.
    Status(u16),
}

impl FakeResponse {
    fn serve(&self, url: &str, sink: &mut dyn Write) -> Result<u64> {
        match self {
            Self::Body(body) => {
                sink.write_all(body)
                    .map_err(|e| Error::fs("<download sink>", e))?;
                Ok(body.len() as u64)
            }
            Self::Status(status) => Err(Error::transport(url, format!("HTTP {status}"))),
        }
    }
}

/// [`RawFetcher`] backed by a URL → response map.
///
/// Unknown URLs fail with a transport error, like an unreachable host.
#[derive(Debug, Default)]
pub struct FakeFetcher {
    responses: HashMap<String, FakeResponse>,
    requests: Mutex<Vec<String>>,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_body(mut self, url: &str, body: impl Into<Vec<u8>>) -> Self {
        self.responses
            .insert(normalize(url), FakeResponse::Body(body.into()));
        self
    }

    #[must_use]
    pub fn with_status(mut self, url: &str, status: u16) -> Self {
        self.responses
            .insert(normalize(url), FakeResponse::Status(status));
        self
    }

    /// URLs requested so far, in order.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl RawFetcher for FakeFetcher {
    fn fetch(&self, url: &Url, sink: &mut dyn Write) -> Result<u64> {
        if let Ok(mut log) = self.requests.lock() {
            log.push(url.to_string());
        }
        match self.responses.get(url.as_str()) {
            Some(response) => response.serve(url.as_str(), sink),
            None => Err(Error::transport(url.as_str(), "connection refused")),
        }
    }
}

/// [`OpenDataClient`] backed by a dataset id → (metadata, CSV) map.
#[derive(Debug, Default)]
pub struct FakeOpenDataClient {
    datasets: HashMap<String, (DatasetMetadata, FakeResponse)>,
    requests: Mutex<Vec<String>>,
}

impl FakeOpenDataClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `csv` for `id`, reporting `rows_updated_at` (unix seconds).
    #[must_use]
    pub fn with_csv(mut self, id: &str, rows_updated_at: i64, csv: impl Into<Vec<u8>>) -> Self {
        self.datasets.insert(
            id.to_string(),
            (metadata(id, rows_updated_at), FakeResponse::Body(csv.into())),
        );
        self
    }

    /// Metadata succeeds but the rows export fails with `status`.
    #[must_use]
    pub fn with_export_status(mut self, id: &str, rows_updated_at: i64, status: u16) -> Self {
        self.datasets.insert(
            id.to_string(),
            (metadata(id, rows_updated_at), FakeResponse::Status(status)),
        );
        self
    }

    /// Calls made so far, as `metadata:{id}` / `rows:{id}`.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    fn log(&self, entry: String) {
        if let Ok(mut log) = self.requests.lock() {
            log.push(entry);
        }
    }
}

impl OpenDataClient for FakeOpenDataClient {
    fn get_metadata(&self, dataset_id: &str) -> Result<DatasetMetadata> {
        self.log(format!("metadata:{dataset_id}"));
        self.datasets
            .get(dataset_id)
            .map(|(meta, _)| meta.clone())
            .ok_or_else(|| Error::transport(format!("fake://{dataset_id}"), "HTTP 404 Not Found"))
    }

    fn fetch_rows_as_csv(&self, dataset_id: &str, sink: &mut dyn Write) -> Result<u64> {
        self.log(format!("rows:{dataset_id}"));
        let url = format!("fake://{dataset_id}/rows.csv");
        match self.datasets.get(dataset_id) {
            Some((_, response)) => response.serve(&url, sink),
            None => Err(Error::transport(url, "HTTP 404 Not Found")),
        }
    }
}

fn metadata(id: &str, rows_updated_at: i64) -> DatasetMetadata {
    DatasetMetadata {
        id: id.to_string(),
        name: None,
        rows_updated_at,
    }
}

/// Keys are stored in the same canonical form `Url` renders.
fn normalize(url: &str) -> String {
    Url::parse(url).map_or_else(|_| url.to_string(), |u| u.to_string())
}
