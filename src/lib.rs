//! # dataset-sync
//!
//! Fetch public-health datasets from remote APIs, convert them to Parquet, and
//! deposit versioned, compressed artifacts in a directory tree that a separate
//! process bulk-syncs to remote storage.
//!
//! ## Key Features
//!
//! - **Streaming transcoding** - multi-gigabyte JSON reports become JSON Lines
//!   one record at a time, each stamped with `downloadedAt`
//! - **Columnar output** - schema-inferred, gzip-compressed Parquet with large
//!   row groups
//! - **Archival compression** - bzip2 at maximum ratio, read back transparently
//! - **Crash-safe placement** - artifacts reach the sync root only once
//!   complete, and are never overwritten
//! - **Failure isolation** - one failing dataset never stops the others
//!
//! ## Quick Start
//!
//! ```no_run
//! use dataset_sync::*;
//! # fn main() -> anyhow::Result<()> {
//! let endpoints = EndpointTable::default().bioportal_endpoints()?;
//! let fetcher = HttpFetcher::new(fetch::DEFAULT_DOWNLOAD_TIMEOUT)?;
//! let pipeline = PortalPipeline::new(fetcher, PipelineConfig::new("/srv/sync"));
//!
//! let report = pipeline.run_all(&endpoints, ExecMode::Sequential);
//! report.into_result()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Output Layout
//!
//! Portal datasets:
//! ```text
//! sync_root/orders-basic/json_v1/orders-basic_20220301T000000.json.bz2
//! sync_root/orders-basic/jsonl_v1/orders-basic_20220301T000000.jsonl.bz2
//! sync_root/orders-basic/parquet_v1/orders-basic_20220301T000000.parquet
//! ```
//!
//! Open-data datasets:
//! ```text
//! sync_root/HHS/estimated_icu/v2/csv/estimated_icu_20220301T000000.csv.bz2
//! sync_root/HHS/estimated_icu/v2/parquet/estimated_icu_20220301T000000.parquet
//! ```
//!
//! ## Module Overview
//!
//! - [`io`] - transcoding, compression, and Parquet writing
//! - [`endpoint`] - endpoint descriptors and artifact naming
//! - [`layout`] - destination directories under the sync root
//! - [`fetch`] - HTTP and open-data platform capabilities
//! - [`pipeline`] - the per-dataset orchestrators
//! - [`config`] - endpoint tables, app tokens, pipeline settings
//! - [`testing`] - in-memory fakes for tests
//!
//! ## Feature Flags
//!
//! - `compression-gzip` - read and write `.gz` streams
//! - `parallel-io` - [`ExecMode::Parallel`] fan-out across datasets

pub mod config;
pub mod endpoint;
pub mod error;
pub mod fetch;
pub mod io;
pub mod layout;
pub mod pipeline;
pub mod testing;

pub use config::{EndpointTable, OpenDataSource, OpenDataset, PipelineConfig, Retention};
pub use endpoint::{Endpoint, EndpointSpec, filename_stamp, record_stamp};
pub use error::{Error, Result, Stage};
pub use fetch::{DatasetMetadata, HttpFetcher, OpenDataClient, RawFetcher, SocrataClient};
pub use io::compression::{auto_detect_reader, auto_detect_writer, compress_file};
pub use io::parquet::{TableFormat, TableOptions, read_table_rows, write_table};
pub use io::transcode::{Record, RecordShape, for_each_record, transcode};
pub use layout::{DirScheme, Layout};
pub use pipeline::{BatchReport, ExecMode, OpenDataPipeline, PortalPipeline, RunReport, RunState};
