//! Columnar table output: JSON Lines or CSV in, gzip-compressed Parquet out.
//!
//! This module provides:
//! - [`write_table`] - infer a schema from a row-delimited source and stream
//!   it into a Parquet sink batch by batch
//! - [`read_table_rows`] - read a Parquet file back as JSON records
//! - [`describe_table`] - schema, row count, and row-group count from metadata
//!
//! Sources are opened through [`open_decompressed`], so `.jsonl.bz2` and
//! `.csv.gz` inputs need no separate decompression step. Schema inference runs
//! on every call and scans the whole source; nothing is cached between runs,
//! so fields added upstream simply appear as new nullable columns.
//!
//! # Type conflicts
//! JSON Lines input is rejected when one top-level field carries values of
//! different JSON kinds across rows (for example `"5"` in one row and `5` in
//! another). `null` is compatible with every kind, and integers and floats are
//! the same kind (the column becomes `Float64`). Rejection is deterministic and
//! happens before any output is produced.

use crate::error::{Error, Result};
use crate::io::compression::open_decompressed;
use crate::io::transcode::Record;
use arrow::datatypes::{Schema, SchemaRef};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::arrow_writer::ArrowWriter;
use parquet::basic::{Compression, GzipLevel};
use parquet::errors::ParquetError;
use parquet::file::properties::WriterProperties;
use serde_json::Value;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Lines, Read, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Rows per Parquet row group unless overridden.
pub const DEFAULT_MAX_ROW_GROUP_SIZE: usize = 10_000_000;

/// Rows decoded per Arrow batch unless overridden.
pub const DEFAULT_BATCH_SIZE: usize = 64 * 1024;

/// Row-delimited formats accepted by [`write_table`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableFormat {
    /// One JSON object per line.
    Jsonl,
    /// Comma-separated values with a header row.
    Csv,
}

/// Tuning knobs for [`write_table`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableOptions {
    /// Maximum rows per row group.
    pub max_row_group_size: usize,
    /// Rows decoded per Arrow batch; bounds decoder memory.
    pub batch_size: usize,
}

impl Default for TableOptions {
    fn default() -> Self {
        Self {
            max_row_group_size: DEFAULT_MAX_ROW_GROUP_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// Summary of a written table, read from Parquet metadata.
#[derive(Debug, Clone)]
pub struct TableSummary {
    pub schema: SchemaRef,
    pub rows: u64,
    pub row_groups: usize,
}

/// Infer a schema from `source` and write it to `sink` as Parquet.
///
/// The source is read twice: once to infer the schema (the union of fields
/// over every row), once to decode. Column chunks are gzip-compressed.
///
/// # Returns
/// Number of rows written.
///
/// # Errors
/// [`Error::MalformedInput`] if the source is empty, unparseable, or has
/// conflicting field types; [`Error::Filesystem`] on read or write failures.
/// On error the sink holds an incomplete file and must be discarded.
pub fn write_table<W: Write + Send>(
    source: impl AsRef<Path>,
    format: TableFormat,
    options: &TableOptions,
    sink: W,
) -> Result<u64> {
    let source = source.as_ref();
    let schema = Arc::new(match format {
        TableFormat::Jsonl => infer_jsonl_schema(source)?,
        TableFormat::Csv => infer_csv_schema(source)?,
    });
    if schema.fields().is_empty() {
        return Err(Error::malformed(source.display().to_string(), "no columns to write"));
    }
    debug!(source = %source.display(), columns = schema.fields().len(), "inferred table schema");

    let props = WriterProperties::builder()
        .set_compression(Compression::GZIP(GzipLevel::default()))
        .set_max_row_group_row_count(Some(options.max_row_group_size.max(1)))
        .build();
    let mut writer =
        ArrowWriter::try_new(sink, schema.clone(), Some(props)).map_err(parquet_error)?;

    let batches: Box<dyn Iterator<Item = std::result::Result<RecordBatch, ArrowError>>> =
        match format {
            TableFormat::Jsonl => Box::new(
                arrow::json::ReaderBuilder::new(schema)
                    .with_batch_size(options.batch_size.max(1))
                    .build(BufReader::new(open_decompressed(source)?))
                    .map_err(|e| arrow_error(source, e))?,
            ),
            TableFormat::Csv => Box::new(
                arrow::csv::ReaderBuilder::new(schema)
                    .with_format(csv_format())
                    .with_batch_size(options.batch_size.max(1))
                    .build(open_decompressed(source)?)
                    .map_err(|e| arrow_error(source, e))?,
            ),
        };

    let mut rows = 0u64;
    for batch in batches {
        let batch = batch.map_err(|e| arrow_error(source, e))?;
        rows += batch.num_rows() as u64;
        writer.write(&batch).map_err(parquet_error)?;
    }
    writer.close().map_err(parquet_error)?;
    Ok(rows)
}

/// Read every row of a Parquet file as a JSON record.
///
/// Null cells are omitted from the returned records.
///
/// # Errors
/// Returns an error if the file cannot be opened or decoded.
pub fn read_table_rows(path: impl AsRef<Path>) -> Result<Vec<Record>> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| Error::fs(path, e))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .and_then(|b| b.with_batch_size(DEFAULT_BATCH_SIZE).build())
        .map_err(|e| Error::malformed(path.display().to_string(), e))?;

    let mut out = arrow::json::ArrayWriter::new(Vec::new());
    for batch in reader {
        let batch = batch.map_err(|e| arrow_error(path, e))?;
        out.write(&batch).map_err(|e| arrow_error(path, e))?;
    }
    out.finish().map_err(|e| arrow_error(path, e))?;
    let buf = out.into_inner();
    if buf.is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_slice(&buf).map_err(|e| Error::malformed(path.display().to_string(), e))
}

/// Read schema, row count, and row-group count from a Parquet footer.
///
/// # Errors
/// Returns an error if the file cannot be opened or is not Parquet.
pub fn describe_table(path: impl AsRef<Path>) -> Result<TableSummary> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| Error::fs(path, e))?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)
        .map_err(|e| Error::malformed(path.display().to_string(), e))?;
    let meta = builder.metadata();
    let row_groups = meta.num_row_groups();
    let rows = (0..row_groups)
        .map(|i| meta.row_group(i).num_rows().max(0) as u64)
        .sum();
    Ok(TableSummary {
        schema: builder.schema().clone(),
        rows,
        row_groups,
    })
}

// ============================================================================
// Schema inference
// ============================================================================

fn infer_jsonl_schema(source: &Path) -> Result<Schema> {
    let reader = BufReader::new(open_decompressed(source)?);
    let mut rows = JsonlRows {
        source,
        lines: reader.lines(),
        line_no: 0,
        kinds: HashMap::new(),
        failure: None,
    };
    let inferred = arrow::json::reader::infer_json_schema_from_iterator(rows.by_ref());
    if let Some(e) = rows.failure {
        return Err(e);
    }
    if rows.line_no == 0 {
        return Err(Error::malformed(source.display().to_string(), "no rows to infer a schema from"));
    }
    inferred.map_err(|e| arrow_error(source, e))
}

fn csv_format() -> arrow::csv::reader::Format {
    arrow::csv::reader::Format::default().with_header(true)
}

fn infer_csv_schema(source: &Path) -> Result<Schema> {
    let (schema, records) = csv_format()
        .infer_schema(open_decompressed(source)?, None)
        .map_err(|e| arrow_error(source, e))?;
    if records == 0 {
        return Err(Error::malformed(source.display().to_string(), "no rows to infer a schema from"));
    }
    Ok(schema)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JsonKind {
    Bool,
    Number,
    String,
    Array,
    Object,
}

impl JsonKind {
    fn of(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Bool(_) => Some(Self::Bool),
            Value::Number(_) => Some(Self::Number),
            Value::String(_) => Some(Self::String),
            Value::Array(_) => Some(Self::Array),
            Value::Object(_) => Some(Self::Object),
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Bool => "boolean",
            Self::Number => "number",
            Self::String => "string",
            Self::Array => "array",
            Self::Object => "object",
        }
    }
}

/// Parsed JSONL rows for schema inference, checking field kinds as it goes.
///
/// The first error is parked in `failure` and iteration stops, so the caller
/// can report it with its real type rather than as an `ArrowError`.
struct JsonlRows<'a, R: Read> {
    source: &'a Path,
    lines: Lines<BufReader<R>>,
    line_no: u64,
    kinds: HashMap<String, JsonKind>,
    failure: Option<Error>,
}

impl<R: Read> JsonlRows<'_, R> {
    fn check(&mut self, value: &Value) -> Result<()> {
        let Value::Object(record) = value else {
            return Err(self.malformed("row is not a JSON object"));
        };
        for (field, v) in record {
            let Some(kind) = JsonKind::of(v) else {
                continue;
            };
            match self.kinds.get(field) {
                Some(&seen) if seen != kind => {
                    return Err(self.malformed(format!(
                        "field `{field}` is a {} here but a {} in an earlier row",
                        kind.label(),
                        seen.label()
                    )));
                }
                Some(_) => {}
                None => {
                    self.kinds.insert(field.clone(), kind);
                }
            }
        }
        Ok(())
    }

    fn malformed(&self, message: impl std::fmt::Display) -> Error {
        Error::malformed(format!("{} line {}", self.source.display(), self.line_no), message)
    }
}

impl<R: Read> Iterator for JsonlRows<'_, R> {
    type Item = std::result::Result<Value, ArrowError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failure.is_some() {
            return None;
        }
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => {
                    self.failure = Some(Error::fs(self.source, e));
                    return None;
                }
            };
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            let checked = serde_json::from_str::<Value>(&line)
                .map_err(|e| self.malformed(e))
                .and_then(|v| self.check(&v).map(|()| v));
            return match checked {
                Ok(v) => Some(Ok(v)),
                Err(e) => {
                    self.failure = Some(e);
                    None
                }
            };
        }
    }
}

// ============================================================================
// Error mapping
// ============================================================================

fn arrow_error(source: &Path, e: ArrowError) -> Error {
    match e {
        ArrowError::IoError(_, io) => Error::fs(source, io),
        other => Error::malformed(source.display().to_string(), other),
    }
}

fn parquet_error(e: ParquetError) -> Error {
    match e {
        ParquetError::ArrowError(msg) => Error::malformed("parquet encoding", msg),
        other => Error::fs("<table sink>", io::Error::other(other)),
    }
}
