//! Streaming JSON → JSON Lines transcoding.
//!
//! Raw downloads arrive as one large JSON document, either a bare array of
//! records or an object whose `item` member holds that array. This module
//! walks the document with a `serde` visitor so each array element is
//! deserialized, handed to the consumer, and dropped before the next one is
//! parsed: memory stays bounded by one record regardless of dataset size.
//!
//! - [`for_each_record`] exposes the records as a one-shot, forward-only
//!   sequence.
//! - [`transcode`] stamps each record with `downloadedAt` and writes it as one
//!   compact JSON line.
//!
//! # Malformed input
//! Anything that is not strict JSON fails the whole call: `NaN`/`Infinity`
//! tokens, numeric literals overflowing `f64`, non-object array elements,
//! trailing garbage, or a missing `item` member.

use crate::endpoint::record_stamp;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::de::{self, DeserializeSeed, IgnoredAny, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::io::{self, BufReader, Read, Write};

/// One row of a dataset.
pub type Record = Map<String, Value>;

/// Member holding the record array in object-shaped payloads.
pub const ITEM_KEY: &str = "item";

/// Field injected into every transcoded record.
pub const DOWNLOADED_AT_FIELD: &str = "downloadedAt";

/// Where the record array lives in a raw payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecordShape {
    /// `[ {..}, {..} ]`
    #[default]
    Array,
    /// `{ "item": [ {..}, {..} ], ... }`
    ItemMember,
}

/// Return `record` with `downloadedAt` set to `stamp`, replacing any prior value.
pub fn stamp_record(mut record: Record, stamp: &str) -> Record {
    record.insert(DOWNLOADED_AT_FIELD.to_string(), Value::String(stamp.to_string()));
    record
}

/// Feed every record of a raw payload to `f`, in document order.
///
/// Parsing stops at the first error, whether from the input or from `f`;
/// an error returned by `f` is passed through unchanged.
///
/// # Returns
/// The number of records consumed.
///
/// # Errors
/// [`Error::MalformedInput`] for invalid documents,
/// [`Error::Filesystem`] if reading the stream fails, or whatever `f` returns.
pub fn for_each_record<R, F>(reader: R, shape: RecordShape, f: F) -> Result<u64>
where
    R: Read,
    F: FnMut(Record) -> Result<()>,
{
    let mut de = serde_json::Deserializer::from_reader(BufReader::new(reader));
    let mut sink = RecordSink {
        consume: f,
        count: 0,
        failure: None,
    };
    let parsed = match shape {
        RecordShape::Array => ArraySeed(&mut sink).deserialize(&mut de),
        RecordShape::ItemMember => ItemSeed(&mut sink).deserialize(&mut de),
    }
    .and_then(|()| de.end());

    match (parsed, sink.failure) {
        (_, Some(consumer_err)) => Err(consumer_err),
        (Err(e), None) => Err(input_error(e)),
        (Ok(()), None) => Ok(sink.count),
    }
}

/// Transcode a raw payload to JSON Lines, stamping each record.
///
/// Every record gets `downloadedAt` rendered with [`record_stamp`], is
/// serialized compactly, and is written followed by `\n` as soon as it is
/// parsed. The writer is not flushed or finished.
///
/// # Returns
/// The number of lines written.
///
/// # Errors
/// See [`for_each_record`]; write failures surface as [`Error::Filesystem`].
pub fn transcode<R: Read, W: Write>(
    reader: R,
    shape: RecordShape,
    downloaded_at: DateTime<Utc>,
    mut writer: W,
) -> Result<u64> {
    let stamp = record_stamp(downloaded_at);
    for_each_record(reader, shape, |record| {
        let record = stamp_record(record, &stamp);
        serde_json::to_writer(&mut writer, &record).map_err(output_error)?;
        writer
            .write_all(b"\n")
            .map_err(|e| Error::fs("<output stream>", e))
    })
}

fn input_error(e: serde_json::Error) -> Error {
    if e.is_io() {
        Error::fs("<input stream>", io::Error::from(e))
    } else {
        Error::malformed("raw JSON payload", e)
    }
}

fn output_error(e: serde_json::Error) -> Error {
    if e.is_io() {
        Error::fs("<output stream>", io::Error::from(e))
    } else {
        Error::malformed("serialize record", e)
    }
}

struct RecordSink<F> {
    consume: F,
    count: u64,
    failure: Option<Error>,
}

struct ArraySeed<'s, F>(&'s mut RecordSink<F>);

impl<'de, F> DeserializeSeed<'de> for ArraySeed<'_, F>
where
    F: FnMut(Record) -> Result<()>,
{
    type Value = ();

    fn deserialize<D>(self, deserializer: D) -> std::result::Result<(), D::Error>
    where
        D: de::Deserializer<'de>,
    {
        deserializer.deserialize_seq(self)
    }
}

impl<'de, F> Visitor<'de> for ArraySeed<'_, F>
where
    F: FnMut(Record) -> Result<()>,
{
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a JSON array of record objects")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<(), A::Error> {
        while let Some(record) = seq.next_element::<Record>()? {
            if let Err(e) = (self.0.consume)(record) {
                self.0.failure = Some(e);
                return Err(de::Error::custom("record consumer failed"));
            }
            self.0.count += 1;
        }
        Ok(())
    }
}

struct ItemSeed<'s, F>(&'s mut RecordSink<F>);

impl<'de, F> DeserializeSeed<'de> for ItemSeed<'_, F>
where
    F: FnMut(Record) -> Result<()>,
{
    type Value = ();

    fn deserialize<D>(self, deserializer: D) -> std::result::Result<(), D::Error>
    where
        D: de::Deserializer<'de>,
    {
        deserializer.deserialize_map(self)
    }
}

impl<'de, F> Visitor<'de> for ItemSeed<'_, F>
where
    F: FnMut(Record) -> Result<()>,
{
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a JSON object with an `{ITEM_KEY}` array")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<(), A::Error> {
        let mut found = false;
        while let Some(key) = map.next_key::<String>()? {
            if key == ITEM_KEY && !found {
                map.next_value_seed(ArraySeed(&mut *self.0))?;
                found = true;
            } else {
                map.next_value::<IgnoredAny>()?;
            }
        }
        if found {
            Ok(())
        } else {
            Err(de::Error::missing_field(ITEM_KEY))
        }
    }
}
