//! Pluggable compression support for transparent I/O and archival.
//!
//! Two jobs live here:
//! - [`compress_file`] archives a finished file in place as `.bz2`, replacing
//!   the input. Archival favors ratio over speed.
//! - [`auto_detect_reader`] / [`auto_detect_writer`] wrap streams with the
//!   codec implied by a path hint, so the transcoder and table writer can read
//!   `.json.bz2` or `.jsonl.gz` without a decompress-to-temp step.
//!
//! ## Built-in Codecs
//! - **Bzip2** (`.bz2`) - via `bzip2`; always available
//! - **Gzip** (`.gz`) - via `flate2` (feature: `compression-gzip`)
//!
//! ## Detection
//! Extensions are checked first; readers fall back to magic bytes when the
//! extension is not recognized. Writers only look at the extension.

use crate::error::{Error, IoResultExt, Result};
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};

/// Buffer size for file-to-file streaming.
pub const STREAM_BUFFER_BYTES: usize = 1 << 20;

/// Pluggable compression codec.
///
/// Implementations must be `Send + Sync` so pipelines may run on worker
/// threads.
pub trait CompressionCodec: Send + Sync {
    /// Human-readable codec name (e.g., "bzip2").
    fn name(&self) -> &str;

    /// File extensions associated with this codec, lowercase with leading dot.
    fn extensions(&self) -> &[&str];

    /// Magic byte signature for content-based detection, if any.
    fn magic_bytes(&self) -> Option<&[u8]>;

    /// Wrap a reader with decompression.
    fn wrap_reader_dyn<'a>(&self, reader: Box<dyn Read + 'a>) -> io::Result<Box<dyn Read + 'a>>;

    /// Wrap a writer with compression.
    ///
    /// The returned writer must be finished with [`CompressedWriter::finish`]
    /// to guarantee the trailer is flushed and errors surface.
    fn wrap_writer_dyn<'a>(
        &self,
        writer: Box<dyn Write + 'a>,
    ) -> io::Result<Box<dyn CompressedWriter + 'a>>;
}

/// A writer whose stream needs an explicit, fallible end marker.
pub trait CompressedWriter: Write {
    /// Write any trailer and flush the underlying writer.
    fn finish(self: Box<Self>) -> io::Result<()>;
}

struct Plain<W: Write>(W);

impl<W: Write> Write for Plain<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl<W: Write> CompressedWriter for Plain<W> {
    fn finish(mut self: Box<Self>) -> io::Result<()> {
        self.0.flush()
    }
}

/// Bzip2 codec at maximum compression.
pub struct Bzip2Codec;

struct BzWriter<'a>(bzip2::write::BzEncoder<Box<dyn Write + 'a>>);

impl Write for BzWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl CompressedWriter for BzWriter<'_> {
    fn finish(self: Box<Self>) -> io::Result<()> {
        let mut inner = self.0.finish()?;
        inner.flush()
    }
}

impl CompressionCodec for Bzip2Codec {
    fn name(&self) -> &str {
        "bzip2"
    }

    fn extensions(&self) -> &[&str] {
        &[".bz2", ".bzip2"]
    }

    fn magic_bytes(&self) -> Option<&[u8]> {
        Some(b"BZh")
    }

    fn wrap_reader_dyn<'a>(&self, reader: Box<dyn Read + 'a>) -> io::Result<Box<dyn Read + 'a>> {
        // Multi-stream so concatenated archives (`bzip2` CLI output) decode fully.
        Ok(Box::new(bzip2::read::MultiBzDecoder::new(reader)))
    }

    fn wrap_writer_dyn<'a>(
        &self,
        writer: Box<dyn Write + 'a>,
    ) -> io::Result<Box<dyn CompressedWriter + 'a>> {
        use bzip2::Compression;
        use bzip2::write::BzEncoder;
        Ok(Box::new(BzWriter(BzEncoder::new(writer, Compression::best()))))
    }
}

/// Gzip codec, used to read historical `.gz` captures.
#[cfg(feature = "compression-gzip")]
pub struct GzipCodec;

#[cfg(feature = "compression-gzip")]
struct GzWriter<'a>(flate2::write::GzEncoder<Box<dyn Write + 'a>>);

#[cfg(feature = "compression-gzip")]
impl Write for GzWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

#[cfg(feature = "compression-gzip")]
impl CompressedWriter for GzWriter<'_> {
    fn finish(self: Box<Self>) -> io::Result<()> {
        let mut inner = self.0.finish()?;
        inner.flush()
    }
}

#[cfg(feature = "compression-gzip")]
impl CompressionCodec for GzipCodec {
    fn name(&self) -> &str {
        "gzip"
    }

    fn extensions(&self) -> &[&str] {
        &[".gz", ".gzip"]
    }

    fn magic_bytes(&self) -> Option<&[u8]> {
        Some(&[0x1f, 0x8b])
    }

    fn wrap_reader_dyn<'a>(&self, reader: Box<dyn Read + 'a>) -> io::Result<Box<dyn Read + 'a>> {
        Ok(Box::new(flate2::read::MultiGzDecoder::new(reader)))
    }

    fn wrap_writer_dyn<'a>(
        &self,
        writer: Box<dyn Write + 'a>,
    ) -> io::Result<Box<dyn CompressedWriter + 'a>> {
        use flate2::Compression;
        use flate2::write::GzEncoder;
        Ok(Box::new(GzWriter(GzEncoder::new(writer, Compression::best()))))
    }
}

static CODECS: &[&dyn CompressionCodec] = &[
    &Bzip2Codec,
    #[cfg(feature = "compression-gzip")]
    &GzipCodec,
];

/// Detect a codec from the path's extension (case-insensitive).
pub fn detect_from_extension(path: impl AsRef<Path>) -> Option<&'static dyn CompressionCodec> {
    let path_str = path.as_ref().to_string_lossy().to_lowercase();
    CODECS
        .iter()
        .copied()
        .find(|codec| codec.extensions().iter().any(|ext| path_str.ends_with(ext)))
}

/// Detect a codec by peeking at the start of a buffered reader.
/// The reader is not advanced.
fn detect_from_magic<R: BufRead>(reader: &mut R) -> Option<&'static dyn CompressionCodec> {
    let buf = reader.fill_buf().ok()?;
    if buf.is_empty() {
        return None;
    }
    CODECS.iter().copied().find(|codec| {
        codec
            .magic_bytes()
            .is_some_and(|magic| buf.len() >= magic.len() && buf.starts_with(magic))
    })
}

/// Wrap a reader with decompression if the path hint or content calls for it.
///
/// # Errors
/// Returns an error if the codec cannot be initialized.
pub fn auto_detect_reader<'a, R: Read + 'a>(
    reader: R,
    path_hint: impl AsRef<Path>,
) -> Result<Box<dyn Read + 'a>> {
    let path_hint = path_hint.as_ref();
    if let Some(codec) = detect_from_extension(path_hint) {
        return codec
            .wrap_reader_dyn(Box::new(BufReader::with_capacity(STREAM_BUFFER_BYTES, reader)))
            .at_path(path_hint);
    }

    let mut buf_reader = BufReader::with_capacity(STREAM_BUFFER_BYTES, reader);
    if let Some(codec) = detect_from_magic(&mut buf_reader) {
        debug!(path = %path_hint.display(), codec = codec.name(), "detected compression from magic bytes");
        return codec.wrap_reader_dyn(Box::new(buf_reader)).at_path(path_hint);
    }

    Ok(Box::new(buf_reader))
}

/// Wrap a writer with compression chosen by the path hint's extension.
///
/// # Errors
/// Returns an error if the codec cannot be initialized.
pub fn auto_detect_writer<'a, W: Write + 'a>(
    writer: W,
    path_hint: impl AsRef<Path>,
) -> Result<Box<dyn CompressedWriter + 'a>> {
    let path_hint = path_hint.as_ref();
    let buffered = BufWriter::with_capacity(STREAM_BUFFER_BYTES, writer);
    match detect_from_extension(path_hint) {
        Some(codec) => codec.wrap_writer_dyn(Box::new(buffered)).at_path(path_hint),
        None => Ok(Box::new(Plain(buffered))),
    }
}

/// Open a file for reading with transparent decompression.
///
/// # Errors
/// Returns [`Error::Filesystem`] if the file cannot be opened.
pub fn open_decompressed(path: impl AsRef<Path>) -> Result<Box<dyn Read>> {
    let path = path.as_ref();
    let f = File::open(path).at_path(path)?;
    auto_detect_reader(f, path)
}

/// Compress `path` in place to `path.bz2` and remove the original.
///
/// The compressed bytes go to a temporary file beside the input, which is
/// renamed into place only after the stream is finished, so an interrupted
/// call never leaves a truncated `.bz2`.
///
/// # Returns
/// The path of the compressed file.
///
/// # Errors
/// Returns [`Error::Filesystem`] on any read, write, or rename failure.
pub fn compress_file(path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    let mut target = path.as_os_str().to_owned();
    target.push(".bz2");
    let target = PathBuf::from(target);
    info!(path = %path.display(), "compressing");

    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut input = BufReader::with_capacity(STREAM_BUFFER_BYTES, File::open(path).at_path(path)?);
    let staged = NamedTempFile::new_in(dir).at_path(dir)?;
    {
        let mut w = Bzip2Codec
            .wrap_writer_dyn(Box::new(BufWriter::with_capacity(
                STREAM_BUFFER_BYTES,
                staged.as_file(),
            )))
            .at_path(&target)?;
        io::copy(&mut input, &mut w).at_path(&target)?;
        w.finish().at_path(&target)?;
    }
    staged
        .persist(&target)
        .map_err(|e| Error::fs(&target, e.error))?;
    fs::remove_file(path).at_path(path)?;
    Ok(target)
}
