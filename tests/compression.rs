use dataset_sync::io::compression::{detect_from_extension, open_decompressed};
use dataset_sync::{auto_detect_reader, auto_detect_writer, compress_file};
use std::fs;
use std::io::{Read, Write};

fn sample_jsonl(rows: usize) -> String {
    (0..rows)
        .map(|i| format!("{{\"id\":{i},\"downloadedAt\":\"2022-03-01T00:00:00Z\"}}\n"))
        .collect()
}

#[test]
fn compress_file_replaces_original_with_bz2() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let path = tmp.path().join("deaths_20220301T000000.jsonl");
    let body = sample_jsonl(1000);
    fs::write(&path, &body)?;

    let out = compress_file(&path)?;
    assert_eq!(out, tmp.path().join("deaths_20220301T000000.jsonl.bz2"));
    assert!(!path.exists());

    let names: Vec<_> = fs::read_dir(tmp.path())?
        .map(|e| e.map(|e| e.file_name()))
        .collect::<Result<_, _>>()?;
    assert_eq!(names.len(), 1, "staging leftovers: {names:?}");

    let compressed = fs::read(&out)?;
    assert!(compressed.starts_with(b"BZh9"), "expected maximum block size");
    assert!(compressed.len() < body.len());

    let mut back = String::new();
    open_decompressed(&out)?.read_to_string(&mut back)?;
    assert_eq!(back, body);
    Ok(())
}

#[test]
fn compress_file_missing_input_is_filesystem_error() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let err = compress_file(tmp.path().join("absent.csv")).unwrap_err();
    assert!(err.is_filesystem());
    assert_eq!(fs::read_dir(tmp.path())?.count(), 0);
    Ok(())
}

#[test]
fn empty_file_compresses_and_reads_back_empty() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let path = tmp.path().join("empty.csv");
    fs::write(&path, b"")?;
    let out = compress_file(&path)?;
    let mut back = Vec::new();
    open_decompressed(&out)?.read_to_end(&mut back)?;
    assert!(back.is_empty());
    Ok(())
}

#[test]
fn reader_detects_bzip2_by_magic_without_extension() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let path = tmp.path().join("payload.bz2");
    {
        let mut w = auto_detect_writer(fs::File::create(&path)?, &path)?;
        w.write_all(b"[{\"a\":1}]")?;
        w.finish()?;
    }

    let mut back = String::new();
    auto_detect_reader(fs::File::open(&path)?, "no-extension")?.read_to_string(&mut back)?;
    assert_eq!(back, "[{\"a\":1}]");
    Ok(())
}

#[test]
fn plain_files_pass_through() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let path = tmp.path().join("rows.csv");
    {
        let mut w = auto_detect_writer(fs::File::create(&path)?, &path)?;
        w.write_all(b"a,b\n1,2\n")?;
        w.finish()?;
    }
    assert_eq!(fs::read(&path)?, b"a,b\n1,2\n");
    assert!(detect_from_extension(&path).is_none());
    Ok(())
}

#[test]
fn extension_detection_is_case_insensitive() {
    let codec = detect_from_extension("ARCHIVE.JSON.BZ2").map(|c| c.name());
    assert_eq!(codec, Some("bzip2"));
}

#[cfg(feature = "compression-gzip")]
#[test]
fn gzip_roundtrip() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let path = tmp.path().join("rows.jsonl.gz");
    let body = sample_jsonl(50);
    {
        let mut w = auto_detect_writer(fs::File::create(&path)?, &path)?;
        w.write_all(body.as_bytes())?;
        w.finish()?;
    }
    assert_eq!(detect_from_extension(&path).map(|c| c.name()), Some("gzip"));

    let mut back = String::new();
    open_decompressed(&path)?.read_to_string(&mut back)?;
    assert_eq!(back, body);
    Ok(())
}
