use arrow::datatypes::DataType;
use chrono::{DateTime, TimeZone, Utc};
use dataset_sync::io::parquet::describe_table;
use dataset_sync::testing::FakeFetcher;
use dataset_sync::{
    Endpoint, Error, ExecMode, PipelineConfig, PortalPipeline, RecordShape, Retention, RunState,
    Stage, filename_stamp, record_stamp,
};
use dataset_sync::io::compression::open_decompressed;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

const ORDERS_URL: &str = "https://portal.example.org/api/orders/basic";

fn march_first() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2022, 3, 1, 0, 0, 0).unwrap()
}

fn orders() -> anyhow::Result<Endpoint> {
    Ok(Endpoint::new("orders-basic", "v1", ORDERS_URL, RecordShape::ItemMember)?)
}

fn config(root: &Path) -> PipelineConfig {
    let mut config = PipelineConfig::new(root.join("sync"));
    config.work_dir = Some(root.join("work"));
    config
}

fn open_decompressed_lines(path: impl AsRef<Path>) -> anyhow::Result<Vec<String>> {
    Ok(BufReader::new(open_decompressed(path)?)
        .lines()
        .collect::<Result<_, _>>()?)
}

/// Every file below `dir`, relative to it.
fn files_under(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    if !dir.exists() {
        return Ok(out);
    }
    let mut stack = vec![dir.to_path_buf()];
    while let Some(d) = stack.pop() {
        for entry in fs::read_dir(&d)? {
            let path = entry?.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                out.push(path.strip_prefix(dir)?.to_path_buf());
            }
        }
    }
    out.sort();
    Ok(out)
}

#[test]
fn item_member_report_lands_in_all_three_formats() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let fetcher = FakeFetcher::new().with_body(ORDERS_URL, r#"{"item":[{"a":1},{"a":2}]}"#);
    let pipeline = PortalPipeline::new(fetcher, config(tmp.path()));

    let report = pipeline.run_at(&orders()?, march_first());
    assert!(report.succeeded(), "{:?}", report.error);
    assert_eq!(report.state, RunState::Placed);
    assert_eq!(report.rows, Some(2));

    let sync = tmp.path().join("sync");
    assert_eq!(
        files_under(&sync)?,
        vec![
            PathBuf::from("orders-basic/json_v1/orders-basic_20220301T000000.json.bz2"),
            PathBuf::from("orders-basic/jsonl_v1/orders-basic_20220301T000000.jsonl.bz2"),
            PathBuf::from("orders-basic/parquet_v1/orders-basic_20220301T000000.parquet"),
        ]
    );
    assert_eq!(report.placed.len(), 3);

    let lines = open_decompressed_lines(sync.join("orders-basic/jsonl_v1/orders-basic_20220301T000000.jsonl.bz2"))?;
    assert_eq!(
        lines,
        vec![
            r#"{"a":1,"downloadedAt":"2022-03-01T00:00:00Z"}"#,
            r#"{"a":2,"downloadedAt":"2022-03-01T00:00:00Z"}"#,
        ]
    );

    let raw = open_decompressed_lines(sync.join("orders-basic/json_v1/orders-basic_20220301T000000.json.bz2"))?;
    assert_eq!(raw, vec![r#"{"item":[{"a":1},{"a":2}]}"#]);

    let table = describe_table(sync.join("orders-basic/parquet_v1/orders-basic_20220301T000000.parquet"))?;
    assert_eq!(table.rows, 2);
    assert_eq!(table.schema.fields().len(), 2);
    assert_eq!(table.schema.field_with_name("a")?.data_type(), &DataType::Int64);
    assert_eq!(table.schema.field_with_name("downloadedAt")?.data_type(), &DataType::Utf8);

    assert!(files_under(&tmp.path().join("work"))?.is_empty(), "staging not cleaned up");
    Ok(())
}

#[test]
fn one_failing_endpoint_does_not_stop_the_rest() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let x = Endpoint::new("x", "v1", "https://portal.example.org/x", RecordShape::Array)?;
    let y = Endpoint::new("y", "v1", "https://portal.example.org/y", RecordShape::Array)?;
    let fetcher = FakeFetcher::new()
        .with_status("https://portal.example.org/x", 500)
        .with_body("https://portal.example.org/y", r#"[{"n":1}]"#);
    let pipeline = PortalPipeline::new(fetcher, config(tmp.path()));

    let batch = pipeline.run_all(&[x, y], ExecMode::Sequential);
    assert_eq!(batch.runs.len(), 2);

    let failed = &batch.runs[0];
    assert_eq!(failed.state, RunState::Failed);
    let err = failed.error.as_ref().unwrap();
    assert!(err.is_transport());
    assert!(matches!(err, Error::Stage { stage: Stage::Download, .. }));
    assert!(failed.placed.is_empty());
    assert!(batch.runs[1].succeeded());

    assert_eq!(
        pipeline.fetcher().requests(),
        vec!["https://portal.example.org/x", "https://portal.example.org/y"]
    );

    let sync = tmp.path().join("sync");
    assert!(!sync.join("x").exists());
    assert_eq!(files_under(&sync.join("y"))?.len(), 3);

    match batch.into_result() {
        Err(Error::Aggregate { failed }) => assert_eq!(failed, vec!["x".to_string()]),
        other => panic!("expected aggregate failure, got {other:?}"),
    }
    Ok(())
}

#[test]
fn malformed_payload_places_nothing() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let url = "https://portal.example.org/deaths";
    let fetcher = FakeFetcher::new().with_body(url, r#"[{"a":1},{"a":NaN}]"#);
    let pipeline = PortalPipeline::new(fetcher, config(tmp.path()));
    let ep = Endpoint::new("deaths", "v1", url, RecordShape::Array)?;

    let report = pipeline.run_at(&ep, march_first());
    assert_eq!(report.state, RunState::Failed);
    let err = report.error.unwrap();
    assert!(err.is_malformed_input());
    assert!(matches!(err, Error::Stage { stage: Stage::Transcode, .. }));

    assert!(files_under(&tmp.path().join("sync"))?.is_empty());
    assert!(files_under(&tmp.path().join("work"))?.is_empty());
    Ok(())
}

#[test]
fn conflicting_field_types_fail_at_table_stage() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let url = "https://portal.example.org/tests";
    let fetcher = FakeFetcher::new().with_body(url, r#"[{"a":"5"},{"a":5}]"#);
    let pipeline = PortalPipeline::new(fetcher, config(tmp.path()));
    let ep = Endpoint::new("tests", "v1", url, RecordShape::Array)?;

    let report = pipeline.run_at(&ep, march_first());
    let err = report.error.unwrap();
    assert!(err.is_malformed_input());
    assert!(matches!(err, Error::Stage { stage: Stage::Table, .. }));
    assert!(files_under(&tmp.path().join("sync"))?.is_empty());
    Ok(())
}

#[test]
fn columnar_only_retention_keeps_just_parquet() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let fetcher = FakeFetcher::new().with_body(ORDERS_URL, r#"{"item":[{"a":1}]}"#);
    let mut config = config(tmp.path());
    config.retention = Retention::ColumnarOnly;
    let pipeline = PortalPipeline::new(fetcher, config);

    let report = pipeline.run_at(&orders()?, march_first());
    assert!(report.succeeded());
    assert_eq!(
        files_under(&tmp.path().join("sync"))?,
        vec![PathBuf::from("orders-basic/parquet_v1/orders-basic_20220301T000000.parquet")]
    );
    assert!(files_under(&tmp.path().join("work"))?.is_empty());
    Ok(())
}

#[test]
fn existing_artifacts_are_never_overwritten() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let fetcher = FakeFetcher::new().with_body(ORDERS_URL, r#"{"item":[{"a":1}]}"#);
    let pipeline = PortalPipeline::new(fetcher, config(tmp.path()));
    let ep = orders()?;

    assert!(pipeline.run_at(&ep, march_first()).succeeded());
    let placed = tmp
        .path()
        .join("sync/orders-basic/parquet_v1/orders-basic_20220301T000000.parquet");
    let before = fs::read(&placed)?;

    let again = pipeline.run_at(&ep, march_first());
    let err = again.error.unwrap();
    assert!(err.is_filesystem());
    assert!(matches!(err, Error::Stage { stage: Stage::Place, .. }));
    assert_eq!(fs::read(&placed)?, before);
    Ok(())
}

#[test]
fn placed_file_names_are_colon_free() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let fetcher = FakeFetcher::new().with_body(ORDERS_URL, r#"{"item":[{"a":1}]}"#);
    let pipeline = PortalPipeline::new(fetcher, config(tmp.path()));
    let at = Utc.with_ymd_and_hms(2024, 12, 31, 23, 59, 58).unwrap();

    assert!(pipeline.run_at(&orders()?, at).succeeded());
    let files = files_under(&tmp.path().join("sync"))?;
    assert_eq!(files.len(), 3);
    for f in files {
        let name = f.to_string_lossy();
        assert!(!name.contains(':'), "{name}");
        assert!(name.contains("orders-basic_20241231T235958."), "{name}");
    }
    Ok(())
}

#[test]
fn live_run_stamps_records_and_names_with_the_same_second() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let fetcher = FakeFetcher::new().with_body(ORDERS_URL, r#"{"item":[{"a":1}]}"#);
    let pipeline = PortalPipeline::new(fetcher, config(tmp.path()));

    let report = pipeline.run(&orders()?);
    assert!(report.succeeded(), "{:?}", report.error);
    let stamped_at = report.stamped_at.unwrap();
    assert_eq!(stamped_at.timestamp_subsec_nanos(), 0);

    let jsonl = tmp.path().join(format!(
        "sync/orders-basic/jsonl_v1/orders-basic_{}.jsonl.bz2",
        filename_stamp(stamped_at)
    ));
    let lines = open_decompressed_lines(&jsonl)?;
    let record: serde_json::Value = serde_json::from_str(&lines[0])?;
    assert_eq!(record["downloadedAt"], record_stamp(stamped_at).as_str());
    assert_eq!(
        DateTime::parse_from_rfc3339(&record_stamp(stamped_at))?.with_timezone(&Utc),
        stamped_at
    );
    Ok(())
}

#[cfg(feature = "parallel-io")]
#[test]
fn parallel_mode_runs_every_endpoint() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let mut fetcher = FakeFetcher::new();
    let mut endpoints = Vec::new();
    for i in 0..6 {
        let url = format!("https://portal.example.org/ds{i}");
        fetcher = fetcher.with_body(&url, format!(r#"[{{"i":{i}}}]"#));
        endpoints.push(Endpoint::new(format!("ds{i}"), "v1", &url, RecordShape::Array)?);
    }
    let pipeline = PortalPipeline::new(fetcher, config(tmp.path()));

    let batch = pipeline.run_all(&endpoints, ExecMode::Parallel { threads: Some(3) });
    assert_eq!(batch.runs.len(), 6);
    assert!(batch.runs.iter().all(|r| r.succeeded()));
    assert_eq!(files_under(&tmp.path().join("sync"))?.len(), 18);
    Ok(())
}
