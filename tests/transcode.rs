use chrono::{TimeZone, Utc};
use dataset_sync::io::transcode::DOWNLOADED_AT_FIELD;
use dataset_sync::{Record, RecordShape, for_each_record, transcode};
use serde_json::Value;

fn lines(out: &[u8]) -> anyhow::Result<Vec<Record>> {
    let text = std::str::from_utf8(out)?;
    Ok(text
        .lines()
        .map(serde_json::from_str)
        .collect::<Result<Vec<Record>, _>>()?)
}

#[test]
fn one_line_per_record_in_document_order() -> anyhow::Result<()> {
    let raw: String = {
        let items: Vec<String> = (0..250).map(|i| format!(r#"{{"id":{i},"name":"r{i}"}}"#)).collect();
        format!("[{}]", items.join(","))
    };
    let at = Utc.with_ymd_and_hms(2023, 11, 5, 13, 4, 9).unwrap();
    let mut out = Vec::new();

    let n = transcode(raw.as_bytes(), RecordShape::Array, at, &mut out)?;
    assert_eq!(n, 250);

    let records = lines(&out)?;
    assert_eq!(records.len(), 250);
    for (i, r) in records.iter().enumerate() {
        assert_eq!(r["id"], Value::from(i as u64));
        assert_eq!(r[DOWNLOADED_AT_FIELD], "2023-11-05T13:04:09Z");
    }
    assert!(out.ends_with(b"\n"));
    Ok(())
}

#[test]
fn item_member_may_sit_among_other_members() -> anyhow::Result<()> {
    let raw = r#"{"total":2,"item":[{"a":1},{"a":2}],"page":{"next":null}}"#;
    let at = Utc.with_ymd_and_hms(2022, 3, 1, 0, 0, 0).unwrap();
    let mut out = Vec::new();
    assert_eq!(transcode(raw.as_bytes(), RecordShape::ItemMember, at, &mut out)?, 2);
    assert_eq!(lines(&out)?.len(), 2);
    Ok(())
}

#[test]
fn empty_array_writes_nothing() -> anyhow::Result<()> {
    let at = Utc.with_ymd_and_hms(2022, 3, 1, 0, 0, 0).unwrap();
    let mut out = Vec::new();
    assert_eq!(transcode(&b"[]"[..], RecordShape::Array, at, &mut out)?, 0);
    assert!(out.is_empty());
    Ok(())
}

#[test]
fn non_strict_json_is_rejected() {
    let at = Utc.with_ymd_and_hms(2022, 3, 1, 0, 0, 0).unwrap();
    for raw in [
        r#"[{"a":NaN}]"#,
        r#"[{"a":Infinity}]"#,
        r#"[{"a":-Infinity}]"#,
        r#"[{"a":1e999}]"#,
        r#"[{"a":1},]"#,
        r#"[{"a":1}] trailing"#,
        r#"[1,2,3]"#,
        "",
    ] {
        let mut out = Vec::new();
        let err = transcode(raw.as_bytes(), RecordShape::Array, at, &mut out).unwrap_err();
        assert!(err.is_malformed_input(), "{raw:?} gave {err}");
    }
}

#[test]
fn wrong_shape_is_rejected() {
    let at = Utc.with_ymd_and_hms(2022, 3, 1, 0, 0, 0).unwrap();
    let mut out = Vec::new();
    let err = transcode(&br#"{"rows":[]}"#[..], RecordShape::ItemMember, at, &mut out).unwrap_err();
    assert!(err.is_malformed_input());

    let err = transcode(&br#"{"item":[]}"#[..], RecordShape::Array, at, &mut out).unwrap_err();
    assert!(err.is_malformed_input());
}

#[test]
fn consumer_error_stops_iteration() {
    let raw = r#"[{"a":1},{"a":2},{"a":3}]"#;
    let mut seen = 0;
    let err = for_each_record(raw.as_bytes(), RecordShape::Array, |_| {
        seen += 1;
        if seen == 2 {
            Err(dataset_sync::Error::Configuration("stop".into()))
        } else {
            Ok(())
        }
    })
    .unwrap_err();
    assert!(err.is_configuration());
    assert_eq!(seen, 2);
}

#[test]
fn existing_downloaded_at_is_replaced() -> anyhow::Result<()> {
    let raw = r#"[{"downloadedAt":"yesterday","b":true}]"#;
    let at = Utc.with_ymd_and_hms(2022, 3, 1, 0, 0, 0).unwrap();
    let mut out = Vec::new();
    transcode(raw.as_bytes(), RecordShape::Array, at, &mut out)?;
    let records = lines(&out)?;
    assert_eq!(records[0][DOWNLOADED_AT_FIELD], "2022-03-01T00:00:00Z");
    assert_eq!(records[0].len(), 2);
    Ok(())
}
