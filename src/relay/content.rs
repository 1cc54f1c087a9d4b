use crate::relay::util::extension_lowercase;
use anyhow::{Context, Result};
use serde_json::Value;
use std::fs;
use std::path::Path;

/// True when posting the file could not produce any rows downstream: zero
/// bytes, a CSV with only a header (or blank lines), or an empty JSON
/// document. Spreadsheets are only checked for zero length.
pub fn is_effectively_empty(path: &Path) -> Result<bool> {
    let len = fs::metadata(path)
        .with_context(|| format!("failed to stat {}", path.display()))?
        .len();
    if len == 0 {
        return Ok(true);
    }

    match extension_lowercase(path).as_deref() {
        Some("csv") => csv_has_no_rows(path),
        Some("json") => json_is_empty(path),
        _ => Ok(false),
    }
}

fn csv_has_no_rows(path: &Path) -> Result<bool> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    for record in reader.records() {
        let record = record.with_context(|| format!("failed to read {}", path.display()))?;
        if record.iter().any(|field| !field.trim().is_empty()) {
            return Ok(false);
        }
    }
    Ok(true)
}

fn json_is_empty(path: &Path) -> Result<bool> {
    let raw = fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    if raw.trim().is_empty() {
        return Ok(true);
    }
    // malformed JSON is left for the API to reject
    Ok(match serde_json::from_str::<Value>(&raw) {
        Ok(Value::Null) => true,
        Ok(Value::Array(items)) => items.is_empty(),
        Ok(Value::Object(fields)) => fields.is_empty(),
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::is_effectively_empty;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn zero_bytes_is_empty_for_any_format() {
        let tmp = tempdir().expect("tempdir");
        let xlsx = tmp.path().join("r.xlsx");
        fs::write(&xlsx, "").expect("write");
        assert!(is_effectively_empty(&xlsx).expect("check"));
    }

    #[test]
    fn header_only_csv_is_empty() {
        let tmp = tempdir().expect("tempdir");
        let header_only = tmp.path().join("h.csv");
        fs::write(&header_only, "date,impressions,revenue\n\n").expect("write");
        assert!(is_effectively_empty(&header_only).expect("check"));

        let with_row = tmp.path().join("r.csv");
        fs::write(&with_row, "date,impressions\n2024-05-01,10\n").expect("write");
        assert!(!is_effectively_empty(&with_row).expect("check"));
    }

    #[test]
    fn json_empty_containers_are_empty() {
        let tmp = tempdir().expect("tempdir");
        for (name, body, expected) in [
            ("a.json", "[]", true),
            ("o.json", " {} ", true),
            ("rows.json", "[{\"clicks\":1}]", false),
            ("bad.json", "{oops", false),
        ] {
            let path = tmp.path().join(name);
            fs::write(&path, body).expect("write");
            assert_eq!(is_effectively_empty(&path).expect("check"), expected, "{name}");
        }
    }

    #[test]
    fn non_empty_spreadsheet_is_not_inspected() {
        let tmp = tempdir().expect("tempdir");
        let xls = tmp.path().join("r.xls");
        fs::write(&xls, [0xd0, 0xcf, 0x11, 0xe0]).expect("write");
        assert!(!is_effectively_empty(&xls).expect("check"));
    }
}
