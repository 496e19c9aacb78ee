//! File-level storage primitives: atomic JSON write-replace, append-only
//! JSONL, and tolerant readers. Every mutable document in the data
//! directory goes through `write_json`; every append-only log goes
//! through `append_jsonl`.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

pub fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).with_context(|| format!("creating directory {}", path.display()))
}

/// Reads a JSON document, returning `default` if the file is absent.
pub fn read_json<T: DeserializeOwned>(path: &Path, default: T) -> Result<T> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing json at {}", path.display()))?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(default),
        Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
    }
}

/// Writes a JSON document atomically: serialize to a sibling temp file,
/// flush, then rename over the final path. A reader can never observe a
/// half-written document.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let serialized = serde_json::to_string_pretty(value)?;
    let tmp_path = path.with_extension(format!(
        "{}.tmp-{}",
        path.extension().and_then(|e| e.to_str()).unwrap_or("json"),
        std::process::id()
    ));
    {
        let mut f = std::fs::File::create(&tmp_path)
            .with_context(|| format!("creating temp file {}", tmp_path.display()))?;
        f.write_all(serialized.as_bytes())?;
        f.write_all(b"\n")?;
        f.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("renaming {} to {}", tmp_path.display(), path.display()))?;
    Ok(())
}

/// Appends one canonical JSON object as a line. Durable (flushed) before
/// returning; append order is the file's total event order.
pub fn append_jsonl<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening {} for append", path.display()))?;
    let line = serde_json::to_string(value)?;
    f.write_all(line.as_bytes())?;
    f.write_all(b"\n")?;
    f.sync_data()?;
    Ok(())
}

/// Reads all records from a JSONL file as generic JSON values. Blank
/// lines and lines that fail to parse as JSON objects are skipped rather
/// than aborting the read, to tolerate truncated or forward-incompatible
/// historical data.
pub fn iter_jsonl(path: &Path) -> Result<Vec<Value>> {
    match std::fs::File::open(path) {
        Ok(f) => {
            let reader = BufReader::new(f);
            let mut out = Vec::new();
            for line in reader.lines() {
                let line = line?;
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Value>(trimmed) {
                    Ok(v) if v.is_object() => out.push(v),
                    _ => continue,
                }
            }
            Ok(out)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
    }
}

/// Reads the last `limit` records of a JSONL file, in file order.
pub fn read_jsonl_tail(path: &Path, limit: usize) -> Result<Vec<Value>> {
    let all = iter_jsonl(path)?;
    if all.len() <= limit {
        Ok(all)
    } else {
        Ok(all[all.len() - limit..].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn write_json_then_read_json_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        write_json(&path, &json!({"a": 1})).unwrap();
        let read: Value = read_json(&path, json!(null)).unwrap();
        assert_eq!(read, json!({"a": 1}));
    }

    #[test]
    fn read_json_returns_default_for_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");
        let read: Value = read_json(&path, json!({"version": 1})).unwrap();
        assert_eq!(read, json!({"version": 1}));
    }

    #[test]
    fn write_json_never_leaves_a_temp_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        write_json(&path, &json!({"a": 1})).unwrap();
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn append_jsonl_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        append_jsonl(&path, &json!({"n": 1})).unwrap();
        append_jsonl(&path, &json!({"n": 2})).unwrap();
        let rows = iter_jsonl(&path).unwrap();
        assert_eq!(rows, vec![json!({"n": 1}), json!({"n": 2})]);
    }

    #[test]
    fn iter_jsonl_skips_blank_and_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        std::fs::write(&path, "{\"n\":1}\n\nnot json\n{\"n\":2}\n").unwrap();
        let rows = iter_jsonl(&path).unwrap();
        assert_eq!(rows, vec![json!({"n": 1}), json!({"n": 2})]);
    }

    #[test]
    fn read_jsonl_tail_returns_last_n_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        for n in 0..5 {
            append_jsonl(&path, &json!({"n": n})).unwrap();
        }
        let tail = read_jsonl_tail(&path, 2).unwrap();
        assert_eq!(tail, vec![json!({"n": 3}), json!({"n": 4})]);
    }
}
