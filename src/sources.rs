//! Source registry: content-hash-deduplicated intake of raw statement
//! files (bank CSVs, scanned receipts, exports). Registering the same
//! bytes twice returns the existing document instead of creating a
//! duplicate.

use crate::layout::Layout;
use crate::{hashing, ids, index, logging, storage, timeutil};
use anyhow::{Context, Result};
use serde_json::{json, Map, Value};
use std::path::Path;

fn default_index() -> Value {
    json!({"version": 1, "docs": []})
}

pub struct RegisterOptions<'a> {
    pub copy_into_sources: bool,
    pub source_type: Option<&'a str>,
    pub extra_meta: Map<String, Value>,
}

impl<'a> Default for RegisterOptions<'a> {
    fn default() -> Self {
        Self { copy_into_sources: true, source_type: None, extra_meta: Map::new() }
    }
}

/// Registers a file into the source registry, deduplicating by SHA-256.
/// If the hash already exists, any new metadata is merged into the
/// existing document rather than creating a second one.
pub fn register_file(layout: &Layout, file_path: &Path, opts: RegisterOptions) -> Result<Value> {
    let sha = hashing::sha256_file(file_path)?;
    let index_path = layout.sources_index_path();
    let mut index_doc = storage::read_json(&index_path, default_index())?;

    let docs = index_doc
        .get_mut("docs")
        .and_then(|d| d.as_array_mut())
        .context("sources index missing docs array")?;

    if let Some(existing) = docs.iter_mut().find(|d| d.get("sha256") == Some(&json!(sha))) {
        let mut changed = false;
        if let Some(source_type) = opts.source_type {
            if existing.get("sourceType").is_none() {
                existing["sourceType"] = json!(source_type);
                changed = true;
            }
        }
        for (k, v) in &opts.extra_meta {
            if existing.get(k).is_none() {
                existing[k] = v.clone();
                changed = true;
            }
        }
        let doc = existing.clone();
        if changed {
            if let Some(doc_id) = doc.get("docId").and_then(|v| v.as_str()) {
                let doc_dir = layout.sources_dir().join(doc_id);
                if doc_dir.exists() {
                    storage::write_json(&doc_dir.join("meta.json"), &doc)?;
                }
            }
            storage::write_json(&index_path, &index_doc)?;
            mirror_source(layout, &doc);
        }
        return Ok(doc);
    }

    let doc_id = ids::new_id("doc");
    let doc_dir = layout.sources_dir().join(&doc_id);
    storage::ensure_dir(&doc_dir)?;

    let stored_path = if opts.copy_into_sources {
        let ext = file_path.extension().and_then(|e| e.to_str()).map(|e| e.to_lowercase());
        let stored_name = match ext {
            Some(ext) => format!("original.{}", ext),
            None => "original".to_string(),
        };
        let dest = doc_dir.join(&stored_name);
        std::fs::copy(file_path, &dest)
            .with_context(|| format!("copying {} into source registry", file_path.display()))?;
        Some(
            dest.strip_prefix(layout.sources_dir().parent().unwrap_or(&layout.data_dir))
                .unwrap_or(&dest)
                .to_string_lossy()
                .to_string(),
        )
    } else {
        None
    };

    let size = std::fs::metadata(file_path)?.len();
    let mut doc = json!({
        "docId": doc_id,
        "originalPath": file_path.to_string_lossy(),
        "storedPath": stored_path,
        "sha256": sha,
        "size": size,
        "addedAt": timeutil::utc_now_iso(),
    });
    if let Some(source_type) = opts.source_type {
        doc["sourceType"] = json!(source_type);
    }
    for (k, v) in &opts.extra_meta {
        if doc.get(k).is_none() {
            doc[k] = v.clone();
        }
    }

    storage::write_json(&doc_dir.join("meta.json"), &doc)?;
    docs.push(doc.clone());
    storage::write_json(&index_path, &index_doc)?;
    mirror_source(layout, &doc);
    Ok(doc)
}

fn mirror_source(layout: &Layout, doc: &Value) {
    let result = (|| -> Result<()> {
        let conn = index::connect(&layout.index_db_path())?;
        index::ensure_index_schema(&conn)?;
        let now = timeutil::utc_now_iso();
        index::upsert_source(&conn, doc, &now)
    })();
    if let Err(e) = result {
        let doc_id = doc.get("docId").and_then(|v| v.as_str()).unwrap_or("");
        logging::log_index_update_failed("sources", doc_id, &e.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registering_same_bytes_twice_returns_same_doc_id() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let src = dir.path().join("statement.csv");
        std::fs::write(&src, b"date,amount\n2026-07-01,12.50\n").unwrap();

        let first = register_file(&layout, &src, RegisterOptions::default()).unwrap();
        let second = register_file(&layout, &src, RegisterOptions::default()).unwrap();
        assert_eq!(first["docId"], second["docId"]);

        let index_doc: Value = storage::read_json(&layout.sources_index_path(), default_index()).unwrap();
        assert_eq!(index_doc["docs"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn registering_merges_new_metadata_into_existing_doc() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let src = dir.path().join("statement.csv");
        std::fs::write(&src, b"same-bytes").unwrap();

        register_file(&layout, &src, RegisterOptions::default()).unwrap();
        let second = register_file(
            &layout,
            &src,
            RegisterOptions { source_type: Some("bank"), ..RegisterOptions::default() },
        )
        .unwrap();
        assert_eq!(second["sourceType"], "bank");
    }

    #[test]
    fn different_bytes_produce_different_doc_ids() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let a = dir.path().join("a.csv");
        let b = dir.path().join("b.csv");
        std::fs::write(&a, b"aaa").unwrap();
        std::fs::write(&b, b"bbb").unwrap();

        let doc_a = register_file(&layout, &a, RegisterOptions::default()).unwrap();
        let doc_b = register_file(&layout, &b, RegisterOptions::default()).unwrap();
        assert_ne!(doc_a["docId"], doc_b["docId"]);
    }
}
