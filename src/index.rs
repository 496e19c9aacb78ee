//! Secondary index: a rusqlite mirror of the append-only ledger logs,
//! maintained best-effort alongside every append so reads don't have to
//! replay the full JSONL history. The JSONL files remain the source of
//! truth; this index can always be thrown away and rebuilt from them.

use crate::layout::Layout;
use crate::ledger::deep_merge_inplace;
use crate::money::decimal_from_any;
use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use serde_json::Value;
use std::path::Path;

const INDEX_SCHEMA_VERSION: i64 = 1;

pub fn connect(db_path: &Path) -> Result<Connection> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(db_path)
        .with_context(|| format!("opening index db at {}", db_path.display()))?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=OFF;")?;
    Ok(conn)
}

pub fn ensure_index_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sources (
            doc_id TEXT PRIMARY KEY,
            source_type TEXT,
            sha256 TEXT,
            original_path TEXT,
            stored_path TEXT,
            size INTEGER,
            added_at TEXT,
            raw_json TEXT NOT NULL,
            indexed_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS transactions (
            tx_id TEXT PRIMARY KEY,
            source_type TEXT,
            source_doc_id TEXT,
            source_hash TEXT,
            occurred_at TEXT,
            posted_at TEXT,
            month TEXT,
            amount_value TEXT,
            currency TEXT,
            direction TEXT,
            merchant TEXT,
            category_id TEXT,
            raw_json TEXT NOT NULL,
            is_deleted INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS corrections (
            event_id TEXT PRIMARY KEY,
            tx_id TEXT,
            event_type TEXT,
            at TEXT,
            raw_json TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_sources_sha256 ON sources (sha256);
        CREATE INDEX IF NOT EXISTS idx_tx_source_doc_hash ON transactions (source_doc_id, source_hash);
        CREATE INDEX IF NOT EXISTS idx_tx_occurred_at ON transactions (occurred_at);
        CREATE INDEX IF NOT EXISTS idx_tx_month ON transactions (month);
        CREATE INDEX IF NOT EXISTS idx_tx_category ON transactions (category_id);
        CREATE INDEX IF NOT EXISTS idx_tx_source_type ON transactions (source_type);
        CREATE INDEX IF NOT EXISTS idx_tx_deleted ON transactions (is_deleted);
        CREATE INDEX IF NOT EXISTS idx_corr_tx_id ON corrections (tx_id);
        ",
    )?;
    conn.execute(
        "INSERT INTO meta(key, value) VALUES('index_schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
        params![INDEX_SCHEMA_VERSION.to_string()],
    )?;
    Ok(())
}

struct TxFields {
    tx_id: String,
    source_type: String,
    source_doc_id: String,
    source_hash: String,
    occurred_at: String,
    posted_at: String,
    month: String,
    amount_value: String,
    currency: String,
    direction: String,
    merchant: String,
    category_id: String,
    raw_json: String,
}

fn str_field(v: &Value, key: &str) -> String {
    v.get(key).and_then(|x| x.as_str()).unwrap_or("").to_string()
}

fn tx_fields(tx: &Value) -> TxFields {
    let empty = Value::Object(Default::default());
    let src = tx.get("source").unwrap_or(&empty);
    let amt = tx.get("amount").unwrap_or(&empty);
    let cat = tx.get("category").unwrap_or(&empty);
    let occurred_at = str_field(tx, "occurredAt");
    let month = if occurred_at.len() >= 7 {
        occurred_at[..7].to_string()
    } else {
        String::new()
    };
    TxFields {
        tx_id: str_field(tx, "txId"),
        source_type: str_field(src, "sourceType"),
        source_doc_id: str_field(src, "docId"),
        source_hash: str_field(src, "sourceHash"),
        occurred_at,
        posted_at: str_field(tx, "postedAt"),
        month,
        amount_value: amt
            .get("value")
            .map(|v| crate::money::fmt_decimal(&decimal_from_any(v)))
            .unwrap_or_default(),
        currency: str_field(amt, "currency"),
        direction: str_field(tx, "direction"),
        merchant: str_field(tx, "merchant"),
        category_id: str_field(cat, "id"),
        raw_json: tx.to_string(),
    }
}

/// Inserts or overwrites a transaction row. Best-effort: callers should
/// log and continue on error rather than fail the append that triggered it.
pub fn upsert_transaction(conn: &Connection, tx: &Value, now: &str) -> Result<()> {
    let f = tx_fields(tx);
    if f.tx_id.is_empty() {
        return Ok(());
    }
    conn.execute(
        "INSERT INTO transactions (
            tx_id, source_type, source_doc_id, source_hash, occurred_at, posted_at, month,
            amount_value, currency, direction, merchant, category_id, raw_json, is_deleted,
            created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, 0, ?14, ?14)
        ON CONFLICT(tx_id) DO UPDATE SET
            source_type=excluded.source_type,
            source_doc_id=excluded.source_doc_id,
            source_hash=excluded.source_hash,
            occurred_at=excluded.occurred_at,
            posted_at=excluded.posted_at,
            month=excluded.month,
            amount_value=excluded.amount_value,
            currency=excluded.currency,
            direction=excluded.direction,
            merchant=excluded.merchant,
            category_id=excluded.category_id,
            raw_json=excluded.raw_json,
            updated_at=excluded.updated_at",
        params![
            f.tx_id,
            f.source_type,
            f.source_doc_id,
            f.source_hash,
            f.occurred_at,
            f.posted_at,
            f.month,
            f.amount_value,
            f.currency,
            f.direction,
            f.merchant,
            f.category_id,
            f.raw_json,
            now,
        ],
    )?;
    Ok(())
}

/// Applies one correction event to the index: records it in `corrections`
/// and, if the target transaction is present, patches or soft-deletes it.
pub fn apply_correction_event(conn: &Connection, evt: &Value, now: &str) -> Result<()> {
    let event_id = str_field(evt, "eventId");
    let tx_id = str_field(evt, "txId");
    if event_id.is_empty() || tx_id.is_empty() {
        return Ok(());
    }
    let evt_type = evt.get("type").and_then(|v| v.as_str()).unwrap_or("patch");
    conn.execute(
        "INSERT INTO corrections(event_id, tx_id, event_type, at, raw_json)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(event_id) DO UPDATE SET
            tx_id=excluded.tx_id, event_type=excluded.event_type,
            at=excluded.at, raw_json=excluded.raw_json",
        params![event_id, tx_id, evt_type, str_field(evt, "at"), evt.to_string()],
    )?;

    let existing: Option<String> = conn
        .query_row(
            "SELECT raw_json FROM transactions WHERE tx_id = ?1",
            params![tx_id],
            |row| row.get(0),
        )
        .ok();
    let Some(raw_json) = existing else {
        return Ok(());
    };

    match evt_type {
        "patch" => {
            let mut tx: Value = serde_json::from_str(&raw_json).unwrap_or(Value::Null);
            if let Some(patch) = evt.get("patch").filter(|p| p.is_object()) {
                deep_merge_inplace(&mut tx, patch);
            }
            let f = tx_fields(&tx);
            conn.execute(
                "UPDATE transactions SET
                    source_type=?1, source_doc_id=?2, source_hash=?3, occurred_at=?4, posted_at=?5,
                    month=?6, amount_value=?7, currency=?8, direction=?9, merchant=?10,
                    category_id=?11, raw_json=?12, updated_at=?13
                 WHERE tx_id=?14",
                params![
                    f.source_type,
                    f.source_doc_id,
                    f.source_hash,
                    f.occurred_at,
                    f.posted_at,
                    f.month,
                    f.amount_value,
                    f.currency,
                    f.direction,
                    f.merchant,
                    f.category_id,
                    f.raw_json,
                    now,
                    tx_id,
                ],
            )?;
        }
        "tombstone" | "delete" => {
            conn.execute(
                "UPDATE transactions SET is_deleted = 1, updated_at = ?1 WHERE tx_id = ?2",
                params![now, tx_id],
            )?;
        }
        _ => {}
    }
    Ok(())
}

pub fn upsert_source(conn: &Connection, doc: &Value, now: &str) -> Result<()> {
    let doc_id = str_field(doc, "docId");
    if doc_id.is_empty() {
        return Ok(());
    }
    conn.execute(
        "INSERT INTO sources(doc_id, source_type, sha256, original_path, stored_path, size, added_at, raw_json, indexed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(doc_id) DO UPDATE SET
            source_type=excluded.source_type, sha256=excluded.sha256,
            original_path=excluded.original_path, stored_path=excluded.stored_path,
            size=excluded.size, added_at=excluded.added_at,
            raw_json=excluded.raw_json, indexed_at=excluded.indexed_at",
        params![
            doc_id,
            str_field(doc, "sourceType"),
            str_field(doc, "sha256"),
            str_field(doc, "originalPath"),
            str_field(doc, "storedPath"),
            doc.get("size").and_then(|v| v.as_i64()).unwrap_or(0),
            str_field(doc, "addedAt"),
            doc.to_string(),
            now,
        ],
    )?;
    Ok(())
}

pub struct RebuildStats {
    pub transactions_indexed: u64,
    pub corrections_indexed: u64,
    pub sources_indexed: u64,
}

/// Drops and rebuilds the entire index from the JSONL logs and the source
/// registry. Used after schema migrations and for disaster recovery.
pub fn rebuild_index(layout: &Layout) -> Result<RebuildStats> {
    let conn = connect(&layout.index_db_path())?;
    ensure_index_schema(&conn)?;
    conn.execute_batch(
        "DELETE FROM corrections; DELETE FROM transactions; DELETE FROM sources;",
    )?;

    let now = crate::timeutil::utc_now_iso();
    let mut tx_count = 0u64;
    for tx in crate::storage::iter_jsonl(&layout.transactions_path())? {
        upsert_transaction(&conn, &tx, &now)?;
        tx_count += 1;
    }
    let mut evt_count = 0u64;
    for evt in crate::storage::iter_jsonl(&layout.corrections_path())? {
        apply_correction_event(&conn, &evt, &now)?;
        evt_count += 1;
    }
    let idx: Value = crate::storage::read_json(
        &layout.sources_index_path(),
        serde_json::json!({"version": 1, "docs": []}),
    )?;
    let mut src_count = 0u64;
    if let Some(docs) = idx.get("docs").and_then(|v| v.as_array()) {
        for doc in docs {
            upsert_source(&conn, doc, &now)?;
            src_count += 1;
        }
    }
    Ok(RebuildStats {
        transactions_indexed: tx_count,
        corrections_indexed: evt_count,
        sources_indexed: src_count,
    })
}

pub struct IndexStats {
    pub transactions: i64,
    pub transactions_live: i64,
    pub corrections: i64,
    pub sources: i64,
}

pub fn index_stats(layout: &Layout) -> Result<IndexStats> {
    let conn = connect(&layout.index_db_path())?;
    ensure_index_schema(&conn)?;
    Ok(IndexStats {
        transactions: conn.query_row("SELECT COUNT(*) FROM transactions", [], |r| r.get(0))?,
        transactions_live: conn.query_row(
            "SELECT COUNT(*) FROM transactions WHERE is_deleted = 0",
            [],
            |r| r.get(0),
        )?,
        corrections: conn.query_row("SELECT COUNT(*) FROM corrections", [], |r| r.get(0))?,
        sources: conn.query_row("SELECT COUNT(*) FROM sources", [], |r| r.get(0))?,
    })
}

pub fn has_source_hash(layout: &Layout, doc_id: &str, source_hash: &str) -> Result<bool> {
    let conn = connect(&layout.index_db_path())?;
    ensure_index_schema(&conn)?;
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM transactions WHERE source_doc_id = ?1 AND source_hash = ?2 LIMIT 1",
            params![doc_id, source_hash],
            |r| r.get(0),
        )
        .ok();
    Ok(found.is_some())
}

pub fn recent_transactions(
    layout: &Layout,
    limit: i64,
    include_deleted: bool,
) -> Result<Vec<Value>> {
    let conn = connect(&layout.index_db_path())?;
    ensure_index_schema(&conn)?;
    let where_clause = if include_deleted { "" } else { "WHERE is_deleted = 0" };
    let sql = format!(
        "SELECT raw_json FROM transactions {} ORDER BY COALESCE(occurred_at, ''), COALESCE(updated_at, '') DESC LIMIT ?1",
        where_clause
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![limit], |row| row.get::<_, String>(0))?;
    let mut out = Vec::new();
    for r in rows {
        if let Ok(raw) = r {
            if let Ok(v) = serde_json::from_str::<Value>(&raw) {
                out.push(v);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_layout() -> (tempfile::TempDir, Layout) {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        (dir, layout)
    }

    #[test]
    fn upsert_then_query_roundtrips() {
        let conn = connect(&std::env::temp_dir().join(format!("ix-{}.db", crate::ids::ulid()))).unwrap();
        ensure_index_schema(&conn).unwrap();
        let tx = json!({
            "txId": "tx_1",
            "occurredAt": "2026-07-01T00:00:00Z",
            "amount": {"value": "12.50", "currency": "USD"},
            "source": {"sourceType": "bank", "docId": "doc_1", "sourceHash": "abc"},
        });
        upsert_transaction(&conn, &tx, "2026-07-01T00:00:00Z").unwrap();
        let has: i64 = conn
            .query_row("SELECT COUNT(*) FROM transactions WHERE tx_id='tx_1'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(has, 1);
    }

    #[test]
    fn apply_correction_patches_amount() {
        let conn = connect(&std::env::temp_dir().join(format!("ix-{}.db", crate::ids::ulid()))).unwrap();
        ensure_index_schema(&conn).unwrap();
        let tx = json!({"txId": "tx_2", "amount": {"value": "10", "currency": "USD"}});
        upsert_transaction(&conn, &tx, "t0").unwrap();
        let evt = json!({"eventId": "evt_1", "txId": "tx_2", "type": "patch", "patch": {"amount": {"value": "20"}}});
        apply_correction_event(&conn, &evt, "t1").unwrap();
        let amount: String = conn
            .query_row("SELECT amount_value FROM transactions WHERE tx_id='tx_2'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(amount, "20");
    }

    #[test]
    fn apply_tombstone_marks_deleted() {
        let conn = connect(&std::env::temp_dir().join(format!("ix-{}.db", crate::ids::ulid()))).unwrap();
        ensure_index_schema(&conn).unwrap();
        let tx = json!({"txId": "tx_3", "amount": {"value": "5", "currency": "USD"}});
        upsert_transaction(&conn, &tx, "t0").unwrap();
        let evt = json!({"eventId": "evt_2", "txId": "tx_3", "type": "tombstone"});
        apply_correction_event(&conn, &evt, "t1").unwrap();
        let deleted: i64 = conn
            .query_row("SELECT is_deleted FROM transactions WHERE tx_id='tx_3'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(deleted, 1);
    }

    #[test]
    fn rebuild_from_empty_layout_is_zero() {
        let (_dir, layout) = test_layout();
        let stats = rebuild_index(&layout).unwrap();
        assert_eq!(stats.transactions_indexed, 0);
        assert_eq!(stats.corrections_indexed, 0);
        assert_eq!(stats.sources_indexed, 0);
    }

    #[test]
    fn has_source_hash_false_when_absent() {
        let (_dir, layout) = test_layout();
        assert!(!has_source_hash(&layout, "doc_x", "hash_x").unwrap());
    }
}
