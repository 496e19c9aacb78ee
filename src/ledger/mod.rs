//! The append-only transaction ledger: event store plus a pure,
//! deterministic reducer that replays corrections on top of raw
//! transactions. Transactions and corrections are never mutated in
//! place; a correction is itself an appended event.

mod reducer;

pub use reducer::{apply_corrections, LedgerView};
pub(crate) use reducer::deep_merge_inplace;

use crate::layout::Layout;
use crate::{index, logging, storage};
use anyhow::Result;
use serde_json::Value;

/// Appends a raw transaction to the ledger and best-effort mirrors it
/// into the secondary index. Index failures never fail the append: the
/// JSONL file is the durable record.
pub fn append_transaction(layout: &Layout, tx: &Value) -> Result<()> {
    storage::append_jsonl(&layout.transactions_path(), tx)?;
    let tx_id = tx.get("txId").and_then(|v| v.as_str()).unwrap_or("");
    logging::log_ledger_append("transaction", tx_id, None);
    if let Err(e) = mirror_transaction(layout, tx) {
        logging::log_index_update_failed("transactions", tx_id, &e.to_string());
    }
    Ok(())
}

/// Appends a correction event and best-effort mirrors it into the index.
pub fn append_correction(layout: &Layout, evt: &Value) -> Result<()> {
    storage::append_jsonl(&layout.corrections_path(), evt)?;
    let tx_id = evt.get("txId").and_then(|v| v.as_str()).unwrap_or("");
    logging::log_ledger_append("correction", tx_id, None);
    if let Err(e) = mirror_correction(layout, evt) {
        logging::log_index_update_failed("corrections", tx_id, &e.to_string());
    }
    Ok(())
}

fn mirror_transaction(layout: &Layout, tx: &Value) -> Result<()> {
    let conn = index::connect(&layout.index_db_path())?;
    index::ensure_index_schema(&conn)?;
    let now = crate::timeutil::utc_now_iso();
    index::upsert_transaction(&conn, tx, &now)
}

fn mirror_correction(layout: &Layout, evt: &Value) -> Result<()> {
    let conn = index::connect(&layout.index_db_path())?;
    index::ensure_index_schema(&conn)?;
    let now = crate::timeutil::utc_now_iso();
    index::apply_correction_event(&conn, evt, &now)
}

/// Loads the full ledger view by replaying transactions and corrections
/// from the JSONL logs (not the index — this is the source-of-truth read
/// path; the index exists purely to accelerate queries).
pub fn load_ledger(layout: &Layout, include_deleted: bool) -> Result<LedgerView> {
    let txs = storage::iter_jsonl(&layout.transactions_path())?;
    let corrections = storage::iter_jsonl(&layout.corrections_path())?;
    Ok(apply_corrections(&txs, &corrections, include_deleted))
}
