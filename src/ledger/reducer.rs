//! Pure reducer: given the raw transaction and correction event streams,
//! produces the current ledger view. No I/O; deterministic given the
//! same two input slices in the same order.

use serde_json::Value;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone)]
pub struct LedgerView {
    pub transactions: Vec<Value>,
    pub deleted_tx_ids: HashSet<String>,
    pub applied_corrections: u64,
}

/// Recursively merges `patch` into `dst` in place: objects merge key by
/// key, any other value (including arrays) replaces the destination
/// outright. Shared between the reducer and the secondary index
/// projector so the two never drift on patch semantics.
pub(crate) fn deep_merge_inplace(dst: &mut Value, patch: &Value) {
    let (Value::Object(dst_map), Value::Object(patch_map)) = (dst, patch) else {
        return;
    };
    for (k, v) in patch_map {
        match (dst_map.get_mut(k), v) {
            (Some(existing @ Value::Object(_)), Value::Object(_)) => deep_merge_inplace(existing, v),
            _ => {
                dst_map.insert(k.clone(), v.clone());
            }
        }
    }
}

/// Applies corrections to transactions in event order, deterministically.
/// Unknown correction types are ignored for forward compatibility. When
/// `include_deleted` is false, tombstoned transactions are dropped from
/// the returned list but still counted in `deleted_tx_ids`.
pub fn apply_corrections(transactions: &[Value], corrections: &[Value], include_deleted: bool) -> LedgerView {
    let mut tx_list: Vec<Value> = Vec::new();
    let mut index_by_id: HashMap<String, usize> = HashMap::new();

    for tx in transactions {
        let tx_id = match tx.get("txId").and_then(|v| v.as_str()) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => continue,
        };
        index_by_id.insert(tx_id, tx_list.len());
        tx_list.push(tx.clone());
    }

    let mut deleted: HashSet<String> = HashSet::new();
    let mut applied = 0u64;

    for evt in corrections {
        let tx_id = match evt.get("txId").and_then(|v| v.as_str()) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => continue,
        };
        let Some(&idx) = index_by_id.get(&tx_id) else {
            continue;
        };
        let evt_type = evt.get("type").and_then(|v| v.as_str()).unwrap_or("patch");
        match evt_type {
            "patch" => {
                if let Some(patch) = evt.get("patch").filter(|p| p.is_object() && !p.as_object().unwrap().is_empty()) {
                    deep_merge_inplace(&mut tx_list[idx], patch);
                    applied += 1;
                }
            }
            "tombstone" | "delete" => {
                deleted.insert(tx_id);
                applied += 1;
            }
            _ => continue,
        }
    }

    if include_deleted {
        return LedgerView { transactions: tx_list, deleted_tx_ids: deleted, applied_corrections: applied };
    }

    let filtered: Vec<Value> = tx_list
        .into_iter()
        .filter(|tx| {
            let id = tx.get("txId").and_then(|v| v.as_str()).unwrap_or("");
            !deleted.contains(id)
        })
        .collect();
    LedgerView { transactions: filtered, deleted_tx_ids: deleted, applied_corrections: applied }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn patch_deep_merges_nested_fields() {
        let txs = vec![json!({"txId": "tx_1", "amount": {"value": "10", "currency": "USD"}})];
        let corrections = vec![json!({"txId": "tx_1", "type": "patch", "patch": {"amount": {"value": "20"}}})];
        let view = apply_corrections(&txs, &corrections, false);
        assert_eq!(view.transactions[0]["amount"]["value"], "20");
        assert_eq!(view.transactions[0]["amount"]["currency"], "USD");
        assert_eq!(view.applied_corrections, 1);
    }

    #[test]
    fn tombstone_removes_transaction_unless_include_deleted() {
        let txs = vec![json!({"txId": "tx_1"}), json!({"txId": "tx_2"})];
        let corrections = vec![json!({"txId": "tx_1", "type": "tombstone"})];

        let view = apply_corrections(&txs, &corrections, false);
        assert_eq!(view.transactions.len(), 1);
        assert_eq!(view.transactions[0]["txId"], "tx_2");
        assert!(view.deleted_tx_ids.contains("tx_1"));

        let with_deleted = apply_corrections(&txs, &corrections, true);
        assert_eq!(with_deleted.transactions.len(), 2);
    }

    #[test]
    fn unknown_correction_type_is_ignored() {
        let txs = vec![json!({"txId": "tx_1", "amount": {"value": "10"}})];
        let corrections = vec![json!({"txId": "tx_1", "type": "reclassify", "patch": {"amount": {"value": "999"}}})];
        let view = apply_corrections(&txs, &corrections, false);
        assert_eq!(view.applied_corrections, 0);
        assert_eq!(view.transactions[0]["amount"]["value"], "10");
    }

    #[test]
    fn empty_patch_object_does_not_increment_applied_corrections() {
        let txs = vec![json!({"txId": "tx_1", "amount": {"value": "10"}})];
        let corrections = vec![json!({"txId": "tx_1", "type": "patch", "patch": {}})];
        let view = apply_corrections(&txs, &corrections, false);
        assert_eq!(view.applied_corrections, 0);
    }

    #[test]
    fn correction_for_unknown_tx_id_is_ignored() {
        let txs = vec![json!({"txId": "tx_1"})];
        let corrections = vec![json!({"txId": "tx_missing", "type": "tombstone"})];
        let view = apply_corrections(&txs, &corrections, false);
        assert_eq!(view.applied_corrections, 0);
        assert_eq!(view.transactions.len(), 1);
    }
}
