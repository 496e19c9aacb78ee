//! Alert rule evaluation: scans the current ledger view against the
//! configured rules and appends any newly-fired events. Firing is
//! deduped per rule by `periodKey`, so re-running for the same date
//! never double-fires a rule that has already triggered for its period.

pub mod delivery;
pub mod rules;

use crate::layout::Layout;
use crate::{ids, ledger, logging, storage, timeutil};
use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde_json::{json, Value};

fn default_rules() -> Value {
    json!({"currency": "USD", "rules": []})
}

fn default_state() -> Value {
    json!({"version": 1, "lastRun": Value::Null, "rules": {}})
}

pub fn load_rules(layout: &Layout) -> Result<Value> {
    storage::read_json(&layout.alert_rules_path(), default_rules())
}

pub fn load_state(layout: &Layout) -> Result<Value> {
    storage::read_json(&layout.alert_state_path(), default_state())
}

pub fn save_state(layout: &Layout, state: &Value) -> Result<()> {
    storage::write_json(&layout.alert_state_path(), state)
}

pub struct RunResult {
    pub at: String,
    pub events: Vec<Value>,
    pub commit: bool,
}

/// Evaluates every configured rule against the current ledger view as of
/// `at_date`. When `commit` is true, fired events are appended and the
/// per-rule `lastTriggeredPeriodKey` is advanced so the same firing
/// window never fires twice.
pub fn run_alerts(layout: &Layout, at_date: &str, commit: bool) -> Result<RunResult> {
    let at = NaiveDate::parse_from_str(at_date, "%Y-%m-%d").context("invalid at_date")?;
    let rules_cfg = load_rules(layout)?;
    let mut state = load_state(layout)?;
    let view = ledger::load_ledger(layout, false)?;

    let mut events = Vec::new();
    let empty_rules = Vec::new();
    let rule_list = rules_cfg.get("rules").and_then(|v| v.as_array()).unwrap_or(&empty_rules);

    for rule in rule_list {
        let rule_id = rule.get("id").and_then(|v| v.as_str()).unwrap_or("").trim().to_string();
        let rule_type = rule.get("type").and_then(|v| v.as_str()).unwrap_or("").trim().to_string();
        if rule_id.is_empty() || rule_type.is_empty() {
            continue;
        }
        let state_rule = state
            .get("rules")
            .and_then(|r| r.get(&rule_id))
            .cloned()
            .unwrap_or(Value::Null);

        let Some(fired) = rules::evaluate(&rule_type, &view.transactions, rule, at, &state_rule) else {
            continue;
        };

        let event = json!({
            "eventId": ids::new_id("alrt"),
            "ruleId": rule_id,
            "type": rule_type,
            "period": fired.period,
            "periodKey": fired.period_key,
            "scopeDate": at_date,
            "at": timeutil::utc_now_iso(),
            "data": fired.data,
            "message": fired.message,
        });
        events.push(event.clone());

        if commit {
            storage::append_jsonl(&layout.alert_events_path(), &event)?;
            logging::log_alert_fired(&rule_id, &rule_type, &fired.period_key);
            logging::agg_increment("alert_fired");
            let rules_obj = state
                .as_object_mut()
                .unwrap()
                .entry("rules")
                .or_insert_with(|| json!({}));
            rules_obj[&rule_id] = json!({"lastTriggeredPeriodKey": fired.period_key});
        }
    }

    if commit {
        state["lastRun"] = json!(timeutil::utc_now_iso());
        save_state(layout, &state)?;
    }

    Ok(RunResult { at: at_date.to_string(), events, commit })
}

/// Returns all alert events whose `at` timestamp starts with `ymd`.
pub fn alerts_for_date(layout: &Layout, ymd: &str) -> Result<Vec<Value>> {
    let all = storage::iter_jsonl(&layout.alert_events_path())?;
    Ok(all
        .into_iter()
        .filter(|evt| evt.get("at").and_then(|v| v.as_str()).map(|s| s.starts_with(ymd)).unwrap_or(false))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_budget_fires_once_per_period() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let tx = json!({"txId": "tx_1", "occurredAt": "2026-02-10", "amount": {"value": "-12.30", "currency": "USD"}, "category": {"id": "groceries"}});
        ledger::append_transaction(&layout, &tx).unwrap();
        storage::write_json(
            &layout.alert_rules_path(),
            &json!({"currency": "USD", "rules": [{"id": "groceries_monthly", "type": "category_budget", "categoryId": "groceries", "period": "month", "limit": "10"}]}),
        )
        .unwrap();

        let first = run_alerts(&layout, "2026-02-10", true).unwrap();
        assert_eq!(first.events.len(), 1);

        let second = run_alerts(&layout, "2026-02-10", true).unwrap();
        assert_eq!(second.events.len(), 0);
    }

    #[test]
    fn dry_run_does_not_persist_state() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let tx = json!({"txId": "tx_1", "occurredAt": "2026-02-10", "amount": {"value": "-100"}, "category": {"id": "groceries"}});
        ledger::append_transaction(&layout, &tx).unwrap();
        storage::write_json(
            &layout.alert_rules_path(),
            &json!({"rules": [{"id": "g", "type": "category_budget", "categoryId": "groceries", "period": "month", "limit": "10"}]}),
        )
        .unwrap();

        let result = run_alerts(&layout, "2026-02-10", false).unwrap();
        assert_eq!(result.events.len(), 1);
        assert!(!layout.alert_events_path().exists());
    }
}
