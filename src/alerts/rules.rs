//! The six canonical alert rule evaluators. Each is a pure function over
//! the current ledger view and a rule's config: it either returns a
//! fired alert or `None`. Committing the event and updating per-rule
//! state is the caller's job (see `alerts::run_alerts`).

use crate::money::{decimal_from_any, fmt_decimal};
use crate::txutil::{tx_amount_decimal, tx_category_id, tx_date, tx_merchant};
use bigdecimal::{BigDecimal, Zero};
use chrono::{Datelike, Duration, NaiveDate};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::str::FromStr;

pub struct Fired {
    pub period: String,
    pub period_key: String,
    pub data: Value,
    pub message: String,
}

fn str_field(v: &Value, key: &str) -> String {
    v.get(key).and_then(|x| x.as_str()).unwrap_or("").trim().to_string()
}

pub fn period_key(period: &str, at: NaiveDate) -> Option<String> {
    match period {
        "day" => Some(at.format("%Y-%m-%d").to_string()),
        "month" => Some(format!("{:04}-{:02}", at.year(), at.month())),
        "week" => {
            let iso = at.iso_week();
            Some(format!("{:04}-W{:02}", iso.year(), iso.week()))
        }
        _ => None,
    }
}

pub fn period_bounds(period: &str, at: NaiveDate) -> Option<(NaiveDate, NaiveDate)> {
    match period {
        "day" => Some((at, at)),
        "month" => {
            let start = NaiveDate::from_ymd_opt(at.year(), at.month(), 1)?;
            let next_month = if at.month() == 12 {
                NaiveDate::from_ymd_opt(at.year() + 1, 1, 1)?
            } else {
                NaiveDate::from_ymd_opt(at.year(), at.month() + 1, 1)?
            };
            Some((start, next_month - Duration::days(1)))
        }
        "week" => {
            let weekday = at.weekday().num_days_from_monday() as i64;
            let start = at - Duration::days(weekday);
            Some((start, start + Duration::days(6)))
        }
        _ => None,
    }
}

fn in_range(d: &str, from_date: &str, to_date: &str) -> bool {
    !d.is_empty() && d >= from_date && d <= to_date
}

fn filter_by_date_range<'a>(txs: &'a [Value], from_date: &str, to_date: &str) -> Vec<&'a Value> {
    txs.iter().filter(|tx| in_range(&tx_date(tx), from_date, to_date)).collect()
}

fn sum_category_spend(txs: &[&Value], category_id: &str) -> (BigDecimal, Vec<String>) {
    let mut total = BigDecimal::zero();
    let mut ids = Vec::new();
    for tx in txs {
        if tx_category_id(tx) != category_id {
            continue;
        }
        let amt = tx_amount_decimal(tx);
        if amt >= BigDecimal::zero() {
            continue;
        }
        total -= &amt;
        if let Some(id) = tx.get("txId").and_then(|v| v.as_str()) {
            ids.push(id.to_string());
        }
    }
    (total, ids)
}

pub fn category_budget(txs: &[Value], rule: &Value, at: NaiveDate, state_rule: &Value) -> Option<Fired> {
    let category_id = str_field(rule, "categoryId");
    let period = str_field(rule, "period");
    let limit = decimal_from_any(rule.get("limit").unwrap_or(&Value::Null));
    if category_id.is_empty() || period.is_empty() {
        return None;
    }
    let key = period_key(&period, at)?;
    if state_rule.get("lastTriggeredPeriodKey").and_then(|v| v.as_str()) == Some(key.as_str()) {
        return None;
    }
    let (start, end) = period_bounds(&period, at)?;
    let scoped = filter_by_date_range(txs, &start.format("%Y-%m-%d").to_string(), &end.format("%Y-%m-%d").to_string());
    let (spend, tx_ids) = sum_category_spend(&scoped, &category_id);
    if spend <= limit {
        return None;
    }
    let message = format!(
        "{} spend {} exceeded limit {} for {} {}",
        category_id,
        fmt_decimal(&spend),
        fmt_decimal(&limit),
        period,
        key
    );
    Some(Fired {
        period,
        period_key: key,
        data: json!({
            "categoryId": category_id,
            "limit": fmt_decimal(&limit),
            "value": fmt_decimal(&spend),
            "txIds": tx_ids.into_iter().take(500).collect::<Vec<_>>(),
        }),
        message,
    })
}

fn tx_currency_str(tx: &Value) -> String {
    tx.get("amount").and_then(|a| a.get("currency")).and_then(|v| v.as_str()).unwrap_or("").to_string()
}

pub fn recurring_new(txs: &[Value], rule: &Value, at: NaiveDate, state_rule: &Value) -> Option<Fired> {
    let min_occ = rule.get("minOccurrences").and_then(|v| v.as_u64()).unwrap_or(3) as usize;
    let spacing = rule
        .get("spacingDays")
        .and_then(|v| v.as_array())
        .filter(|a| a.len() == 2)
        .map(|a| (a[0].as_i64().unwrap_or(25), a[1].as_i64().unwrap_or(35)))
        .unwrap_or((25, 35));

    let key = period_key("month", at)?;
    if state_rule.get("lastTriggeredPeriodKey").and_then(|v| v.as_str()) == Some(key.as_str()) {
        return None;
    }

    let start = at - Duration::days(180);
    let scoped = filter_by_date_range(txs, &start.format("%Y-%m-%d").to_string(), &at.format("%Y-%m-%d").to_string());

    let mut groups: BTreeMap<(String, String, String), Vec<String>> = BTreeMap::new();
    for tx in &scoped {
        let amt = tx_amount_decimal(tx);
        if amt >= BigDecimal::zero() {
            continue;
        }
        let merchant = tx_merchant(tx);
        if merchant.is_empty() {
            continue;
        }
        let ccy = tx_currency_str(tx);
        let key = (merchant.to_lowercase(), fmt_decimal(&-amt), ccy);
        groups.entry(key).or_default().push(tx_date(tx));
    }

    let mut new_found = Vec::new();
    for ((merchant, amt_s, ccy), dates) in groups {
        let mut sorted_dates: Vec<String> = dates.into_iter().filter(|d| !d.is_empty()).collect();
        sorted_dates.sort();
        sorted_dates.dedup();
        if sorted_dates.len() < min_occ {
            continue;
        }
        let tail = &sorted_dates[sorted_dates.len() - min_occ..];
        let mut ok = true;
        for pair in tail.windows(2) {
            let a = NaiveDate::parse_from_str(&pair[0], "%Y-%m-%d").ok();
            let b = NaiveDate::parse_from_str(&pair[1], "%Y-%m-%d").ok();
            let (Some(a), Some(b)) = (a, b) else { ok = false; break };
            let delta = (b - a).num_days();
            if delta < spacing.0 || delta > spacing.1 {
                ok = false;
                break;
            }
        }
        if !ok {
            continue;
        }
        let Ok(first_tail) = NaiveDate::parse_from_str(&tail[0], "%Y-%m-%d") else { continue };
        let has_prior = sorted_dates.iter().any(|d| {
            NaiveDate::parse_from_str(d, "%Y-%m-%d").map(|parsed| parsed < first_tail).unwrap_or(false)
        });
        if has_prior {
            continue;
        }
        new_found.push(json!({"merchant": merchant, "amount": amt_s, "currency": ccy, "dates": tail}));
    }

    if new_found.is_empty() {
        return None;
    }
    let message = format!("New recurring charges detected: {}", new_found.len());
    Some(Fired {
        period: "month".to_string(),
        period_key: key,
        data: json!({"items": new_found.into_iter().take(50).collect::<Vec<_>>()}),
        message,
    })
}

pub fn recurring_changed(txs: &[Value], rule: &Value, at: NaiveDate, state_rule: &Value) -> Option<Fired> {
    let min_occ = rule.get("minOccurrences").and_then(|v| v.as_u64()).unwrap_or(3) as usize;
    let spacing = rule
        .get("spacingDays")
        .and_then(|v| v.as_array())
        .filter(|a| a.len() == 2)
        .map(|a| (a[0].as_i64().unwrap_or(25), a[1].as_i64().unwrap_or(35)))
        .unwrap_or((25, 35));
    let min_delta = decimal_from_any(rule.get("minDelta").unwrap_or(&Value::Null));
    let min_delta_pct = decimal_from_any(rule.get("minDeltaPct").unwrap_or(&Value::Null));

    let key = period_key("month", at)?;
    if state_rule.get("lastTriggeredPeriodKey").and_then(|v| v.as_str()) == Some(key.as_str()) {
        return None;
    }

    let start = at - Duration::days(240);
    let scoped = filter_by_date_range(txs, &start.format("%Y-%m-%d").to_string(), &at.format("%Y-%m-%d").to_string());

    let mut groups: BTreeMap<(String, String), Vec<(String, BigDecimal)>> = BTreeMap::new();
    for tx in &scoped {
        let amt = tx_amount_decimal(tx);
        if amt >= BigDecimal::zero() {
            continue;
        }
        let merchant = tx_merchant(tx);
        if merchant.is_empty() {
            continue;
        }
        let ccy = tx_currency_str(tx);
        groups.entry((merchant.to_lowercase(), ccy)).or_default().push((tx_date(tx), -amt));
    }

    let mut changed = Vec::new();
    for ((merchant, ccy), mut entries) in groups {
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries.dedup_by(|a, b| a.0 == b.0);
        if entries.len() < min_occ {
            continue;
        }
        let tail = &entries[entries.len() - min_occ..];
        let mut ok = true;
        for pair in tail.windows(2) {
            let a = NaiveDate::parse_from_str(&pair[0].0, "%Y-%m-%d").ok();
            let b = NaiveDate::parse_from_str(&pair[1].0, "%Y-%m-%d").ok();
            let (Some(a), Some(b)) = (a, b) else { ok = false; break };
            let delta = (b - a).num_days();
            if delta < spacing.0 || delta > spacing.1 {
                ok = false;
                break;
            }
        }
        if !ok || tail.len() < 2 {
            continue;
        }
        let prev = &tail[tail.len() - 2].1;
        let last = &tail[tail.len() - 1].1;
        let delta = last - prev;
        let abs_delta = if delta < BigDecimal::zero() { -delta.clone() } else { delta.clone() };
        let delta_pct = if prev.is_zero() {
            BigDecimal::zero()
        } else {
            &abs_delta * BigDecimal::from(100) / prev
        };
        if abs_delta >= min_delta || delta_pct >= min_delta_pct {
            changed.push(json!({
                "merchant": merchant,
                "currency": ccy,
                "previousAmount": fmt_decimal(prev),
                "newAmount": fmt_decimal(last),
                "delta": fmt_decimal(&delta),
            }));
        }
    }

    if changed.is_empty() {
        return None;
    }
    let message = format!("Recurring charge amount changed: {}", changed.len());
    Some(Fired {
        period: "month".to_string(),
        period_key: key,
        data: json!({"items": changed}),
        message,
    })
}

pub fn merchant_spike(txs: &[Value], rule: &Value, at: NaiveDate, state_rule: &Value) -> Option<Fired> {
    let period = str_field(rule, "period");
    if period.is_empty() {
        return None;
    }
    let lookback = rule.get("lookbackPeriods").and_then(|v| v.as_u64()).unwrap_or(4).max(1);
    let multiplier = match rule.get("multiplier") {
        Some(v) if !v.is_null() => decimal_from_any(v),
        _ => BigDecimal::from_str("2").expect("literal always parses"),
    };
    let min_delta = decimal_from_any(rule.get("minDelta").unwrap_or(&Value::Null));
    let merchant_filter = rule.get("merchant").and_then(|v| v.as_str()).map(|m| m.to_lowercase());

    let key = period_key(&period, at)?;
    if state_rule.get("lastTriggeredPeriodKey").and_then(|v| v.as_str()) == Some(key.as_str()) {
        return None;
    }

    let (cur_start, cur_end) = period_bounds(&period, at)?;
    let cur_scoped = filter_by_date_range(txs, &cur_start.format("%Y-%m-%d").to_string(), &cur_end.format("%Y-%m-%d").to_string());

    let mut current: BTreeMap<(String, String), BigDecimal> = BTreeMap::new();
    for tx in &cur_scoped {
        let amt = tx_amount_decimal(tx);
        if amt >= BigDecimal::zero() {
            continue;
        }
        let merchant = tx_merchant(tx).to_lowercase();
        if merchant.is_empty() {
            continue;
        }
        if let Some(filter) = &merchant_filter {
            if &merchant != filter {
                continue;
            }
        }
        let ccy = tx_currency_str(tx);
        *current.entry((merchant, ccy)).or_insert_with(BigDecimal::zero) -= &amt;
    }

    let span_days = (cur_end - cur_start).num_days() + 1;
    let mut fired_items = Vec::new();
    for ((merchant, ccy), cur_total) in &current {
        let mut prior_sum = BigDecimal::zero();
        for i in 1..=lookback {
            let offset = span_days * i as i64;
            let Some(prior_at) = cur_start.checked_sub_signed(Duration::days(offset)) else { continue };
            let Some((p_start, p_end)) = period_bounds(&period, prior_at) else { continue };
            let p_scoped = filter_by_date_range(txs, &p_start.format("%Y-%m-%d").to_string(), &p_end.format("%Y-%m-%d").to_string());
            let mut total = BigDecimal::zero();
            for tx in &p_scoped {
                let amt = tx_amount_decimal(tx);
                if amt >= BigDecimal::zero() {
                    continue;
                }
                if tx_merchant(tx).to_lowercase() != *merchant || tx_currency_str(tx) != *ccy {
                    continue;
                }
                total -= &amt;
            }
            prior_sum += total;
        }
        let avg = &prior_sum / BigDecimal::from(lookback);
        let delta = cur_total - &avg;
        if *cur_total > &multiplier * &avg && delta > min_delta {
            fired_items.push(json!({
                "merchant": merchant,
                "currency": ccy,
                "current": fmt_decimal(cur_total),
                "average": fmt_decimal(&avg),
            }));
        }
    }

    if fired_items.is_empty() {
        return None;
    }
    let message = format!("Merchant spend spike detected: {}", fired_items.len());
    Some(Fired {
        period,
        period_key: key,
        data: json!({"items": fired_items}),
        message,
    })
}

pub fn cash_heavy_day(txs: &[Value], rule: &Value, at: NaiveDate, state_rule: &Value) -> Option<Fired> {
    let limit = decimal_from_any(rule.get("limit").unwrap_or(&Value::Null));
    let key = period_key("day", at)?;
    if state_rule.get("lastTriggeredPeriodKey").and_then(|v| v.as_str()) == Some(key.as_str()) {
        return None;
    }
    let scoped = filter_by_date_range(txs, &key, &key);
    let mut total = BigDecimal::zero();
    let mut tx_ids = Vec::new();
    for tx in &scoped {
        let amt = tx_amount_decimal(tx);
        if amt >= BigDecimal::zero() {
            continue;
        }
        let is_manual = tx.get("source").and_then(|s| s.get("sourceType")).and_then(|v| v.as_str()) == Some("manual");
        let has_cash_tag = tx
            .get("tags")
            .and_then(|v| v.as_array())
            .map(|tags| tags.iter().any(|t| t.as_str() == Some("cash")))
            .unwrap_or(false);
        if !is_manual && !has_cash_tag {
            continue;
        }
        total -= &amt;
        if let Some(id) = tx.get("txId").and_then(|v| v.as_str()) {
            tx_ids.push(id.to_string());
        }
    }
    if total <= limit {
        return None;
    }
    let message = format!("Cash-heavy day spend {} exceeded limit {} on {}", fmt_decimal(&total), fmt_decimal(&limit), key);
    Some(Fired {
        period: "day".to_string(),
        period_key: key,
        data: json!({"limit": fmt_decimal(&limit), "value": fmt_decimal(&total), "txIds": tx_ids.into_iter().take(500).collect::<Vec<_>>()}),
        message,
    })
}

pub fn unclassified_spend(txs: &[Value], rule: &Value, at: NaiveDate, state_rule: &Value) -> Option<Fired> {
    let period = str_field(rule, "period");
    if period.is_empty() {
        return None;
    }
    let threshold = rule.get("categoryConfidenceBelow").and_then(|v| v.as_f64()).unwrap_or(0.0);
    let limit = decimal_from_any(rule.get("limit").unwrap_or(&Value::Null));

    let key = period_key(&period, at)?;
    if state_rule.get("lastTriggeredPeriodKey").and_then(|v| v.as_str()) == Some(key.as_str()) {
        return None;
    }
    let (start, end) = period_bounds(&period, at)?;
    let scoped = filter_by_date_range(txs, &start.format("%Y-%m-%d").to_string(), &end.format("%Y-%m-%d").to_string());

    let mut total = BigDecimal::zero();
    let mut tx_ids = Vec::new();
    for tx in &scoped {
        let amt = tx_amount_decimal(tx);
        if amt >= BigDecimal::zero() {
            continue;
        }
        let category_id = tx_category_id(tx);
        let confidence = tx.get("category").and_then(|c| c.get("confidence")).and_then(|v| v.as_f64()).unwrap_or(0.0);
        let is_unclassified = category_id.is_empty() || category_id == "uncategorized";
        if !is_unclassified && confidence >= threshold {
            continue;
        }
        total -= &amt;
        if let Some(id) = tx.get("txId").and_then(|v| v.as_str()) {
            tx_ids.push(id.to_string());
        }
    }
    if total <= limit {
        return None;
    }
    let message = format!(
        "Unclassified spend {} exceeded limit {} for {} {}",
        fmt_decimal(&total),
        fmt_decimal(&limit),
        period,
        key
    );
    Some(Fired {
        period,
        period_key: key,
        data: json!({"limit": fmt_decimal(&limit), "value": fmt_decimal(&total), "txIds": tx_ids.into_iter().take(500).collect::<Vec<_>>()}),
        message,
    })
}

pub fn evaluate(rule_type: &str, txs: &[Value], rule: &Value, at: NaiveDate, state_rule: &Value) -> Option<Fired> {
    match rule_type {
        "category_budget" => category_budget(txs, rule, at, state_rule),
        "recurring_new" => recurring_new(txs, rule, at, state_rule),
        "recurring_changed" => recurring_changed(txs, rule, at, state_rule),
        "merchant_spike" => merchant_spike(txs, rule, at, state_rule),
        "cash_heavy_day" => cash_heavy_day(txs, rule, at, state_rule),
        "unclassified_spend" => unclassified_spend(txs, rule, at, state_rule),
        _ => None,
    }
}

#[allow(dead_code)]
fn zero() -> BigDecimal {
    BigDecimal::from_str("0").expect("literal always parses")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn category_budget_fires_when_over_limit() {
        let txs = vec![json!({
            "txId": "tx_1",
            "occurredAt": "2026-02-10",
            "amount": {"value": "-12.30", "currency": "USD"},
            "category": {"id": "groceries"},
        })];
        let rule = json!({"id": "r1", "type": "category_budget", "categoryId": "groceries", "period": "month", "limit": "10"});
        let fired = category_budget(&txs, &rule, d("2026-02-10"), &Value::Null);
        assert!(fired.is_some());
    }

    #[test]
    fn category_budget_dedups_on_same_period_key() {
        let txs = vec![json!({
            "txId": "tx_1", "occurredAt": "2026-02-10",
            "amount": {"value": "-12.30", "currency": "USD"}, "category": {"id": "groceries"},
        })];
        let rule = json!({"id": "r1", "type": "category_budget", "categoryId": "groceries", "period": "month", "limit": "10"});
        let state_rule = json!({"lastTriggeredPeriodKey": "2026-02"});
        assert!(category_budget(&txs, &rule, d("2026-02-10"), &state_rule).is_none());
    }

    #[test]
    fn cash_heavy_day_requires_manual_or_cash_tag() {
        let txs = vec![
            json!({"txId": "tx_1", "occurredAt": "2026-02-10", "amount": {"value": "-60"}, "source": {"sourceType": "manual"}}),
            json!({"txId": "tx_2", "occurredAt": "2026-02-10", "amount": {"value": "-60"}, "source": {"sourceType": "bank"}}),
        ];
        let rule = json!({"id": "cash", "type": "cash_heavy_day", "limit": "50"});
        let fired = cash_heavy_day(&txs, &rule, d("2026-02-10"), &Value::Null).unwrap();
        assert_eq!(fired.data["value"], "60");
    }

    #[test]
    fn unclassified_spend_counts_low_confidence_and_empty_category() {
        let txs = vec![json!({
            "txId": "tx_1", "occurredAt": "2026-02-10",
            "amount": {"value": "-20"}, "category": {"id": "shopping", "confidence": 0.1},
        })];
        let rule = json!({"id": "u1", "type": "unclassified_spend", "period": "month", "categoryConfidenceBelow": 0.5, "limit": "5"});
        assert!(unclassified_spend(&txs, &rule, d("2026-02-10"), &Value::Null).is_some());
    }

    #[test]
    fn period_bounds_month_spans_whole_month() {
        let (start, end) = period_bounds("month", d("2026-02-10")).unwrap();
        assert_eq!(start, d("2026-02-01"));
        assert_eq!(end, d("2026-02-28"));
    }
}
