//! Field accessors shared by the reducer, index, and alert engine. A
//! transaction record is a loosely-typed JSON object on disk; these
//! helpers are the single place that knows its shape.

use crate::money::decimal_from_any;
use crate::timeutil::parse_ymd;
use bigdecimal::BigDecimal;
use serde_json::Value;

fn str_of(v: &Value, key: &str) -> String {
    v.get(key).and_then(|x| x.as_str()).unwrap_or("").to_string()
}

pub fn tx_date(tx: &Value) -> String {
    let occurred = str_of(tx, "occurredAt");
    if !occurred.is_empty() {
        return occurred;
    }
    str_of(tx, "postedAt")
}

pub fn tx_month(tx: &Value) -> String {
    let d = tx_date(tx);
    if d.len() >= 7 {
        d[..7].to_string()
    } else {
        String::new()
    }
}

pub fn tx_amount_decimal(tx: &Value) -> BigDecimal {
    let empty = Value::Object(Default::default());
    let amt = tx.get("amount").unwrap_or(&empty);
    decimal_from_any(amt.get("value").unwrap_or(&Value::Null))
}

pub fn tx_currency(tx: &Value) -> String {
    tx.get("amount").map(|a| str_of(a, "currency")).unwrap_or_default()
}

pub fn tx_category_id(tx: &Value) -> String {
    tx.get("category").map(|c| str_of(c, "id")).unwrap_or_default()
}

pub fn tx_category_confidence(tx: &Value) -> f64 {
    tx.get("category")
        .and_then(|c| c.get("confidence"))
        .and_then(|v| v.as_f64())
        .unwrap_or(0.0)
}

pub fn tx_merchant(tx: &Value) -> String {
    let merchant = str_of(tx, "merchant").trim().to_string();
    if !merchant.is_empty() {
        return merchant;
    }
    str_of(tx, "description").trim().to_string()
}

pub fn tx_source_type(tx: &Value) -> String {
    tx.get("source").map(|s| str_of(s, "sourceType")).unwrap_or_default()
}

/// Inclusive list of ISO dates from `from_date` to `to_date`.
pub fn daterange(from_date: &str, to_date: &str) -> anyhow::Result<Vec<String>> {
    let start = parse_ymd(from_date)?;
    let end = parse_ymd(to_date)?;
    anyhow::ensure!(end >= start, "to_date must be >= from_date");
    let mut out = Vec::new();
    let mut cur = start;
    while cur <= end {
        out.push(cur.format("%Y-%m-%d").to_string());
        cur = cur.succ_opt().expect("date arithmetic stays in range for realistic spans");
    }
    Ok(out)
}
