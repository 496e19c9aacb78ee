//! Exact-decimal monetary values. Sums, comparisons, and percentage
//! computations for money never go through binary floating point; values
//! are carried as canonical decimal strings on disk and in records.

use bigdecimal::BigDecimal;
use serde_json::Value;
use std::str::FromStr;

fn zero() -> BigDecimal {
    BigDecimal::from_str("0").expect("literal \"0\" always parses")
}

pub fn decimal_from_any(value: &Value) -> BigDecimal {
    match value {
        Value::String(s) => BigDecimal::from_str(s).unwrap_or_else(|_| zero()),
        Value::Number(n) => {
            // Route numbers through their string form, never through f64 math,
            // so a JSON float literal doesn't introduce binary rounding error.
            BigDecimal::from_str(&n.to_string()).unwrap_or_else(|_| zero())
        }
        _ => zero(),
    }
}

pub fn fmt_decimal(d: &BigDecimal) -> String {
    d.normalized().to_string()
}
