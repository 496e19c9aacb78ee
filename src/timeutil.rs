//! Timestamp helpers. All times are UTC, second precision, `Z` suffix.

use chrono::{NaiveDate, Utc};

pub fn utc_now_iso() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

pub fn today_ymd() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}

pub fn parse_ymd(value: &str) -> Result<NaiveDate, chrono::ParseError> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utc_now_iso_ends_with_z() {
        assert!(utc_now_iso().ends_with('Z'));
    }

    #[test]
    fn parse_ymd_rejects_malformed_dates() {
        assert!(parse_ymd("2026-13-40").is_err());
        assert!(parse_ymd("2026-07-01").is_ok());
    }
}
