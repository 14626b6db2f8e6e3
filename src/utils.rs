//! Small helpers.

use chrono::NaiveDate;

use crate::types::TimeInForce;

pub fn tif_from_str(s: &str) -> TimeInForce {
    match s.to_ascii_uppercase().as_str() {
        "GTC" => TimeInForce::GoodTillCancel,
        _ => TimeInForce::Day,
    }
}

pub fn sanitize_symbol(sym: &str) -> String {
    sym.trim().to_uppercase()
}

/// Parse broker expiry strings: "2025-08-16", "2025/08/16", "20250816" or an ISO timestamp.
pub fn parse_expiry_date(s: &str) -> Option<NaiveDate> {
    let d: String = s
        .trim()
        .chars()
        .take_while(|c| *c != 'T' && *c != ' ')
        .filter(|c| c.is_ascii_digit())
        .collect();
    if d.len() != 8 {
        return None;
    }
    NaiveDate::parse_from_str(&d, "%Y%m%d").ok()
}

/// Strikes compare equal within a tenth of a cent.
pub fn same_strike(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-3
}
