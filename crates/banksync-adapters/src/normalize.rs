//! Shared helpers for turning provider documents into canonical values.

use std::str::FromStr;

use banksync_core::{AccountKind, Direction};
use chrono::{DateTime, NaiveDate};
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;

/// Output of a normalizer pass: the records that parsed plus one warning per skipped record.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized<T> {
    pub records: Vec<T>,
    pub warnings: Vec<String>,
}

impl<T> Default for Normalized<T> {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            warnings: Vec::new(),
        }
    }
}

impl<T> Normalized<T> {
    pub fn push_result(&mut self, label: &str, index: usize, result: Result<T, String>) {
        match result {
            Ok(record) => self.records.push(record),
            Err(reason) => self
                .warnings
                .push(format!("skipped malformed {label} #{index}: {reason}")),
        }
    }
}

pub fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    if cur.is_null() {
        None
    } else {
        Some(cur)
    }
}

pub fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    json_at(value, path)?.as_str()
}

/// Non-empty trimmed string at `path`.
pub fn json_text(value: &JsonValue, path: &[&str]) -> Option<String> {
    json_str(value, path)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

/// Id-like scalar at `path`; numbers are accepted and rendered as text.
pub fn json_id(value: &JsonValue, path: &[&str]) -> Option<String> {
    match json_at(value, path)? {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Plain decimal from a JSON number or numeric string ("12.30", "-4", "1e2").
pub fn decimal_from_json(value: &JsonValue) -> Option<Decimal> {
    let text = match value {
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Number(n) => n.to_string(),
        _ => return None,
    };
    if text.is_empty() {
        return None;
    }
    Decimal::from_str_exact(&text)
        .or_else(|_| Decimal::from_str(&text))
        .or_else(|_| Decimal::from_scientific(&text))
        .ok()
}

fn integer_from_json(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::String(s) => s.trim().parse().ok(),
        JsonValue::Number(n) => n.as_i64(),
        _ => None,
    }
}

/// Integer + scale pair, e.g. `{"unscaledValue": "-1050", "scale": "2"}` → -10.50.
pub fn decimal_from_scaled(unscaled: &JsonValue, scale: &JsonValue) -> Option<Decimal> {
    let unscaled = integer_from_json(unscaled)?;
    let scale = integer_from_json(scale)?;
    if (0..=28).contains(&scale) {
        return Some(Decimal::new(unscaled, scale as u32));
    }
    if (-28..0).contains(&scale) {
        let factor = Decimal::from_i128_with_scale(10i128.pow((-scale) as u32), 0);
        return Decimal::from(unscaled).checked_mul(factor);
    }
    None
}

/// Split an amount into absolute value and direction.
///
/// An explicit credit/debit indicator wins over the sign; without one the sign decides.
pub fn split_amount(
    amount: Decimal,
    indicator: Option<&str>,
) -> Result<(Decimal, Direction), String> {
    let direction = match indicator {
        Some(flag) => Direction::parse(flag)
            .ok_or_else(|| format!("unknown credit/debit indicator {flag:?}"))?,
        None if amount.is_sign_negative() && !amount.is_zero() => Direction::Debit,
        None => Direction::Credit,
    };
    Ok((amount.abs(), direction))
}

/// Accepts `YYYY-MM-DD` or an RFC 3339 timestamp.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.date_naive()))
}

pub fn json_date(value: &JsonValue, path: &[&str]) -> Option<NaiveDate> {
    json_str(value, path).and_then(parse_date)
}

/// ISO 4217 shape check; providers occasionally send lower-case codes.
pub fn currency_code(raw: &str) -> Option<String> {
    let code = raw.trim().to_ascii_uppercase();
    if code.len() == 3 && code.chars().all(|c| c.is_ascii_alphabetic()) {
        Some(code)
    } else {
        None
    }
}

/// Maps ISO 20022 cash account types and aggregator type names onto account kinds.
pub fn account_kind(raw: Option<&str>) -> AccountKind {
    let Some(raw) = raw else {
        return AccountKind::Other;
    };
    match raw.trim().to_ascii_uppercase().as_str() {
        "CACC" | "CHECKING" | "CURRENT" => AccountKind::Checking,
        "CASH" | "TRAN" | "BUSINESS" | "OPERATING" => AccountKind::Operating,
        "SVGS" | "SAVINGS" | "MOMA" => AccountKind::Savings,
        "CARD" | "CREDIT_CARD" | "CREDITCARD" => AccountKind::CreditCard,
        "LOAN" | "LOAN_ACCOUNT" | "MORTGAGE" | "MGLD" => AccountKind::Loan,
        _ => AccountKind::Other,
    }
}
