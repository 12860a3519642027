//! Typed coercion of raw CSV cells.
//!
//! Every cell runs through a fixed ladder, first match wins: fixed-point
//! decimal, then timestamp, then boolean, then the raw string. The ladder is
//! deterministic — the same input always yields the same typed value.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde_json::Value;

/// A CSV cell after coercion.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Fixed-point decimal (invariant locale, `.` separator).
    Decimal(Decimal),
    /// ISO-8601 timestamp; local forms are taken as UTC.
    Timestamp(DateTime<Utc>),
    /// `true`/`false`, case-insensitive.
    Bool(bool),
    /// Anything else, including the empty string.
    Text(String),
}

impl FieldValue {
    /// The JSON representation used on the wire and in job payloads.
    pub fn into_json(self) -> Value {
        match self {
            FieldValue::Bool(value) => Value::Bool(value),
            FieldValue::Decimal(value) => value
                .to_f64()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or_else(|| Value::String(value.to_string())),
            FieldValue::Timestamp(value) => {
                Value::String(value.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            }
            FieldValue::Text(value) => Value::String(value),
        }
    }
}

/// Coerce one raw cell through the ladder.
pub fn coerce(raw: &str) -> FieldValue {
    if raw.is_empty() {
        return FieldValue::Text(String::new());
    }

    if let Ok(decimal) = Decimal::from_str_exact(raw) {
        return FieldValue::Decimal(decimal);
    }

    if let Some(timestamp) = parse_timestamp(raw) {
        return FieldValue::Timestamp(timestamp);
    }

    if raw.eq_ignore_ascii_case("true") {
        return FieldValue::Bool(true);
    }
    if raw.eq_ignore_ascii_case("false") {
        return FieldValue::Bool(false);
    }

    FieldValue::Text(raw.to_string())
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(datetime) = DateTime::parse_from_rfc3339(raw) {
        return Some(datetime.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }

    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(date.and_time(chrono::NaiveTime::MIN).and_utc());
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal::Decimal;

    #[test]
    fn the_ladder_matches_in_order() {
        assert_eq!(
            coerce("99.99"),
            FieldValue::Decimal(Decimal::from_str_exact("99.99").unwrap())
        );
        assert_eq!(
            coerce("2024-01-15"),
            FieldValue::Timestamp(Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap())
        );
        assert_eq!(coerce("true"), FieldValue::Bool(true));
        assert_eq!(coerce("FALSE"), FieldValue::Bool(false));
        assert_eq!(coerce("text"), FieldValue::Text("text".to_string()));
    }

    #[test]
    fn integers_are_decimals_too() {
        assert_eq!(coerce("42"), FieldValue::Decimal(Decimal::from(42)));
        assert_eq!(coerce("-7.5"), FieldValue::Decimal(Decimal::from_str_exact("-7.5").unwrap()));
    }

    #[test]
    fn empty_cells_stay_empty_strings() {
        assert_eq!(coerce(""), FieldValue::Text(String::new()));
    }

    #[test]
    fn utc_and_local_timestamp_forms_are_accepted() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap();
        assert_eq!(
            coerce("2024-01-15T10:30:00Z"),
            FieldValue::Timestamp(expected)
        );
        assert_eq!(
            coerce("2024-01-15T10:30:00"),
            FieldValue::Timestamp(expected)
        );
        assert_eq!(
            coerce("2024-01-15 10:30:00"),
            FieldValue::Timestamp(expected)
        );
        assert_eq!(
            coerce("2024-01-15T12:30:00+02:00"),
            FieldValue::Timestamp(expected)
        );
    }

    #[test]
    fn date_like_text_is_not_a_decimal() {
        // `2024-01-15` must fall through the decimal rung to the timestamp one.
        assert!(matches!(coerce("2024-01-15"), FieldValue::Timestamp(_)));
        assert!(matches!(coerce("1.2.3"), FieldValue::Text(_)));
    }

    #[test]
    fn coercion_is_deterministic() {
        for input in ["99.99", "2024-01-15", "true", "text", ""] {
            assert_eq!(coerce(input), coerce(input));
        }
    }

    #[test]
    fn sample_row_coerces_to_the_expected_types() {
        let row: Vec<FieldValue> = ["true", "99.99", "2024-01-15", "text"]
            .iter()
            .map(|cell| coerce(cell))
            .collect();

        assert_eq!(row[0], FieldValue::Bool(true));
        assert_eq!(
            row[1],
            FieldValue::Decimal(Decimal::from_str_exact("99.99").unwrap())
        );
        assert_eq!(
            row[2],
            FieldValue::Timestamp(Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap())
        );
        assert_eq!(row[3], FieldValue::Text("text".to_string()));
    }

    #[test]
    fn json_form_keeps_the_types() {
        assert_eq!(coerce("true").into_json(), serde_json::json!(true));
        assert_eq!(coerce("99.99").into_json(), serde_json::json!(99.99));
        assert_eq!(
            coerce("2024-01-15").into_json(),
            serde_json::json!("2024-01-15T00:00:00Z")
        );
        assert_eq!(coerce("text").into_json(), serde_json::json!("text"));
    }
}
