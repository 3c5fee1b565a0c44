//! Time-of-day normalization for field-collected input.
//!
//! Attendance times arrive as whatever the device keyboard, OCR layer, or
//! locale produced: narrow no-break spaces, `a. m.` style meridiem markers,
//! missing seconds. Everything is reduced to a canonical `HH:MM:SS` string
//! before persistence so downstream reporting never has to re-parse.

use chrono::NaiveTime;
use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimeFormatError {
    /// The input could not be interpreted as a time of day. Carries the
    /// original string for diagnostics.
    #[error("Invalid time format: {0:?}")]
    InvalidFormat(String),
}

/// Permissive fallbacks tried after the strict `%H:%M:%S` parse fails.
const FALLBACK_FORMATS: &[&str] = &["%I:%M:%S %p", "%I:%M %p", "%I %p", "%H:%M", "%H"];

/// Normalize an arbitrary time-of-day string to `HH:MM:SS`.
///
/// Absence is valid: `None`, empty, or whitespace-only input returns
/// `Ok(None)` since not every attendance record has both in and out times.
/// Deterministic and side-effect-free.
pub fn normalize_time(input: Option<&str>) -> Result<Option<String>, TimeFormatError> {
    let Some(raw) = input else {
        return Ok(None);
    };
    if raw.trim().is_empty() {
        return Ok(None);
    }

    let cleaned = clean_whitespace(raw);
    let cleaned = normalize_meridiem(&cleaned);
    let cleaned = append_missing_seconds(&cleaned);

    if let Ok(time) = NaiveTime::parse_from_str(&cleaned, "%H:%M:%S") {
        return Ok(Some(time.format("%H:%M:%S").to_string()));
    }

    for format in FALLBACK_FORMATS {
        if let Ok(time) = NaiveTime::parse_from_str(&cleaned, format) {
            return Ok(Some(time.format("%H:%M:%S").to_string()));
        }
    }

    Err(TimeFormatError::InvalidFormat(raw.to_string()))
}

/// Replace no-break space variants with plain spaces and collapse runs.
fn clean_whitespace(input: &str) -> String {
    let replaced = input.replace(['\u{202f}', '\u{a0}'], " ");
    replaced.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Rewrite locale meridiem variants (`a.m.`, `p. m.`, `Am`, ...) to a
/// single uppercase `AM`/`PM` token chrono can parse.
fn normalize_meridiem(input: &str) -> String {
    let re = Regex::new(r"(?i)\b([ap])\s*\.?\s*m\s*\.?").expect("Invalid regex");
    re.replace_all(input, |caps: &regex::Captures<'_>| {
        format!("{}M", caps[1].to_uppercase())
    })
    .trim()
    .to_string()
}

/// `H:MM` / `HH:MM` with nothing else gets `:00` seconds appended.
fn append_missing_seconds(input: &str) -> String {
    let re = Regex::new(r"^\d{1,2}:\d{2}$").expect("Invalid regex");
    if re.is_match(input) {
        format!("{input}:00")
    } else {
        input.to_string()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn normalized(input: &str) -> Option<String> {
        normalize_time(Some(input)).unwrap()
    }

    #[test]
    fn none_and_empty_are_valid_absence() {
        assert_eq!(normalize_time(None).unwrap(), None);
        assert_eq!(normalize_time(Some("")).unwrap(), None);
        assert_eq!(normalize_time(Some("   ")).unwrap(), None);
    }

    #[test]
    fn locale_meridiem_with_spaced_dots() {
        assert_eq!(normalized("9:30 a. m."), Some("09:30:00".to_string()));
        assert_eq!(normalized("9:30 p. m."), Some("21:30:00".to_string()));
        assert_eq!(normalized("12:00 a.m."), Some("00:00:00".to_string()));
    }

    #[test]
    fn narrow_no_break_space_is_stripped() {
        assert_eq!(normalized("9:30\u{202f}a.m."), Some("09:30:00".to_string()));
        assert_eq!(normalized("9:30\u{a0}PM"), Some("21:30:00".to_string()));
    }

    #[test]
    fn repeated_whitespace_is_collapsed() {
        assert_eq!(normalized("  9:30   AM "), Some("09:30:00".to_string()));
    }

    #[test]
    fn hh_mm_gets_seconds_appended() {
        assert_eq!(normalized("14:05"), Some("14:05:00".to_string()));
        assert_eq!(normalized("8:05"), Some("08:05:00".to_string()));
    }

    #[test]
    fn full_time_passes_through_unchanged() {
        assert_eq!(normalized("23:59:59"), Some("23:59:59".to_string()));
        assert_eq!(normalized("00:00:00"), Some("00:00:00".to_string()));
    }

    #[test]
    fn bare_hour_with_meridiem() {
        assert_eq!(normalized("7 am"), Some("07:00:00".to_string()));
        assert_eq!(normalized("11 PM"), Some("23:00:00".to_string()));
    }

    #[test]
    fn garbage_fails_with_original_string() {
        let err = normalize_time(Some("not a time")).unwrap_err();
        assert_eq!(err, TimeFormatError::InvalidFormat("not a time".to_string()));
    }

    #[test]
    fn out_of_range_fails() {
        assert!(normalize_time(Some("25:00")).is_err());
        assert!(normalize_time(Some("12:61")).is_err());
    }

    #[test]
    fn is_deterministic() {
        let first = normalized("9:30 p. m.");
        let second = normalized("9:30 p. m.");
        assert_eq!(first, second);
    }
}
