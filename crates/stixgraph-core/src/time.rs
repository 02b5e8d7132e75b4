//! Timestamp normalization

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};

const SANDBOX_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];

/// Render a UTC instant as a STIX timestamp (millisecond precision)
pub fn format_timestamp(instant: &DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Normalize sandbox (`2023-04-01 10:11:12`) or RFC 3339 timestamps
pub fn normalize_timestamp(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(format_timestamp(&parsed.with_timezone(&Utc)));
    }

    SANDBOX_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| format_timestamp(&naive.and_utc()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sandbox_format() {
        assert_eq!(
            normalize_timestamp("2023-04-01 10:11:12").as_deref(),
            Some("2023-04-01T10:11:12.000Z")
        );
    }

    #[test]
    fn test_fractional_and_rfc3339() {
        assert_eq!(
            normalize_timestamp("2023-04-01 10:11:12.5").as_deref(),
            Some("2023-04-01T10:11:12.500Z")
        );
        assert_eq!(
            normalize_timestamp("2023-04-01T12:11:12+02:00").as_deref(),
            Some("2023-04-01T10:11:12.000Z")
        );
    }

    #[test]
    fn test_garbage() {
        assert!(normalize_timestamp("yesterday").is_none());
    }
}
