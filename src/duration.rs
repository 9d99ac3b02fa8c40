//! Parsing of Go-style duration strings as used in Grafana and Kubernetes manifests
//! (`30s`, `10m`, `1h30m`, `500ms`), plus `d` for days.

use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum DurationError {
    #[error("duration string cannot be empty")]
    Empty,

    #[error("invalid duration `{0}`, expected a sequence like `1h30m`, `10m` or `45s`")]
    Invalid(String),

    #[error("duration `{0}` is too large")]
    Overflow(String),
}

fn component() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+)(ms|d|h|m|s)").expect("static duration regex"))
}

/// Parse a duration made of one or more `<number><unit>` components.
///
/// Supported units are `d`, `h`, `m`, `s` and `ms`. A bare `0` is accepted as zero.
pub fn parse_duration(input: &str) -> Result<Duration, DurationError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(DurationError::Empty);
    }
    if trimmed == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = Duration::ZERO;
    let mut consumed = 0;
    for caps in component().captures_iter(trimmed) {
        let whole = caps.get(0).expect("capture group 0 always exists");
        if whole.start() != consumed {
            return Err(DurationError::Invalid(trimmed.to_string()));
        }
        consumed = whole.end();

        let value: u64 = caps[1]
            .parse()
            .map_err(|_| DurationError::Overflow(trimmed.to_string()))?;
        let part = match &caps[2] {
            "d" => value.checked_mul(86_400).map(Duration::from_secs),
            "h" => value.checked_mul(3600).map(Duration::from_secs),
            "m" => value.checked_mul(60).map(Duration::from_secs),
            "s" => Some(Duration::from_secs(value)),
            _ => Some(Duration::from_millis(value)),
        };
        total = part
            .and_then(|p| total.checked_add(p))
            .ok_or_else(|| DurationError::Overflow(trimmed.to_string()))?;
    }

    if consumed != trimmed.len() {
        return Err(DurationError::Invalid(trimmed.to_string()));
    }
    Ok(total)
}

/// Render a duration the way Grafana expects rule `for` clauses and group intervals.
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let millis = duration.subsec_millis();
    if secs == 0 && millis == 0 {
        return "0s".to_string();
    }
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    let mut out = String::new();
    if h > 0 {
        out.push_str(&format!("{h}h"));
    }
    if m > 0 {
        out.push_str(&format!("{m}m"));
    }
    if s > 0 {
        out.push_str(&format!("{s}s"));
    }
    if millis > 0 {
        out.push_str(&format!("{millis}ms"));
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_single_components() {
        assert_eq!(parse_duration("30s"), Ok(Duration::from_secs(30)));
        assert_eq!(parse_duration("10m"), Ok(Duration::from_secs(600)));
        assert_eq!(parse_duration("2h"), Ok(Duration::from_secs(7200)));
        assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_duration("7d"), Ok(Duration::from_secs(7 * 86_400)));
    }

    #[test]
    fn parses_compound_durations() {
        assert_eq!(parse_duration("1h30m"), Ok(Duration::from_secs(5400)));
        assert_eq!(parse_duration("1m30s"), Ok(Duration::from_secs(90)));
        assert_eq!(parse_duration(" 5m "), Ok(Duration::from_secs(300)));
    }

    #[test]
    fn zero_disables() {
        assert_eq!(parse_duration("0"), Ok(Duration::ZERO));
        assert_eq!(parse_duration("0s"), Ok(Duration::ZERO));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_duration(""), Err(DurationError::Empty));
        assert!(matches!(parse_duration("10"), Err(DurationError::Invalid(_))));
        assert!(matches!(parse_duration("10w"), Err(DurationError::Invalid(_))));
        assert!(matches!(parse_duration("m10"), Err(DurationError::Invalid(_))));
        assert!(matches!(parse_duration("1h 30m"), Err(DurationError::Invalid(_))));
    }

    #[test]
    fn formats_back_to_compact_form() {
        assert_eq!(format_duration(Duration::from_secs(90)), "1m30s");
        assert_eq!(format_duration(Duration::from_secs(3600)), "1h");
        assert_eq!(format_duration(Duration::ZERO), "0s");
        assert_eq!(format_duration(Duration::from_millis(500)), "500ms");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1s500ms");
        assert_eq!(format_duration(Duration::from_secs(2 * 86_400)), "48h");
    }
}
