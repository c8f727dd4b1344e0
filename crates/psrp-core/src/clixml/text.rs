//! Text forms for CLIXML datetime, duration and floating point values
//!
//! .NET emits these in fixed shapes that do not line up with any stock
//! formatter: datetimes are ISO-8601 with an optional fraction and a
//! kind-dependent suffix, durations are a constrained `xs:duration`
//! subset, and floats use `Infinity`/`NaN` specials.

use chrono::{Datelike, FixedOffset, NaiveDate, NaiveDateTime, Timelike};

use crate::errors::SerializationError;
use crate::value::{DateTimeKind, PsDateTime, PsDuration};

const NANOS_PER_SEC: i128 = 1_000_000_000;
const NANOS_PER_MIN: i128 = 60 * NANOS_PER_SEC;
const NANOS_PER_HOUR: i128 = 60 * NANOS_PER_MIN;
const NANOS_PER_DAY: i128 = 24 * NANOS_PER_HOUR;

// ----------------------------------------------------------------------------
// Datetime
// ----------------------------------------------------------------------------

/// Render a datetime in CLIXML form. The kind decides the suffix: none
/// for `Unspecified`, `Z` for `Utc`, `±HH:MM` for a fixed offset.
pub fn format_datetime(value: &PsDateTime) -> String {
    let dt = value.datetime;
    let mut out = format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}",
        dt.year(),
        dt.month(),
        dt.day(),
        dt.hour(),
        dt.minute(),
        dt.second()
    );

    let nanos = dt.nanosecond() % 1_000_000_000;
    if nanos != 0 {
        let fraction = format!("{nanos:09}");
        out.push('.');
        out.push_str(fraction.trim_end_matches('0'));
    }

    match value.kind {
        DateTimeKind::Unspecified => {}
        DateTimeKind::Utc => out.push('Z'),
        DateTimeKind::Local(offset) => {
            let total = offset.local_minus_utc();
            let sign = if total < 0 { '-' } else { '+' };
            let total = total.abs();
            out.push_str(&format!("{}{:02}:{:02}", sign, total / 3600, total % 3600 / 60));
        }
    }

    out
}

/// Parse a CLIXML datetime, preserving the kind implied by its suffix.
pub fn parse_datetime(text: &str) -> Result<PsDateTime, SerializationError> {
    let err = || SerializationError::malformed(format!("invalid datetime '{text}'"));

    let bytes = text.as_bytes();
    if bytes.len() < 19 || !text.is_ascii() || bytes[10] != b'T' {
        return Err(err());
    }

    let field = |s: &str| s.parse::<u32>().map_err(|_| err());
    let year = text[0..4].parse::<i32>().map_err(|_| err())?;
    let month = field(&text[5..7])?;
    let day = field(&text[8..10])?;
    let hour = field(&text[11..13])?;
    let minute = field(&text[14..16])?;
    let second = field(&text[17..19])?;

    let mut rest = &text[19..];
    let mut nanos: u32 = 0;
    if let Some(stripped) = rest.strip_prefix('.') {
        let digits: String = stripped.chars().take_while(|c| c.is_ascii_digit()).collect();
        if digits.is_empty() {
            return Err(err());
        }
        let mut padded: String = digits.chars().take(9).collect();
        while padded.len() < 9 {
            padded.push('0');
        }
        nanos = padded.parse().map_err(|_| err())?;
        rest = &stripped[digits.len()..];
    }

    let kind = match rest {
        "" => DateTimeKind::Unspecified,
        "Z" => DateTimeKind::Utc,
        offset if offset.len() == 6 && (offset.starts_with('+') || offset.starts_with('-')) => {
            if offset.as_bytes()[3] != b':' {
                return Err(err());
            }
            let hours = field(&offset[1..3])? as i32;
            let minutes = field(&offset[4..6])? as i32;
            let mut seconds = hours * 3600 + minutes * 60;
            if offset.starts_with('-') {
                seconds = -seconds;
            }
            DateTimeKind::Local(FixedOffset::east_opt(seconds).ok_or_else(err)?)
        }
        _ => return Err(err()),
    };

    let datetime: NaiveDateTime = NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|d| d.and_hms_nano_opt(hour, minute, second, nanos))
        .ok_or_else(err)?;

    Ok(PsDateTime { datetime, kind })
}

// ----------------------------------------------------------------------------
// Duration
// ----------------------------------------------------------------------------

/// Render a duration as `[-]P[nD][T[nH][nM][n[.f]S]]`.
pub fn format_duration(value: PsDuration) -> String {
    let nanos = value.as_nanos();
    if nanos == 0 {
        return "PT0S".to_string();
    }

    let mut out = String::new();
    if nanos < 0 {
        out.push('-');
    }
    let mut rest = nanos.abs();
    out.push('P');

    let days = rest / NANOS_PER_DAY;
    rest %= NANOS_PER_DAY;
    if days != 0 {
        out.push_str(&format!("{days}D"));
    }

    if rest == 0 {
        return out;
    }

    out.push('T');
    let hours = rest / NANOS_PER_HOUR;
    rest %= NANOS_PER_HOUR;
    if hours != 0 {
        out.push_str(&format!("{hours}H"));
    }

    let minutes = rest / NANOS_PER_MIN;
    rest %= NANOS_PER_MIN;
    if minutes != 0 {
        out.push_str(&format!("{minutes}M"));
    }

    if rest != 0 {
        let seconds = rest / NANOS_PER_SEC;
        let fraction = (rest % NANOS_PER_SEC) as u32;
        if fraction == 0 {
            out.push_str(&format!("{seconds}S"));
        } else {
            let digits = format!("{fraction:09}");
            out.push_str(&format!("{seconds}.{}S", digits.trim_end_matches('0')));
        }
    }

    out
}

/// Parse a CLIXML duration into a signed nanosecond span.
pub fn parse_duration(text: &str) -> Result<PsDuration, SerializationError> {
    let err = || SerializationError::malformed(format!("invalid duration '{text}'"));

    let (negative, mut rest) = match text.strip_prefix('-') {
        Some(r) => (true, r),
        None => (false, text),
    };
    rest = rest.strip_prefix('P').ok_or_else(err)?;
    if rest.is_empty() {
        return Err(err());
    }

    fn take_number<'a>(s: &'a str) -> (&'a str, &'a str) {
        let end = s
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(s.len());
        (&s[..end], &s[end..])
    }

    let mut total: i128 = 0;

    // Days come before the time designator.
    if !rest.starts_with('T') {
        let (digits, after) = take_number(rest);
        if digits.is_empty() || digits.contains('.') {
            return Err(err());
        }
        rest = after.strip_prefix('D').ok_or_else(err)?;
        let days: i128 = digits.parse().map_err(|_| err())?;
        total += days * NANOS_PER_DAY;
        if rest.is_empty() {
            return Ok(PsDuration::from_nanos(if negative { -total } else { total }));
        }
    }

    rest = rest.strip_prefix('T').ok_or_else(err)?;
    if rest.is_empty() {
        return Err(err());
    }

    let mut seen_unit = false;
    for unit in ['H', 'M', 'S'] {
        if rest.is_empty() {
            break;
        }
        let (digits, after) = take_number(rest);
        if digits.is_empty() {
            continue;
        }
        let Some(stripped) = after.strip_prefix(unit) else {
            continue;
        };
        rest = stripped;
        seen_unit = true;

        match unit {
            'H' => {
                let hours: i128 = digits.parse().map_err(|_| err())?;
                total += hours * NANOS_PER_HOUR;
            }
            'M' => {
                let minutes: i128 = digits.parse().map_err(|_| err())?;
                total += minutes * NANOS_PER_MIN;
            }
            _ => {
                let (secs, frac) = match digits.split_once('.') {
                    Some((s, f)) => (s, f),
                    None => (digits, ""),
                };
                let seconds: i128 = if secs.is_empty() {
                    0
                } else {
                    secs.parse().map_err(|_| err())?
                };
                total += seconds * NANOS_PER_SEC;
                if !frac.is_empty() {
                    if frac.len() > 9 || !frac.bytes().all(|b| b.is_ascii_digit()) {
                        return Err(err());
                    }
                    let mut padded = frac.to_string();
                    while padded.len() < 9 {
                        padded.push('0');
                    }
                    total += padded.parse::<i128>().map_err(|_| err())?;
                }
            }
        }
    }

    if !seen_unit || !rest.is_empty() {
        return Err(err());
    }

    Ok(PsDuration::from_nanos(if negative { -total } else { total }))
}

// ----------------------------------------------------------------------------
// Floating point
// ----------------------------------------------------------------------------

/// Render a double with the `.NET` special spellings.
pub fn format_f64(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value == f64::INFINITY {
        "Infinity".to_string()
    } else if value == f64::NEG_INFINITY {
        "-Infinity".to_string()
    } else {
        format!("{value}")
    }
}

/// Render a single with the `.NET` special spellings.
pub fn format_f32(value: f32) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value == f32::INFINITY {
        "Infinity".to_string()
    } else if value == f32::NEG_INFINITY {
        "-Infinity".to_string()
    } else {
        format!("{value}")
    }
}

pub fn parse_f64(text: &str) -> Result<f64, SerializationError> {
    match text {
        "Infinity" | "INF" => Ok(f64::INFINITY),
        "-Infinity" | "-INF" => Ok(f64::NEG_INFINITY),
        "NaN" => Ok(f64::NAN),
        other => other
            .parse()
            .map_err(|_| SerializationError::malformed(format!("invalid double '{text}'"))),
    }
}

pub fn parse_f32(text: &str) -> Result<f32, SerializationError> {
    match text {
        "Infinity" | "INF" => Ok(f32::INFINITY),
        "-Infinity" | "-INF" => Ok(f32::NEG_INFINITY),
        "NaN" => Ok(f32::NAN),
        other => other
            .parse()
            .map_err(|_| SerializationError::malformed(format!("invalid single '{text}'"))),
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn naive(s: &str) -> NaiveDateTime {
        let parsed = parse_datetime(s).unwrap();
        parsed.datetime
    }

    #[test]
    fn test_datetime_kinds() {
        let dt = parse_datetime("2024-01-02T03:04:05").unwrap();
        assert_eq!(dt.kind, DateTimeKind::Unspecified);
        assert_eq!(format_datetime(&dt), "2024-01-02T03:04:05");

        let dt = parse_datetime("2024-01-02T03:04:05Z").unwrap();
        assert_eq!(dt.kind, DateTimeKind::Utc);
        assert_eq!(format_datetime(&dt), "2024-01-02T03:04:05Z");

        let dt = parse_datetime("2024-01-02T03:04:05+05:30").unwrap();
        assert_eq!(
            dt.kind,
            DateTimeKind::Local(FixedOffset::east_opt(5 * 3600 + 30 * 60).unwrap())
        );
        assert_eq!(format_datetime(&dt), "2024-01-02T03:04:05+05:30");

        let dt = parse_datetime("2024-01-02T03:04:05-08:00").unwrap();
        assert_eq!(format_datetime(&dt), "2024-01-02T03:04:05-08:00");
    }

    #[test]
    fn test_datetime_fractions() {
        // .NET emits 100ns ticks: seven fractional digits.
        let dt = parse_datetime("2024-01-02T03:04:05.1234567Z").unwrap();
        assert_eq!(dt.datetime.nanosecond(), 123_456_700);
        assert_eq!(format_datetime(&dt), "2024-01-02T03:04:05.1234567Z");

        let dt = parse_datetime("2024-01-02T03:04:05.5").unwrap();
        assert_eq!(dt.datetime.nanosecond(), 500_000_000);
        assert_eq!(format_datetime(&dt), "2024-01-02T03:04:05.5");

        assert_eq!(naive("2024-01-02T03:04:05.000000001").nanosecond(), 1);
    }

    #[test]
    fn test_datetime_rejects_garbage() {
        assert!(parse_datetime("2024-01-02").is_err());
        assert!(parse_datetime("2024-01-02T03:04:05+0530").is_err());
        assert!(parse_datetime("2024-13-02T03:04:05").is_err());
        assert!(parse_datetime("2024-01-02T03:04:05.").is_err());
    }

    #[test]
    fn test_duration_formatting() {
        assert_eq!(format_duration(PsDuration::from_nanos(0)), "PT0S");
        assert_eq!(format_duration(PsDuration::from_secs(1)), "PT1S");
        assert_eq!(format_duration(PsDuration::from_secs(-90)), "-PT1M30S");
        assert_eq!(
            format_duration(PsDuration::from_nanos(1_500_000_000)),
            "PT1.5S"
        );
        assert_eq!(
            format_duration(PsDuration::from_secs(86_400)),
            "P1D"
        );
        assert_eq!(
            format_duration(PsDuration::from_secs(86_400 + 3600)),
            "P1DT1H"
        );
        assert_eq!(format_duration(PsDuration::from_secs(3600)), "PT1H");
        assert_eq!(
            format_duration(PsDuration::from_nanos(100)),
            "PT0.0000001S"
        );
    }

    #[test]
    fn test_duration_parsing() {
        assert_eq!(parse_duration("PT0S").unwrap(), PsDuration::from_nanos(0));
        assert_eq!(parse_duration("PT1.5S").unwrap().as_nanos(), 1_500_000_000);
        assert_eq!(parse_duration("-PT1M30S").unwrap().as_nanos(), -90_000_000_000);
        assert_eq!(
            parse_duration("P2DT3H4M5S").unwrap().as_nanos(),
            ((2 * 86_400 + 3 * 3_600 + 4 * 60 + 5) as i128) * 1_000_000_000
        );
        assert_eq!(parse_duration("P1D").unwrap(), PsDuration::from_secs(86_400));

        assert!(parse_duration("P").is_err());
        assert!(parse_duration("PT").is_err());
        assert!(parse_duration("1H").is_err());
        assert!(parse_duration("PT1H junk").is_err());
    }

    #[test]
    fn test_float_specials() {
        assert_eq!(format_f64(f64::INFINITY), "Infinity");
        assert_eq!(format_f32(f32::NEG_INFINITY), "-Infinity");
        assert_eq!(format_f64(f64::NAN), "NaN");
        assert!(parse_f64("NaN").unwrap().is_nan());
        assert_eq!(parse_f64("-Infinity").unwrap(), f64::NEG_INFINITY);
        assert_eq!(parse_f32("1.5").unwrap(), 1.5f32);
        assert!(parse_f64("bogus").is_err());
    }
}
