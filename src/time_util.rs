use anyhow::{Result, bail};
use chrono::{Duration, NaiveDateTime, NaiveTime, Weekday};

/// Parse a time-of-day like "18:40" or "18:40:00.500000" into a `NaiveTime`.
pub fn parse_time_of_day(s: &str) -> Result<NaiveTime> {
    for fmt in ["%H:%M:%S%.f", "%H:%M:%S", "%H:%M"] {
        if let Ok(t) = NaiveTime::parse_from_str(s, fmt) {
            return Ok(t);
        }
    }
    bail!("invalid time of day '{s}': expected HH:MM[:SS[.ffffff]]")
}

/// Parse a datetime like "2024-01-01 12:00:00" or RFC3339, interpreted as
/// server-local wall clock (no timezone conversion is performed anywhere
/// in this crate — see schedule.rs).
pub fn parse_datetime(s: &str) -> Result<NaiveDateTime> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Ok(dt.naive_local());
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(dt);
        }
    }
    bail!("invalid datetime '{s}': expected RFC3339 or 'YYYY-MM-DD HH:MM:SS'")
}

/// Parse a weekday name or three-letter abbreviation, case-insensitive.
pub fn parse_weekday(s: &str) -> Result<Weekday> {
    match s.to_lowercase().as_str() {
        "sun" | "sunday" => Ok(Weekday::Sun),
        "mon" | "monday" => Ok(Weekday::Mon),
        "tue" | "tuesday" => Ok(Weekday::Tue),
        "wed" | "wednesday" => Ok(Weekday::Wed),
        "thu" | "thursday" => Ok(Weekday::Thu),
        "fri" | "friday" => Ok(Weekday::Fri),
        "sat" | "saturday" => Ok(Weekday::Sat),
        _ => bail!("unknown weekday '{s}'"),
    }
}

/// Interval fields as specified on the wire / in `Schedule`. Sums into a
/// single `chrono::Duration`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct IntervalFields {
    pub weeks: i64,
    pub days: i64,
    pub hours: i64,
    pub minutes: i64,
    pub seconds: f64,
    pub milliseconds: i64,
    pub microseconds: i64,
}

impl IntervalFields {
    pub fn to_duration(self) -> Duration {
        let mut total = Duration::weeks(self.weeks)
            + Duration::days(self.days)
            + Duration::hours(self.hours)
            + Duration::minutes(self.minutes)
            + Duration::milliseconds(self.milliseconds)
            + Duration::microseconds(self.microseconds);
        if self.seconds != 0.0 {
            total += Duration::microseconds((self.seconds * 1_000_000.0).round() as i64);
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_time_of_day_variants() {
        assert_eq!(parse_time_of_day("18:40").unwrap(), NaiveTime::from_hms_opt(18, 40, 0).unwrap());
        assert_eq!(
            parse_time_of_day("18:40:05").unwrap(),
            NaiveTime::from_hms_opt(18, 40, 5).unwrap()
        );
    }

    #[test]
    fn rejects_garbage_time() {
        assert!(parse_time_of_day("not-a-time").is_err());
    }

    #[test]
    fn parses_weekday_aliases() {
        assert_eq!(parse_weekday("Mon").unwrap(), Weekday::Mon);
        assert_eq!(parse_weekday("FRIDAY").unwrap(), Weekday::Fri);
        assert!(parse_weekday("someday").is_err());
    }

    #[test]
    fn sums_interval_fields() {
        let interval = IntervalFields {
            weeks: 1,
            days: 1,
            hours: 1,
            minutes: 1,
            seconds: 1.5,
            milliseconds: 500,
            microseconds: 10,
        };
        let d = interval.to_duration();
        // 1 week + 1 day + 1 hour + 1 minute + 1.5s + 0.5s + 10us
        let expected = Duration::weeks(1)
            + Duration::days(1)
            + Duration::hours(1)
            + Duration::minutes(1)
            + Duration::seconds(2)
            + Duration::microseconds(10);
        assert_eq!(d, expected);
    }
}
