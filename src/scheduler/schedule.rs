//! Schedule expressions
//!
//! Accepts standard 5-field cron (`min hour dom month dow`), 6/7-field cron
//! with seconds, the `@hourly`-style shorthands and `@every <duration>`.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::options::parse_duration;
use crate::{Error, Result};

/// A parsed schedule
#[derive(Clone, Debug)]
pub enum Schedule {
    /// Fixed interval from the time of installation
    Every(Duration),
    /// Calendar cron expression
    Cron(Box<cron::Schedule>),
}

impl Schedule {
    /// Parse a schedule expression
    pub fn parse(expression: &str) -> Result<Self> {
        let expr = expression.trim();
        let invalid = |reason: String| Error::InvalidSchedule {
            expression: expression.to_string(),
            reason,
        };

        if let Some(interval) = expr.strip_prefix("@every") {
            let interval = parse_duration(interval).map_err(|e| invalid(e.to_string()))?;
            if interval.is_zero() {
                return Err(invalid("interval must be positive".to_string()));
            }
            return Ok(Self::Every(interval));
        }

        let fields: Vec<&str> = expr.split_whitespace().collect();
        let normalized = match fields.as_slice() {
            [minute, hour, dom, month, dow] => {
                let dow = shift_day_of_week(dow).map_err(invalid)?;
                format!("0 {minute} {hour} {dom} {month} {dow}")
            }
            _ => expr.to_string(),
        };
        cron::Schedule::from_str(&normalized)
            .map(|s| Self::Cron(Box::new(s)))
            .map_err(|e| invalid(e.to_string()))
    }

    /// First fire time strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Every(interval) => chrono::Duration::from_std(*interval)
                .ok()
                .and_then(|d| after.checked_add_signed(d)),
            Self::Cron(schedule) => schedule.after(&after).next(),
        }
    }
}

/// Translate a 5-field day-of-week (0 or 7 = Sunday, 1 = Monday) into the
/// `cron` crate's numbering (1 = Sunday .. 7 = Saturday).
///
/// Numeric items are expanded to explicit day lists; names and a bare `*`
/// mean the same thing in both and pass through.
fn shift_day_of_week(field: &str) -> std::result::Result<String, String> {
    let mut out = Vec::new();
    for item in field.split(',') {
        if item.chars().any(|c| c.is_ascii_alphabetic()) || item == "*" || item == "?" {
            out.push(item.to_string());
            continue;
        }
        let (base, step) = match item.split_once('/') {
            Some((base, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid day-of-week step in {item:?}"))?;
                if step == 0 {
                    return Err(format!("zero day-of-week step in {item:?}"));
                }
                (base, Some(step))
            }
            None => (item, None),
        };
        let day = |s: &str| -> std::result::Result<u32, String> {
            match s.parse::<u32>() {
                Ok(d) if d <= 7 => Ok(d),
                _ => Err(format!("day-of-week {s:?} out of range 0-7")),
            }
        };
        let (start, end) = match base.split_once('-') {
            Some((a, b)) => (day(a)?, day(b)?),
            None if base == "*" || base == "?" => (0, 6),
            None if step.is_some() => (day(base)?, 6.max(day(base)?)),
            None => (day(base)?, day(base)?),
        };
        if start > end {
            return Err(format!("day-of-week range {base:?} runs backwards"));
        }
        let mut days: Vec<u32> = (start..=end)
            .step_by(step.unwrap_or(1) as usize)
            .map(|d| if d == 0 || d == 7 { 1 } else { d + 1 })
            .collect();
        days.sort_unstable();
        days.dedup();
        out.extend(days.iter().map(u32::to_string));
    }
    Ok(out.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike, Weekday};

    #[test]
    fn every_adds_the_interval() {
        let s = Schedule::parse("@every 1m").unwrap();
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 30).unwrap();
        assert_eq!(s.next_after(t), Some(t + chrono::Duration::minutes(1)));
    }

    #[test]
    fn five_field_cron_fires_on_the_minute() {
        let s = Schedule::parse("*/15 * * * *").unwrap();
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 10, 7, 30).unwrap();
        let next = s.next_after(t).unwrap();
        assert_eq!((next.hour(), next.minute(), next.second()), (10, 15, 0));
    }

    #[test]
    fn sunday_is_zero_or_seven() {
        let saturday = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        for expr in ["0 2 * * 0", "0 2 * * 7"] {
            let next = Schedule::parse(expr).unwrap().next_after(saturday).unwrap();
            assert_eq!(next.weekday(), Weekday::Sun, "{expr}");
            assert_eq!(next.hour(), 2);
        }
        assert!(Schedule::parse("* * * * 0").is_ok());
    }

    #[test]
    fn numeric_weekdays_keep_their_classic_meaning() {
        let saturday = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let next = Schedule::parse("0 2 * * 1").unwrap().next_after(saturday).unwrap();
        assert_eq!(next.weekday(), Weekday::Mon);

        let workdays = Schedule::parse("* * * * 1-5").unwrap();
        let next = workdays.next_after(saturday).unwrap();
        assert_eq!(next.weekday(), Weekday::Mon);
        let friday = Utc.with_ymd_and_hms(2024, 6, 7, 23, 58, 30).unwrap();
        let next = workdays.next_after(friday).unwrap();
        assert_eq!(next.weekday(), Weekday::Fri);
        assert_eq!(workdays.next_after(next).unwrap().weekday(), Weekday::Mon);
    }

    #[test]
    fn day_of_week_lists_and_steps_are_translated() {
        assert_eq!(shift_day_of_week("*").unwrap(), "*");
        assert_eq!(shift_day_of_week("MON-FRI").unwrap(), "MON-FRI");
        assert_eq!(shift_day_of_week("0,6").unwrap(), "1,7");
        assert_eq!(shift_day_of_week("5-7").unwrap(), "1,6,7");
        assert_eq!(shift_day_of_week("*/2").unwrap(), "1,3,5,7");
        assert!(shift_day_of_week("8").is_err());
        assert!(shift_day_of_week("5-2").is_err());
    }

    #[test]
    fn oversized_interval_is_rejected_not_panicking() {
        assert!(matches!(
            Schedule::parse("@every 99999999999999999999h"),
            Err(Error::InvalidSchedule { .. })
        ));
    }

    #[test]
    fn shorthands_parse() {
        assert!(Schedule::parse("@daily").is_ok());
        assert!(Schedule::parse("@hourly").is_ok());
    }

    #[test]
    fn invalid_expressions_name_the_input() {
        for bad in ["61 * * * *", "not a schedule", "@every", "@every 0s", "@every soon"] {
            match Schedule::parse(bad) {
                Err(Error::InvalidSchedule { expression, .. }) => assert_eq!(expression, bad),
                other => panic!("{bad:?} should be invalid, got {other:?}"),
            }
        }
    }
}
