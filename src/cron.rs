//! Cron expression parsing and next-firing computation.
//!
//! Accepts the classic five fields (minute hour day-of-month month
//! day-of-week) with an optional leading seconds field:
//!
//! ```text
//! ┌───────────── second (0-59, optional)
//! │ ┌───────────── minute (0-59)
//! │ │ ┌───────────── hour (0-23)
//! │ │ │ ┌───────────── day of month (1-31)
//! │ │ │ │ ┌───────────── month (1-12)
//! │ │ │ │ │ ┌───────────── day of week (0-6, 0 = Sunday)
//! │ │ │ │ │ │
//! * * * * * *
//! ```
//!
//! Each field supports `*`, single values, ranges (`a-b`), steps
//! (`*/n`, `a-b/n`), and comma-separated lists.

use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Search bound for the next firing: four years of minutes, enough to
/// cross any leap-year / day-of-week alignment gap.
const MAX_MINUTE_STEPS: u32 = 4 * 366 * 24 * 60;

#[derive(Debug, Error)]
pub enum CronError {
    #[error("expected 5 or 6 fields, got {0}")]
    FieldCount(usize),
    #[error("invalid value {value:?} in {field} field")]
    InvalidValue { field: &'static str, value: String },
    #[error("value {value} out of range {min}-{max} in {field} field")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },
    #[error("descending range {0}-{1}")]
    DescendingRange(u32, u32),
    #[error("step must be non-zero")]
    ZeroStep,
}

/// One field of a schedule, expanded to its admissible value set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Field {
    values: BTreeSet<u32>,
    min: u32,
    max: u32,
}

impl Field {
    fn parse(name: &'static str, expr: &str, min: u32, max: u32) -> Result<Self, CronError> {
        let mut field = Field {
            values: BTreeSet::new(),
            min,
            max,
        };
        for part in expr.split(',') {
            field.parse_part(name, part.trim())?;
        }
        Ok(field)
    }

    fn parse_part(&mut self, name: &'static str, part: &str) -> Result<(), CronError> {
        let (range, step) = match part.split_once('/') {
            Some((range, step_str)) => {
                let step = step_str.parse::<u32>().map_err(|_| CronError::InvalidValue {
                    field: name,
                    value: part.to_string(),
                })?;
                if step == 0 {
                    return Err(CronError::ZeroStep);
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (start, end) = if range == "*" {
            (self.min, self.max)
        } else if let Some((lo, hi)) = range.split_once('-') {
            let parse = |s: &str| {
                s.parse::<u32>().map_err(|_| CronError::InvalidValue {
                    field: name,
                    value: part.to_string(),
                })
            };
            let (lo, hi) = (parse(lo)?, parse(hi)?);
            if lo > hi {
                return Err(CronError::DescendingRange(lo, hi));
            }
            (lo, hi)
        } else {
            let v = range.parse::<u32>().map_err(|_| CronError::InvalidValue {
                field: name,
                value: part.to_string(),
            })?;
            (v, v)
        };

        if start < self.min || end > self.max {
            return Err(CronError::OutOfRange {
                field: name,
                value: if start < self.min { start } else { end },
                min: self.min,
                max: self.max,
            });
        }

        self.values.extend((start..=end).step_by(step as usize));
        Ok(())
    }

    fn contains(&self, value: u32) -> bool {
        self.values.contains(&value)
    }

    /// Smallest admissible value >= `value`.
    fn next_from(&self, value: u32) -> Option<u32> {
        self.values.range(value..).next().copied()
    }

    /// A field that admits its whole range places no restriction.
    fn is_wildcard(&self) -> bool {
        self.values.len() as u32 == self.max - self.min + 1
    }
}

/// A parsed cron schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronSchedule {
    source: String,
    second: Field,
    minute: Field,
    hour: Field,
    day_of_month: Field,
    month: Field,
    day_of_week: Field,
}

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let parts: Vec<&str> = expr.split_whitespace().collect();
        let (second_src, rest): (&str, &[&str]) = match parts.len() {
            5 => ("0", &parts[..]),
            6 => (parts[0], &parts[1..]),
            n => return Err(CronError::FieldCount(n)),
        };

        Ok(Self {
            source: expr.to_string(),
            second: Field::parse("second", second_src, 0, 59)?,
            minute: Field::parse("minute", rest[0], 0, 59)?,
            hour: Field::parse("hour", rest[1], 0, 23)?,
            day_of_month: Field::parse("day-of-month", rest[2], 1, 31)?,
            month: Field::parse("month", rest[3], 1, 12)?,
            day_of_week: Field::parse("day-of-week", rest[4], 0, 6)?,
        })
    }

    /// The expression this schedule was parsed from.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Classic cron rule: when both day fields are restricted, a date
    /// matches if either one does; otherwise both must.
    fn day_matches(&self, t: &DateTime<Utc>) -> bool {
        let dom = self.day_of_month.contains(t.day());
        let dow = self.day_of_week.contains(t.weekday().num_days_from_sunday());
        if self.day_of_month.is_wildcard() || self.day_of_week.is_wildcard() {
            dom && dow
        } else {
            dom || dow
        }
    }

    pub fn matches(&self, t: &DateTime<Utc>) -> bool {
        self.month.contains(t.month())
            && self.day_matches(t)
            && self.hour.contains(t.hour())
            && self.minute.contains(t.minute())
            && self.second.contains(t.second())
    }

    /// Next firing strictly after `after`. Returns None only if no
    /// admissible instant exists within the search bound.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut t = (after + chrono::Duration::seconds(1)).with_nanosecond(0)?;

        for _ in 0..MAX_MINUTE_STEPS {
            if self.month.contains(t.month())
                && self.day_matches(&t)
                && self.hour.contains(t.hour())
                && self.minute.contains(t.minute())
            {
                if let Some(s) = self.second.next_from(t.second()) {
                    return t.with_second(s);
                }
            }
            // Advance to the start of the next minute.
            t = t.with_second(0)? + chrono::Duration::minutes(1);
        }

        None
    }
}

impl FromStr for CronSchedule {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CronSchedule::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn wildcard_fields_admit_full_range() {
        let sched = CronSchedule::parse("* * * * *").unwrap();
        assert_eq!(sched.minute.values.len(), 60);
        assert_eq!(sched.hour.values.len(), 24);
        // Implicit seconds field pins to zero.
        assert_eq!(sched.second.values.len(), 1);
        assert!(sched.second.contains(0));
    }

    #[test]
    fn single_values_and_ranges() {
        let sched = CronSchedule::parse("30 4 * * *").unwrap();
        assert!(sched.minute.contains(30));
        assert!(sched.hour.contains(4));
        assert!(!sched.hour.contains(5));

        let sched = CronSchedule::parse("0-30 * * * *").unwrap();
        assert_eq!(sched.minute.values.len(), 31);
        assert!(!sched.minute.contains(31));
    }

    #[test]
    fn steps_and_lists() {
        let sched = CronSchedule::parse("*/15 * * * *").unwrap();
        assert_eq!(sched.minute.values.len(), 4);
        assert!(sched.minute.contains(45));

        let sched = CronSchedule::parse("0,15,30,45 * * * *").unwrap();
        assert_eq!(sched.minute.values.len(), 4);
    }

    #[test]
    fn optional_seconds_field() {
        let sched = CronSchedule::parse("*/10 * * * * *").unwrap();
        assert_eq!(sched.second.values.len(), 6);

        let after = Utc.with_ymd_and_hms(2024, 1, 15, 14, 30, 5).unwrap();
        let next = sched.next_after(after).unwrap();
        assert_eq!(next.second(), 10);
        assert_eq!(next.minute(), 30);
    }

    #[test]
    fn matches_exact_instant() {
        let sched = CronSchedule::parse("30 4 * * *").unwrap();
        let hit = Utc.with_ymd_and_hms(2024, 1, 15, 4, 30, 0).unwrap();
        let miss = Utc.with_ymd_and_hms(2024, 1, 15, 4, 31, 0).unwrap();
        assert!(sched.matches(&hit));
        assert!(!sched.matches(&miss));
    }

    #[test]
    fn next_after_hourly() {
        let sched = CronSchedule::parse("0 * * * *").unwrap();
        let after = Utc.with_ymd_and_hms(2024, 1, 15, 14, 30, 0).unwrap();
        let next = sched.next_after(after).unwrap();
        assert_eq!(next.hour(), 15);
        assert_eq!(next.minute(), 0);
        assert_eq!(next.second(), 0);
    }

    #[test]
    fn next_after_rolls_to_next_day() {
        let sched = CronSchedule::parse("0 3 * * *").unwrap();
        let after = Utc.with_ymd_and_hms(2024, 1, 15, 14, 30, 0).unwrap();
        let next = sched.next_after(after).unwrap();
        assert_eq!(next.day(), 16);
        assert_eq!(next.hour(), 3);
    }

    #[test]
    fn next_after_every_minute_is_strictly_increasing() {
        let sched = CronSchedule::parse("*/1 * * * *").unwrap();
        let t0 = Utc.with_ymd_and_hms(2024, 1, 15, 14, 30, 0).unwrap();
        let t1 = sched.next_after(t0).unwrap();
        let t2 = sched.next_after(t1).unwrap();
        assert!(t1 > t0);
        assert!(t2 > t1);
        assert_eq!((t2 - t1).num_seconds(), 60);
    }

    #[test]
    fn restricted_dom_and_dow_combine_with_or() {
        // The 13th of any month, or any Friday.
        let sched = CronSchedule::parse("0 0 13 * 5").unwrap();
        // 2024-09-13 is a Friday: matches both.
        let both = Utc.with_ymd_and_hms(2024, 9, 13, 0, 0, 0).unwrap();
        // 2024-09-20 is a Friday, not the 13th.
        let friday = Utc.with_ymd_and_hms(2024, 9, 20, 0, 0, 0).unwrap();
        // 2024-08-13 is a Tuesday: matches on day-of-month alone.
        let thirteenth = Utc.with_ymd_and_hms(2024, 8, 13, 0, 0, 0).unwrap();
        // 2024-09-19 is a Thursday, not the 13th.
        let neither = Utc.with_ymd_and_hms(2024, 9, 19, 0, 0, 0).unwrap();

        assert!(sched.matches(&both));
        assert!(sched.matches(&friday));
        assert!(sched.matches(&thirteenth));
        assert!(!sched.matches(&neither));
    }

    #[test]
    fn rejects_malformed_expressions() {
        assert!(CronSchedule::parse("* *").is_err());
        assert!(CronSchedule::parse("60 * * * *").is_err());
        assert!(CronSchedule::parse("* 25 * * *").is_err());
        assert!(CronSchedule::parse("*/0 * * * *").is_err());
        assert!(CronSchedule::parse("30-10 * * * *").is_err());
        assert!(CronSchedule::parse("x * * * *").is_err());
    }
}
