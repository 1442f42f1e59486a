//! Five-field Unix cron expressions: `MIN HOUR DOM MON DOW`.
//!
//! Supports `*`, lists, ranges, steps (`*/N`, `A-B/N`, `A/N`), month and
//! weekday names, and `7` as Sunday. When both day-of-month and day-of-week
//! are restricted (neither starts with `*`) a day matches if either does.

use std::str::FromStr;

use chrono::{Datelike, Days, LocalResult, NaiveDate, NaiveTime, TimeZone};

use crate::error::ValidationError;

/// How far ahead `next_after` searches before giving up.
const SEARCH_DAYS: u64 = 5 * 366;

const MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const WEEKDAY_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_restricted: bool,
    dow_restricted: bool,
}

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
    /// Value the first entry of `names` maps to.
    names_base: u32,
}

const MINUTE: FieldSpec = FieldSpec { name: "minute", min: 0, max: 59, names: &[], names_base: 0 };
const HOUR: FieldSpec = FieldSpec { name: "hour", min: 0, max: 23, names: &[], names_base: 0 };
const DAY_OF_MONTH: FieldSpec = FieldSpec { name: "day-of-month", min: 1, max: 31, names: &[], names_base: 0 };
const MONTH: FieldSpec = FieldSpec { name: "month", min: 1, max: 12, names: &MONTH_NAMES, names_base: 1 };
// 7 is accepted and folded onto Sunday after parsing.
const DAY_OF_WEEK: FieldSpec = FieldSpec { name: "day-of-week", min: 0, max: 7, names: &WEEKDAY_NAMES, names_base: 0 };

impl FromStr for CronExpr {
    type Err = ValidationError;

    fn from_str(expr: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: String| ValidationError::InvalidCron {
            expr: expr.to_string(),
            reason,
        };

        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(invalid(format!("expected 5 fields, found {}", fields.len())));
        }

        let minutes = parse_field(fields[0], &MINUTE).map_err(invalid)?;
        let hours = parse_field(fields[1], &HOUR).map_err(invalid)?;
        let days_of_month = parse_field(fields[2], &DAY_OF_MONTH).map_err(invalid)?;
        let months = parse_field(fields[3], &MONTH).map_err(invalid)?;
        let mut days_of_week = parse_field(fields[4], &DAY_OF_WEEK).map_err(invalid)?;
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week & !(1 << 7)) | 1;
        }

        Ok(Self {
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            dom_restricted: !fields[2].starts_with('*'),
            dow_restricted: !fields[4].starts_with('*'),
        })
    }
}

fn parse_value(raw: &str, spec: &FieldSpec) -> Result<u32, String> {
    let lower = raw.to_ascii_lowercase();
    if let Some(pos) = spec.names.iter().position(|n| *n == lower) {
        return Ok(spec.names_base + pos as u32);
    }
    let value: u32 = raw
        .parse()
        .map_err(|_| format!("bad {} value `{raw}`", spec.name))?;
    if value < spec.min || value > spec.max {
        return Err(format!(
            "{} value {value} outside {}-{}",
            spec.name, spec.min, spec.max
        ));
    }
    Ok(value)
}

fn parse_field(field: &str, spec: &FieldSpec) -> Result<u64, String> {
    let mut bits = 0u64;
    for item in field.split(',') {
        if item.is_empty() {
            return Err(format!("empty item in {} field", spec.name));
        }
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("bad step `{step}` in {} field", spec.name))?;
                if step == 0 {
                    return Err(format!("zero step in {} field", spec.name));
                }
                (range, step)
            }
            None => (item, 1),
        };

        let (start, end) = if range == "*" {
            (spec.min, spec.max)
        } else if let Some((a, b)) = range.split_once('-') {
            let (a, b) = (parse_value(a, spec)?, parse_value(b, spec)?);
            if a > b {
                return Err(format!("descending range `{range}` in {} field", spec.name));
            }
            (a, b)
        } else {
            let a = parse_value(range, spec)?;
            // `A/N` runs from A to the end of the field.
            if item.contains('/') { (a, spec.max) } else { (a, a) }
        };

        let mut v = start;
        while v <= end {
            bits |= 1 << v;
            v += step;
        }
    }
    Ok(bits)
}

impl CronExpr {
    fn has(bits: u64, v: u32) -> bool {
        bits & (1 << v) != 0
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        if !Self::has(self.months, date.month()) {
            return false;
        }
        let dom = Self::has(self.days_of_month, date.day());
        let dow = Self::has(self.days_of_week, date.weekday().num_days_from_sunday());
        if self.dom_restricted && self.dow_restricted {
            dom || dow
        } else {
            dom && dow
        }
    }

    /// Smallest minute-aligned instant `>= from_ms` whose local fields in `tz`
    /// match. Local times inside a DST gap never match; for an ambiguous local
    /// time the earlier instant is used.
    pub fn next_after<Z: TimeZone>(&self, tz: &Z, from_ms: i64) -> Option<i64> {
        let start_ms = from_ms.checked_add(59_999)?.div_euclid(60_000) * 60_000;
        let start_local = tz.timestamp_millis_opt(start_ms).single()?.naive_local();
        // One day of slack so a fall-back hour that repeats earlier wall
        // times is never missed.
        let mut date = start_local.date().checked_sub_days(Days::new(1))?;

        for _ in 0..=SEARCH_DAYS + 1 {
            if self.day_matches(date) {
                for hour in 0..24 {
                    if !Self::has(self.hours, hour) {
                        continue;
                    }
                    for minute in 0..60 {
                        if !Self::has(self.minutes, minute) {
                            continue;
                        }
                        let Some(time) = NaiveTime::from_hms_opt(hour, minute, 0) else {
                            continue;
                        };
                        let instant = match tz.from_local_datetime(&date.and_time(time)) {
                            LocalResult::Single(dt) => dt,
                            LocalResult::Ambiguous(earlier, _) => earlier,
                            LocalResult::None => continue,
                        };
                        let ms = instant.timestamp_millis();
                        if ms >= start_ms {
                            return Some(ms);
                        }
                    }
                }
            }
            date = date.succ_opt()?;
        }
        None
    }
}
