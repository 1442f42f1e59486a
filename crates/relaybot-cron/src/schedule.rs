//! Next-run computation and schedule validation.

use chrono::Local;
use chrono_tz::Tz;

use crate::cron_expr::CronExpr;
use crate::error::ValidationError;
use crate::types::Schedule;

/// Resolve an optional IANA zone name. `None` means the host local zone.
pub fn parse_tz(tz: Option<&str>) -> Result<Option<Tz>, ValidationError> {
    match tz.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(name) => name
            .parse::<Tz>()
            .map(Some)
            .map_err(|_| ValidationError::UnknownTimeZone(name.to_string())),
    }
}

fn cron_next(expr: &CronExpr, tz: Option<Tz>, from_ms: i64) -> Option<i64> {
    match tz {
        Some(tz) => expr.next_after(&tz, from_ms),
        None => expr.next_after(&Local, from_ms),
    }
}

/// Next fire time strictly after (`at`, `every`) or at-or-after (`cron`)
/// `from_ms`. `None` means the schedule is exhausted or invalid.
pub fn next_run(schedule: &Schedule, from_ms: i64) -> Option<i64> {
    match schedule {
        Schedule::At { at_ms } => (*at_ms > from_ms).then_some(*at_ms),
        Schedule::Every { every_ms, anchor_ms } => {
            let every = *every_ms;
            if every <= 0 {
                return None;
            }
            match anchor_ms {
                None => from_ms.checked_add(every),
                Some(anchor) if *anchor > from_ms => Some(*anchor),
                Some(anchor) => {
                    let k = (from_ms - anchor) / every + 1;
                    k.checked_mul(every)?.checked_add(*anchor)
                }
            }
        }
        Schedule::Cron { expr, tz } => {
            let parsed: CronExpr = expr.parse().ok()?;
            let tz = parse_tz(tz.as_deref()).ok()?;
            cron_next(&parsed, tz, from_ms)
        }
    }
}

/// Reject schedules that are malformed or can never fire.
pub fn validate_schedule(schedule: &Schedule, now_ms: i64) -> Result<(), ValidationError> {
    match schedule {
        Schedule::At { at_ms } => {
            if *at_ms <= 0 {
                return Err(ValidationError::InvalidSchedule(format!("atMs must be positive, got {at_ms}")));
            }
        }
        Schedule::Every { every_ms, anchor_ms } => {
            if *every_ms <= 0 {
                return Err(ValidationError::InvalidSchedule(format!(
                    "everyMs must be positive, got {every_ms}"
                )));
            }
            if anchor_ms.is_some_and(|a| a < 0) {
                return Err(ValidationError::InvalidSchedule("anchorMs must not be negative".into()));
            }
        }
        Schedule::Cron { expr, tz } => {
            let parsed: CronExpr = expr.parse()?;
            let tz = parse_tz(tz.as_deref())?;
            if cron_next(&parsed, tz, now_ms).is_none() {
                return Err(ValidationError::InvalidCron {
                    expr: expr.clone(),
                    reason: "never matches".into(),
                });
            }
        }
    }
    Ok(())
}

/// Parse `"90s"`, `"10m"`, `"2h"`, `"1d"`, `"500ms"`, `"1h30m"`. A bare
/// integer is milliseconds. Zero is rejected.
pub fn parse_duration_ms(input: &str) -> Result<i64, ValidationError> {
    let invalid = || ValidationError::InvalidDuration(input.to_string());
    let s = input.trim().to_ascii_lowercase();
    if s.is_empty() {
        return Err(invalid());
    }

    if s.bytes().all(|b| b.is_ascii_digit()) {
        let ms: i64 = s.parse().map_err(|_| invalid())?;
        return if ms > 0 { Ok(ms) } else { Err(invalid()) };
    }

    let mut total: i64 = 0;
    let mut rest = s.as_str();
    while !rest.is_empty() {
        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        if digits == 0 {
            return Err(invalid());
        }
        let value: i64 = rest[..digits].parse().map_err(|_| invalid())?;
        rest = &rest[digits..];

        let unit_len = rest.bytes().take_while(u8::is_ascii_alphabetic).count();
        let factor = match &rest[..unit_len] {
            "ms" => 1,
            "s" => 1_000,
            "m" => 60_000,
            "h" => 3_600_000,
            "d" => 86_400_000,
            _ => return Err(invalid()),
        };
        rest = &rest[unit_len..];

        total = value
            .checked_mul(factor)
            .and_then(|v| total.checked_add(v))
            .ok_or_else(invalid)?;
    }

    if total > 0 { Ok(total) } else { Err(invalid()) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_at() {
        let s = Schedule::At { at_ms: 1_000 };
        assert_eq!(next_run(&s, 999), Some(1_000));
        assert_eq!(next_run(&s, 1_000), None);
        assert_eq!(next_run(&s, 5_000), None);
    }

    #[test]
    fn test_every_with_anchor() {
        let s = Schedule::Every { every_ms: 10, anchor_ms: Some(3) };
        assert_eq!(next_run(&s, 0), Some(3));
        assert_eq!(next_run(&s, 3), Some(13));
        assert_eq!(next_run(&s, 12), Some(13));
        assert_eq!(next_run(&s, 13), Some(23));
    }

    #[test]
    fn test_cron_utc() {
        let s = Schedule::Cron { expr: "0 9 * * 3".into(), tz: Some("UTC".into()) };
        // Thu 2026-01-01 00:00 UTC → Wed 2026-01-07 09:00 UTC
        assert_eq!(next_run(&s, 1_767_225_600_000), Some(1_767_776_400_000));
    }

    #[test]
    fn test_validate_schedule() {
        let now = 1_767_225_600_000;
        assert!(validate_schedule(&Schedule::At { at_ms: now + 1 }, now).is_ok());
        assert!(validate_schedule(&Schedule::Every { every_ms: 0, anchor_ms: None }, now).is_err());
        assert!(matches!(
            validate_schedule(&Schedule::Cron { expr: "0 0 31 2 *".into(), tz: None }, now),
            Err(ValidationError::InvalidCron { .. })
        ));
        assert_eq!(
            validate_schedule(
                &Schedule::Cron { expr: "* * * * *".into(), tz: Some("Mars/Olympus".into()) },
                now
            ),
            Err(ValidationError::UnknownTimeZone("Mars/Olympus".into()))
        );
        assert!(validate_schedule(
            &Schedule::Cron { expr: "*/5 * * * *".into(), tz: Some("Europe/Berlin".into()) },
            now
        )
        .is_ok());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration_ms("90s"), Ok(90_000));
        assert_eq!(parse_duration_ms("10m"), Ok(600_000));
        assert_eq!(parse_duration_ms("2h"), Ok(7_200_000));
        assert_eq!(parse_duration_ms("1d"), Ok(86_400_000));
        assert_eq!(parse_duration_ms("500ms"), Ok(500));
        assert_eq!(parse_duration_ms("1h30m"), Ok(5_400_000));
        assert_eq!(parse_duration_ms(" 1500 "), Ok(1_500));
        assert_eq!(parse_duration_ms("2H"), Ok(7_200_000));
    }

    #[test]
    fn test_parse_duration_rejects() {
        for bad in ["", "0", "0s", "abc", "10x", "m", "1.5h", "-5m", "10 m"] {
            assert!(parse_duration_ms(bad).is_err(), "accepted {bad:?}");
        }
    }

    proptest! {
        #[test]
        fn every_without_anchor_adds_interval(every in 1i64..10_000_000_000, from in 0i64..4_000_000_000_000) {
            let s = Schedule::Every { every_ms: every, anchor_ms: None };
            prop_assert_eq!(next_run(&s, from), Some(from + every));
        }

        #[test]
        fn every_with_anchor_is_smallest_aligned(
            every in 1i64..1_000_000,
            anchor in 0i64..1_000_000_000,
            from in 0i64..2_000_000_000,
        ) {
            let s = Schedule::Every { every_ms: every, anchor_ms: Some(anchor) };
            let next = next_run(&s, from).unwrap();
            prop_assert!(next > from);
            prop_assert_eq!((next - anchor) % every, 0);
            prop_assert!(next >= anchor);
            // nothing aligned fits between from and next
            prop_assert!(next - every <= from || next - every < anchor);
        }

        #[test]
        fn cron_result_is_minute_aligned_and_not_before_query(
            minute in 0u32..60,
            hour in 0u32..24,
            from in 1_700_000_000_000i64..1_900_000_000_000,
        ) {
            let s = Schedule::Cron { expr: format!("{minute} {hour} * * *"), tz: Some("UTC".into()) };
            let next = next_run(&s, from).unwrap();
            prop_assert!(next >= from);
            prop_assert!(next - from <= 86_400_000);
            prop_assert_eq!(next % 60_000, 0);
        }
    }
}
