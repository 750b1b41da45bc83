//! Timezone-safe scheduling arithmetic (spec.md §4.5).
//!
//! Two rules drive everything here:
//! 1. Cron/exact-time expressions are interpreted in the entity's IANA zone
//!    against current wall-clock in that zone, then converted back to UTC.
//! 2. Deadlines are *never* formed by reinterpreting a UTC instant through
//!    local time — they're `utc_instant + Duration`, full stop. This avoids
//!    the DST-shift regression spec.md calls out.

use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::common::error::{AppError, Result};

/// Parse an IANA timezone string (e.g. "Europe/Moscow").
pub fn parse_timezone(tz: &str) -> Result<Tz> {
    Tz::from_str(tz).map_err(|_| AppError::InvalidTimezone(tz.to_string()))
}

/// Compute the next firing of a cron expression strictly after `now`,
/// interpreted in `tz`, returned in UTC.
///
/// Mirrors `croniter(schedule, now_tz).get_next(datetime)` from the source:
/// convert `now` to local wall-clock, evaluate the cron schedule from there,
/// and convert the result back to UTC for storage.
pub fn next_cron_fire(expr: &str, tz: Tz, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let schedule = cron::Schedule::from_str(&normalize_cron_expr(expr))
        .map_err(|e| AppError::InvalidCron(e.to_string()))?;
    let local_now = now.with_timezone(&tz);
    let next = schedule
        .after(&local_now)
        .next()
        .ok_or_else(|| AppError::InvalidCron(format!("no upcoming fire time for '{expr}'")))?;
    Ok(next.with_timezone(&Utc))
}

/// Next firing for an `interval` process monitor: simply `now + interval`.
pub fn next_interval_fire(now: DateTime<Utc>, interval_seconds: i64) -> DateTime<Utc> {
    now + Duration::seconds(interval_seconds)
}

/// Next firing for an `exact_time` process monitor (HH:MM in `tz`). If that
/// instant has already passed today (in `tz`), moves to tomorrow.
pub fn next_exact_time_fire(hhmm: &str, tz: Tz, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let (hour, minute) = parse_hhmm(hhmm)?;
    let local_now = now.with_timezone(&tz);
    let today_target = NaiveTime::from_hms_opt(hour, minute, 0)
        .ok_or_else(|| AppError::InvalidCron(format!("invalid HH:MM '{hhmm}'")))?;

    let mut candidate_date = local_now.date_naive();
    let mut candidate = tz
        .from_local_datetime(&candidate_date.and_time(today_target))
        .single()
        .unwrap_or_else(|| tz.from_utc_datetime(&candidate_date.and_time(today_target)));

    if candidate <= local_now {
        candidate_date = candidate_date.succ_opt().unwrap_or(candidate_date);
        candidate = tz
            .from_local_datetime(&candidate_date.and_time(today_target))
            .single()
            .unwrap_or_else(|| tz.from_utc_datetime(&candidate_date.and_time(today_target)));
    }

    Ok(candidate.with_timezone(&Utc))
}

/// CronTask/TaskChain schedules are stored as standard 5-field unix cron
/// (`min hour dom month dow`, the croniter convention in the source). The
/// `cron` crate requires a leading seconds field; prepend "0" when the
/// expression doesn't already carry one.
fn normalize_cron_expr(expr: &str) -> String {
    let field_count = expr.split_whitespace().count();
    if field_count == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

fn parse_hhmm(hhmm: &str) -> Result<(u32, u32)> {
    let (h, m) = hhmm
        .split_once(':')
        .ok_or_else(|| AppError::InvalidCron(format!("invalid HH:MM '{hhmm}'")))?;
    let hour: u32 = h
        .parse()
        .map_err(|_| AppError::InvalidCron(format!("invalid HH:MM '{hhmm}'")))?;
    let minute: u32 = m
        .parse()
        .map_err(|_| AppError::InvalidCron(format!("invalid HH:MM '{hhmm}'")))?;
    Ok((hour, minute))
}

/// Deadline arithmetic: `base + grace`, pure UTC duration addition. Never
/// derive a deadline by reinterpreting a UTC value through local time.
pub fn deadline_after(base: DateTime<Utc>, grace_seconds: i64) -> DateTime<Utc> {
    base + Duration::seconds(grace_seconds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone as _;

    #[test]
    fn cron_every_five_minutes_in_moscow() {
        // spec.md §8 boundary scenario (a)
        let now = Utc.with_ymd_and_hms(2026, 1, 19, 10, 2, 0).unwrap();
        let tz = parse_timezone("Europe/Moscow").unwrap();
        let next = next_cron_fire("*/5 * * * *", tz, now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 19, 10, 5, 0).unwrap());
    }

    #[test]
    fn exact_time_rolls_to_tomorrow_when_passed() {
        // spec.md §8 boundary scenario (b): end-ping at 2026-01-24T00:00:04Z,
        // exact_time 03:00 Europe/Moscow (UTC+3) -> next start 2026-01-25T00:00:00Z
        let now = Utc.with_ymd_and_hms(2026, 1, 24, 0, 0, 4).unwrap();
        let tz = parse_timezone("Europe/Moscow").unwrap();
        let next = next_exact_time_fire("03:00", tz, now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 25, 0, 0, 0).unwrap());

        let deadline = deadline_after(next, 300);
        assert_eq!(deadline, Utc.with_ymd_and_hms(2026, 1, 25, 0, 5, 0).unwrap());
    }

    #[test]
    fn deadline_invariant_holds_regardless_of_timezone() {
        let base = Utc.with_ymd_and_hms(2026, 3, 29, 1, 30, 0).unwrap(); // around a DST shift
        let deadline = deadline_after(base, 600);
        assert_eq!(deadline - base, Duration::seconds(600));
    }

    #[test]
    fn interval_fire_is_additive() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(
            next_interval_fire(now, 90),
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 1, 30).unwrap()
        );
    }
}
