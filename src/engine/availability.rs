use chrono::{Datelike, NaiveDate, NaiveTime, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;

use crate::model::*;

/// Candidate starts sit on this grid from each window start, whatever the
/// event duration.
pub const SLOT_STEP_MIN: Minute = 30;

// ── Slot Generator ────────────────────────────────────────────────

/// Resolve the usable wall-clock windows for `date`, sorted and disjoint.
///
/// An override for the date is used exclusively (blocked ⇒ nothing, custom ⇒
/// its single window). Otherwise the weekday's rules are unioned, so
/// overlapping or touching rules never yield duplicate slots.
pub fn day_windows(schedule: &Schedule, date: NaiveDate) -> Vec<(Minute, Minute)> {
    if let Some(date_override) = schedule.overrides.get(&date) {
        return match date_override.kind {
            OverrideKind::Custom { start, end } if start < end => {
                vec![(start, end.min(MINUTES_PER_DAY))]
            }
            OverrideKind::Custom { .. } | OverrideKind::Blocked => Vec::new(),
        };
    }

    let weekday = weekday_index(date.weekday());
    let mut windows: Vec<(Minute, Minute)> = schedule
        .rules
        .iter()
        .filter(|r| r.day_of_week == weekday && r.start < r.end)
        .map(|r| (r.start, r.end.min(MINUTES_PER_DAY)))
        .collect();
    windows.sort_unstable();
    merge_windows(&windows)
}

/// Merge sorted overlapping/adjacent windows into disjoint windows.
pub fn merge_windows(sorted: &[(Minute, Minute)]) -> Vec<(Minute, Minute)> {
    let mut merged: Vec<(Minute, Minute)> = Vec::new();
    for &(start, end) in sorted {
        if let Some(last) = merged.last_mut()
            && start <= last.1 {
                last.1 = last.1.max(end);
                continue;
            }
        merged.push((start, end));
    }
    merged
}

/// Absolute instant of `minute` past local midnight on `date`.
/// `None` when that wall-clock time does not exist (DST gap).
pub fn local_instant(tz: &Tz, date: NaiveDate, minute: Minute) -> Option<Ms> {
    let local = date.and_time(NaiveTime::MIN) + TimeDelta::minutes(i64::from(minute));
    tz.from_local_datetime(&local)
        .earliest()
        .map(|dt| dt.timestamp_millis())
}

/// Calendar date of an instant in `tz`.
pub fn local_date(tz: &Tz, t: Ms) -> Option<NaiveDate> {
    Utc.timestamp_millis_opt(t)
        .single()
        .map(|dt| dt.with_timezone(tz).date_naive())
}

/// Whether `date` is inside the booking horizon, with `today` in the
/// schedule's timezone.
pub fn in_date_range(range: &DateRange, date: NaiveDate, today: NaiveDate) -> bool {
    match range {
        DateRange::Indefinite => true,
        DateRange::RollingDays(days) => {
            (date - today).num_days() <= i64::from(*days)
        }
        DateRange::FixedRange { start, end } => *start <= date && date <= *end,
    }
}

/// Ordered bookable candidates for one date, before conflict filtering.
///
/// Pure: `now` is only used for the notice cutoff and the "today" of a
/// rolling horizon.
pub fn generate_candidates(
    schedule: &Schedule,
    event_type: &EventType,
    date: NaiveDate,
    now: Ms,
) -> Vec<Span> {
    let duration = event_type.duration_min;
    if duration == 0 {
        return Vec::new();
    }
    let tz = schedule.timezone;
    let Some(today) = local_date(&tz, now) else {
        return Vec::new();
    };
    if !in_date_range(&event_type.date_range, date, today) {
        return Vec::new();
    }

    let earliest_start = now + event_type.min_notice_ms();
    let mut candidates = Vec::new();
    for (window_start, window_end) in day_windows(schedule, date) {
        let mut t = window_start;
        while t + duration <= window_end {
            if let Some(start) = local_instant(&tz, date, t)
                && start >= earliest_start {
                    candidates.push(Span::new(start, start + event_type.duration_ms()));
                }
            t += SLOT_STEP_MIN;
        }
    }

    // Fall-back transitions can map two windows onto the same instants.
    candidates.sort_by_key(|s| s.start);
    candidates.dedup();
    candidates
}
