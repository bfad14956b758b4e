use chrono::NaiveDate;
use chrono_tz::Tz;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::local_date;
use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start >= span.end {
        return Err(EngineError::validation("end must be after start"));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

// ── Conflict Filter ─────────────────────────────────────────────

/// First active booking whose buffered window overlaps the buffered `span`.
///
/// Existing bookings carry the same buffers as the candidate, so a meeting's
/// buffer zone blocks its neighbours too. Touching endpoints do not conflict.
pub fn first_conflict<'a>(
    span: &Span,
    existing: impl IntoIterator<Item = &'a Booking>,
    buffer_before: Ms,
    buffer_after: Ms,
) -> Option<Ulid> {
    let padded = span.padded(buffer_before, buffer_after);
    existing
        .into_iter()
        .filter(|b| b.status.is_active())
        .find(|b| b.span.padded(buffer_before, buffer_after).overlaps(&padded))
        .map(|b| b.id)
}

/// Candidates with no buffered overlap against any active booking.
pub fn filter_available(
    candidates: &[Span],
    existing: &[Booking],
    buffer_before: Ms,
    buffer_after: Ms,
) -> Vec<Span> {
    let mut busy: Vec<Span> = existing
        .iter()
        .filter(|b| b.status.is_active())
        .map(|b| b.span.padded(buffer_before, buffer_after))
        .collect();
    busy.sort_by_key(|s| s.start);

    candidates
        .iter()
        .filter(|c| {
            let padded = c.padded(buffer_before, buffer_after);
            // busy is sorted by start: nothing at or past padded.end can overlap.
            let right_bound = busy.partition_point(|b| b.start < padded.end);
            !busy[..right_bound].iter().any(|b| b.end > padded.start)
        })
        .copied()
        .collect()
}

/// Search window that catches every booking whose buffered span could touch
/// the buffered `span`.
pub(crate) fn conflict_search_window(span: &Span, buffer_before: Ms, buffer_after: Ms) -> Span {
    let reach = buffer_before + buffer_after;
    span.padded(reach, reach)
}

/// Fail with `SlotTaken` if `span` collides with an active booking of the
/// host. `exclude` skips one booking (the one being rescheduled).
pub(crate) fn check_no_conflict(
    hs: &HostState,
    event_type: &EventType,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    let before = event_type.buffer_before_ms();
    let after = event_type.buffer_after_ms();
    let window = conflict_search_window(span, before, after);
    let nearby = hs.overlapping(&window).filter(|b| Some(b.id) != exclude);
    match first_conflict(span, nearby, before, after) {
        Some(id) => Err(EngineError::SlotTaken(id)),
        None => Ok(()),
    }
}

/// Covers any UTC offset when scanning for bookings on the same local day.
const DAY_REACH_MS: Ms = 26 * 60 * MINUTE_MS;

/// Active bookings of `event_type` starting on `date` in `tz`.
pub(crate) fn bookings_on_day(
    hs: &HostState,
    event_type_id: Ulid,
    tz: &Tz,
    date: NaiveDate,
    around: Ms,
    exclude: Option<Ulid>,
) -> usize {
    let lo = hs
        .bookings
        .partition_point(|b| b.span.start < around - DAY_REACH_MS);
    let hi = hs
        .bookings
        .partition_point(|b| b.span.start < around + DAY_REACH_MS);
    hs.bookings[lo..hi]
        .iter()
        .filter(|b| {
            b.event_type_id == event_type_id
                && b.status.is_active()
                && Some(b.id) != exclude
                && local_date(tz, b.span.start) == Some(date)
        })
        .count()
}

/// Fail with `DailyCapReached` if the local day of `span` is already full.
pub(crate) fn check_daily_cap(
    hs: &HostState,
    event_type: &EventType,
    tz: &Tz,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    let Some(cap) = event_type.max_bookings_per_day else {
        return Ok(());
    };
    let date = local_date(tz, span.start)
        .ok_or_else(|| EngineError::validation("start time has no local date"))?;
    let taken = bookings_on_day(hs, event_type.id, tz, date, span.start, exclude);
    if taken >= cap as usize {
        return Err(EngineError::DailyCapReached(cap));
    }
    Ok(())
}
