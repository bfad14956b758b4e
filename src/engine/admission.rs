use std::time::Instant;

use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{self, outcome_label};
use crate::outbound::MeetingRequest;

use super::availability::{generate_candidates, local_date};
use super::conflict::{check_daily_cap, check_no_conflict, now_ms, validate_span};
use super::{Engine, EngineError};

/// Stored as the location when no join link could be obtained.
pub const VIDEO_LINK_PLACEHOLDER: &str = "Video link will be shared by the host before the meeting";

/// An invitee asking for one slot of an event type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionRequest {
    pub event_type_id: Ulid,
    pub invitee: Invitee,
    pub span: Span,
    pub single_use_token: Option<String>,
}

impl AdmissionRequest {
    pub fn new(event_type_id: Ulid, invitee: Invitee, span: Span) -> Self {
        Self {
            event_type_id,
            invitee,
            span,
            single_use_token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.single_use_token = Some(token.into());
        self
    }
}

fn validate_request(request: &AdmissionRequest) -> Result<(), EngineError> {
    validate_span(&request.span)?;
    let invitee = &request.invitee;
    if invitee.name.trim().is_empty() {
        return Err(EngineError::validation("invitee name is required"));
    }
    if invitee.name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("invitee name too long"));
    }
    if invitee.email.len() > MAX_EMAIL_LEN {
        return Err(EngineError::LimitExceeded("invitee email too long"));
    }
    if !invitee.email.contains('@') {
        return Err(EngineError::validation("invitee email is malformed"));
    }
    if let Some(token) = &request.single_use_token
        && token.len() > MAX_NAME_LEN {
            return Err(EngineError::LinkInvalid);
        }
    Ok(())
}

fn check_duration(event_type: &EventType, span: &Span) -> Result<(), EngineError> {
    if span.duration_ms() != event_type.duration_ms() {
        return Err(EngineError::validation(format!(
            "slot must be {} minutes long",
            event_type.duration_min
        )));
    }
    Ok(())
}

/// Link checks in the order an invitee should hear about them.
fn check_link(link: &SingleUseLink, event_type_id: Ulid, now: Ms) -> Result<(), EngineError> {
    match link.state(now) {
        LinkState::Consumed => Err(EngineError::LinkConsumed),
        LinkState::Expired => Err(EngineError::LinkExpired),
        LinkState::Pending if link.event_type_id != event_type_id => {
            Err(EngineError::LinkMismatch)
        }
        LinkState::Pending => Ok(()),
    }
}

/// The requested span must be one of the offered candidates of its date.
fn check_offered(
    schedule: &Schedule,
    event_type: &EventType,
    span: &Span,
    now: Ms,
) -> Result<(), EngineError> {
    let date = local_date(&schedule.timezone, span.start).ok_or(EngineError::SlotUnavailable)?;
    let candidates = generate_candidates(schedule, event_type, date, now);
    if candidates.binary_search_by_key(&span.start, |c| c.start).is_err() {
        return Err(EngineError::SlotUnavailable);
    }
    Ok(())
}

/// Every rule a new booking must pass against one view of its host. Returns
/// the event type it was checked against.
fn check_admissible(
    hs: &HostState,
    request: &AdmissionRequest,
    now: Ms,
) -> Result<EventType, EngineError> {
    let event_type = hs
        .event_types
        .get(&request.event_type_id)
        .cloned()
        .ok_or_else(|| EngineError::validation("unknown event type"))?;
    if !event_type.active {
        return Err(EngineError::EventTypeInactive(event_type.id));
    }
    check_duration(&event_type, &request.span)?;

    if let Some(token) = &request.single_use_token {
        let link = hs.links.get(token).ok_or(EngineError::LinkInvalid)?;
        check_link(link, event_type.id, now)?;
    }

    let schedule = hs
        .schedule_for(&event_type)
        .ok_or(EngineError::SlotUnavailable)?;
    check_offered(schedule, &event_type, &request.span, now)?;
    check_no_conflict(hs, &event_type, &request.span, None)?;
    check_daily_cap(hs, &event_type, &schedule.timezone, &request.span, None)?;
    Ok(event_type)
}

/// The rules for moving booking `id` to `span`, which are the admission
/// rules minus the link, with the booking itself ignored.
fn check_reschedulable(
    hs: &HostState,
    id: Ulid,
    span: &Span,
    now: Ms,
) -> Result<(Booking, EventType), EngineError> {
    let booking = hs.booking(id).cloned().ok_or(EngineError::NotFound(id))?;
    if !booking.status.is_active() {
        return Err(EngineError::InvalidTransition {
            id,
            from: status_name(booking.status),
            to: "rescheduled",
        });
    }
    let event_type = hs
        .event_types
        .get(&booking.event_type_id)
        .cloned()
        .ok_or(EngineError::NotFound(booking.event_type_id))?;
    if !event_type.active {
        return Err(EngineError::EventTypeInactive(event_type.id));
    }
    check_duration(&event_type, span)?;

    let schedule = hs
        .schedule_for(&event_type)
        .ok_or(EngineError::SlotUnavailable)?;
    check_offered(schedule, &event_type, span, now)?;
    check_no_conflict(hs, &event_type, span, Some(id))?;
    check_daily_cap(hs, &event_type, &schedule.timezone, span, Some(id))?;
    Ok((booking, event_type))
}

fn at_booking_limit(hs: &HostState) -> bool {
    hs.bookings.len() >= MAX_BOOKINGS_PER_HOST
        && hs.active_booking_count() >= MAX_BOOKINGS_PER_HOST
}

impl Engine {
    /// Admit a booking, or reject it with exactly one reason.
    ///
    /// Everything from the link check to the journal append runs under the
    /// host's lock, so two admissions for the same host never interleave.
    /// Calls to the conferencing provider happen before the lock is taken
    /// and notifications after it is released.
    pub async fn admit(&self, request: AdmissionRequest) -> Result<Booking, EngineError> {
        let started = Instant::now();
        let event_type_id = request.event_type_id;
        let result = self.admit_inner(request).await;
        metrics::counter!(observability::ADMISSIONS_TOTAL, "outcome" => outcome_label(&result))
            .increment(1);
        metrics::histogram!(observability::ADMISSION_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());

        match &result {
            Ok(b) => info!(
                booking = %b.id,
                host = %b.host_id,
                event_type = %b.event_type_id,
                start = b.span.start,
                "booking admitted"
            ),
            Err(e) if e.is_retryable() => {
                warn!(event_type = %event_type_id, "admission failed: {e}")
            }
            Err(e) => debug!(event_type = %event_type_id, "admission rejected: {e}"),
        }
        result
    }

    async fn admit_inner(&self, request: AdmissionRequest) -> Result<Booking, EngineError> {
        validate_request(&request)?;
        let host_id = self
            .store
            .host_for_entity(&request.event_type_id)
            .ok_or_else(|| EngineError::validation("unknown event type"))?;

        if let Some(token) = &request.single_use_token {
            self.check_foreign_link(host_id, token).await?;
        }

        // Requests that would fail anyway never reach the conferencing
        // provider. Everything is checked again under the lock below.
        let snapshot = {
            let hs = self.read_host(host_id).await?;
            check_admissible(&hs, &request, now_ms())?
        };
        let location = self.resolve_location(&snapshot, &request.span).await;

        let mut guard = self.lock_host(host_id).await?;
        let now = now_ms();
        let event_type = check_admissible(&guard, &request, now)?;
        if at_booking_limit(&guard) {
            return Err(EngineError::LimitExceeded("too many bookings for host"));
        }

        let booking = Booking {
            id: Ulid::new(),
            event_type_id: event_type.id,
            host_id,
            span: request.span,
            status: BookingStatus::Confirmed,
            invitee: request.invitee,
            location,
            single_use_token: request.single_use_token,
            created_at: now,
        };
        let event = Event::BookingAdmitted {
            host_id,
            booking: booking.clone(),
        };
        self.persist_and_apply(host_id, &mut guard, &event).await?;
        drop(guard);

        self.dispatch_confirmed(booking.clone());
        Ok(booking)
    }

    /// A token that belongs to another host can never be used here. Report
    /// its state the same way a local link would be reported.
    async fn check_foreign_link(&self, host_id: Ulid, token: &str) -> Result<(), EngineError> {
        let owner = self
            .store
            .host_for_token(token)
            .ok_or(EngineError::LinkInvalid)?;
        if owner == host_id {
            return Ok(());
        }
        let guard = self.read_host(owner).await?;
        let link = guard.links.get(token).ok_or(EngineError::LinkInvalid)?;
        match link.state(now_ms()) {
            LinkState::Consumed => Err(EngineError::LinkConsumed),
            LinkState::Expired => Err(EngineError::LinkExpired),
            LinkState::Pending => Err(EngineError::LinkMismatch),
        }
    }

    /// Location string for a new booking. Never fails: a conferencing error
    /// or timeout yields the placeholder.
    async fn resolve_location(&self, event_type: &EventType, span: &Span) -> String {
        match &event_type.location {
            LocationPolicy::Unspecified => String::new(),
            LocationPolicy::Phone(number) => number.clone(),
            LocationPolicy::InPerson(address) => address.clone(),
            LocationPolicy::Video => {
                let request = MeetingRequest {
                    topic: event_type.title.clone(),
                    start: span.start,
                    duration_min: event_type.duration_min,
                    host_id: event_type.host_id,
                };
                let call = self.collaborators.conferencer.create_meeting(&request);
                let failure = match tokio::time::timeout(self.options.conferencing_timeout, call).await
                {
                    Ok(Ok(url)) if url.len() <= MAX_LOCATION_LEN => return url,
                    Ok(Ok(_)) => "join link too long".to_string(),
                    Ok(Err(e)) => e.to_string(),
                    Err(_) => "timed out".to_string(),
                };
                warn!(
                    event_type = %event_type.id,
                    "conferencing unavailable, using placeholder: {failure}"
                );
                metrics::counter!(observability::CONFERENCING_FALLBACKS_TOTAL).increment(1);
                VIDEO_LINK_PLACEHOLDER.to_string()
            }
        }
    }

    /// Fire-and-forget confirmation. Failures are logged, never surfaced.
    fn dispatch_confirmed(&self, booking: Booking) {
        let notifier = self.collaborators.notifier.clone();
        tokio::spawn(async move {
            if let Err(e) = notifier.booking_confirmed(&booking).await {
                warn!(booking = %booking.id, "confirmation notice failed: {e}");
                metrics::counter!(observability::NOTIFICATION_FAILURES_TOTAL).increment(1);
            }
        });
    }

    fn dispatch_rescheduled(&self, booking: Booking, previous: Span) {
        let notifier = self.collaborators.notifier.clone();
        tokio::spawn(async move {
            if let Err(e) = notifier.booking_rescheduled(&booking, &previous).await {
                warn!(booking = %booking.id, "reschedule notice failed: {e}");
                metrics::counter!(observability::NOTIFICATION_FAILURES_TOTAL).increment(1);
            }
        });
    }

    pub(super) fn dispatch_cancelled(&self, booking: Booking) {
        let notifier = self.collaborators.notifier.clone();
        tokio::spawn(async move {
            if let Err(e) = notifier.booking_cancelled(&booking).await {
                warn!(booking = %booking.id, "cancellation notice failed: {e}");
                metrics::counter!(observability::NOTIFICATION_FAILURES_TOTAL).increment(1);
            }
        });
    }

    /// Move an active booking to a new span of the same event type. The
    /// booking's own time does not block the move. A video booking gets a
    /// meeting for the new time, and the invitee is notified once the move
    /// is committed.
    pub async fn reschedule_booking(&self, id: Ulid, span: Span) -> Result<Booking, EngineError> {
        validate_span(&span)?;
        let host_id = self
            .store
            .host_for_entity(&id)
            .ok_or(EngineError::NotFound(id))?;

        let (_, snapshot) = {
            let hs = self.read_host(host_id).await?;
            check_reschedulable(&hs, id, &span, now_ms())?
        };
        let relocated = match snapshot.location {
            LocationPolicy::Video => Some(self.resolve_location(&snapshot, &span).await),
            _ => None,
        };

        let mut guard = self.lock_host(host_id).await?;
        let (booking, event_type) = check_reschedulable(&guard, id, &span, now_ms())?;
        // The event type may have stopped being a video type meanwhile.
        let location = relocated.filter(|_| event_type.location == LocationPolicy::Video);

        let event = Event::BookingRescheduled {
            host_id,
            id,
            span,
            location: location.clone(),
        };
        self.persist_and_apply(host_id, &mut guard, &event).await?;
        drop(guard);
        info!(booking = %id, start = span.start, "booking rescheduled");

        let previous = booking.span;
        let moved = Booking {
            span,
            location: location.unwrap_or(booking.location),
            ..booking
        };
        self.dispatch_rescheduled(moved.clone(), previous);
        Ok(moved)
    }
}

pub(super) fn status_name(status: BookingStatus) -> &'static str {
    match status {
        BookingStatus::Pending => "pending",
        BookingStatus::Confirmed => "confirmed",
        BookingStatus::Cancelled => "cancelled",
        BookingStatus::Completed => "completed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(event_type_id: Ulid) -> SingleUseLink {
        SingleUseLink {
            token: "t".into(),
            host_id: Ulid::new(),
            event_type_id,
            contact_name: None,
            contact_email: None,
            consumed_by: None,
            expires_at: Some(1_000),
            created_at: 0,
        }
    }

    #[test]
    fn link_checks_report_in_order() {
        let et = Ulid::new();
        let mut l = link(Ulid::new());
        // Mismatch only shows once the link is otherwise usable.
        assert!(matches!(check_link(&l, et, 2_000), Err(EngineError::LinkExpired)));
        assert!(matches!(check_link(&l, et, 500), Err(EngineError::LinkMismatch)));
        l.consumed_by = Some(Ulid::new());
        assert!(matches!(check_link(&l, et, 2_000), Err(EngineError::LinkConsumed)));
    }

    #[test]
    fn pending_matching_link_passes() {
        let et = Ulid::new();
        assert!(check_link(&link(et), et, 500).is_ok());
    }

    #[test]
    fn request_validation() {
        let span = Span::new(MIN_VALID_TIMESTAMP_MS, MIN_VALID_TIMESTAMP_MS + 30 * MINUTE_MS);
        let ok = AdmissionRequest::new(Ulid::new(), Invitee::new("Ada", "ada@example.com"), span);
        assert!(validate_request(&ok).is_ok());

        let no_name = AdmissionRequest {
            invitee: Invitee::new("  ", "ada@example.com"),
            ..ok.clone()
        };
        assert!(matches!(validate_request(&no_name), Err(EngineError::Validation(_))));

        let bad_email = AdmissionRequest {
            invitee: Invitee::new("Ada", "ada.example.com"),
            ..ok.clone()
        };
        assert!(matches!(validate_request(&bad_email), Err(EngineError::Validation(_))));

        let huge_token = ok.clone().with_token("x".repeat(MAX_NAME_LEN + 1));
        assert!(matches!(validate_request(&huge_token), Err(EngineError::LinkInvalid)));
    }
}
