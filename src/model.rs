use std::collections::{BTreeMap, HashMap};

use chrono::{NaiveDate, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only absolute time type.
pub type Ms = i64;

/// Wall-clock minutes since local midnight, `0..=1440`.
pub type Minute = u32;

pub const MINUTE_MS: Ms = 60_000;
pub const MINUTES_PER_DAY: Minute = 1440;

/// Wall-clock time as minutes since midnight.
pub const fn hm(hour: u32, minute: u32) -> Minute {
    hour * 60 + minute
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Widen the span by `before` on the left and `after` on the right.
    pub fn padded(&self, before: Ms, after: Ms) -> Span {
        Span {
            start: self.start - before,
            end: self.end + after,
        }
    }
}

/// `day_of_week` numbering: 0 = Sunday … 6 = Saturday.
pub fn weekday_index(day: Weekday) -> u8 {
    day.num_days_from_sunday() as u8
}

// ── Availability rule set ───────────────────────────────────────

/// A recurring weekly window in the schedule's timezone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityRule {
    pub id: Ulid,
    pub day_of_week: u8,
    pub start: Minute,
    pub end: Minute,
}

impl AvailabilityRule {
    pub fn new(day_of_week: u8, start: Minute, end: Minute) -> Self {
        Self {
            id: Ulid::new(),
            day_of_week,
            start,
            end,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverrideKind {
    /// No availability at all on this date.
    Blocked,
    /// Only this window is usable on this date.
    Custom { start: Minute, end: Minute },
}

/// Per-date exception. Fully replaces the weekly rules for `date`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateOverride {
    pub date: NaiveDate,
    pub kind: OverrideKind,
}

impl DateOverride {
    pub fn blocked(date: NaiveDate) -> Self {
        Self {
            date,
            kind: OverrideKind::Blocked,
        }
    }

    pub fn custom(date: NaiveDate, start: Minute, end: Minute) -> Self {
        Self {
            date,
            kind: OverrideKind::Custom { start, end },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Ulid,
    pub host_id: Ulid,
    pub name: String,
    #[serde(with = "tz_name")]
    pub timezone: Tz,
    pub rules: Vec<AvailabilityRule>,
    /// At most one override per date.
    pub overrides: BTreeMap<NaiveDate, DateOverride>,
}

impl Schedule {
    pub fn new(id: Ulid, host_id: Ulid, name: impl Into<String>, timezone: Tz) -> Self {
        Self {
            id,
            host_id,
            name: name.into(),
            timezone,
            rules: Vec::new(),
            overrides: BTreeMap::new(),
        }
    }

    pub fn with_rule(mut self, day_of_week: u8, start: Minute, end: Minute) -> Self {
        self.rules.push(AvailabilityRule::new(day_of_week, start, end));
        self
    }

    pub fn with_override(mut self, date_override: DateOverride) -> Self {
        self.overrides.insert(date_override.date, date_override);
        self
    }
}

/// Serialize a timezone by its IANA name.
mod tz_name {
    use chrono_tz::Tz;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(tz: &Tz, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(tz.name())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Tz, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse::<Tz>().map_err(serde::de::Error::custom)
    }
}

// ── Event types ────────────────────────────────────────────────

/// How far into the future an event type can be booked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DateRange {
    #[default]
    Indefinite,
    /// Up to `n` calendar days after today (schedule timezone).
    RollingDays(u32),
    /// Both bounds inclusive.
    FixedRange { start: NaiveDate, end: NaiveDate },
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LocationPolicy {
    #[default]
    Unspecified,
    Phone(String),
    InPerson(String),
    /// Join link obtained from the conferencing collaborator at admission.
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventType {
    pub id: Ulid,
    pub host_id: Ulid,
    /// `None` resolves to the host's default schedule.
    pub schedule_id: Option<Ulid>,
    pub title: String,
    pub duration_min: u32,
    pub buffer_before_min: u32,
    pub buffer_after_min: u32,
    pub min_notice_min: u32,
    pub max_bookings_per_day: Option<u32>,
    pub date_range: DateRange,
    pub location: LocationPolicy,
    pub active: bool,
}

impl EventType {
    pub fn new(id: Ulid, host_id: Ulid, title: impl Into<String>, duration_min: u32) -> Self {
        Self {
            id,
            host_id,
            schedule_id: None,
            title: title.into(),
            duration_min,
            buffer_before_min: 0,
            buffer_after_min: 0,
            min_notice_min: 0,
            max_bookings_per_day: None,
            date_range: DateRange::Indefinite,
            location: LocationPolicy::Unspecified,
            active: true,
        }
    }

    pub fn duration_ms(&self) -> Ms {
        Ms::from(self.duration_min) * MINUTE_MS
    }

    pub fn buffer_before_ms(&self) -> Ms {
        Ms::from(self.buffer_before_min) * MINUTE_MS
    }

    pub fn buffer_after_ms(&self) -> Ms {
        Ms::from(self.buffer_after_min) * MINUTE_MS
    }

    pub fn min_notice_ms(&self) -> Ms {
        Ms::from(self.min_notice_min) * MINUTE_MS
    }
}

// ── Bookings ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
}

impl BookingStatus {
    /// Only active bookings occupy time and count toward daily caps.
    pub fn is_active(self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Confirmed)
    }

    pub fn can_transition_to(self, next: BookingStatus) -> bool {
        matches!(
            (self, next),
            (BookingStatus::Pending, BookingStatus::Confirmed)
                | (BookingStatus::Pending, BookingStatus::Cancelled)
                | (BookingStatus::Confirmed, BookingStatus::Cancelled)
                | (BookingStatus::Confirmed, BookingStatus::Completed)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invitee {
    pub name: String,
    pub email: String,
    /// Display only. Conflict logic is always in absolute time.
    pub timezone: Option<String>,
}

impl Invitee {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
            timezone: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub event_type_id: Ulid,
    pub host_id: Ulid,
    pub span: Span,
    pub status: BookingStatus,
    pub invitee: Invitee,
    pub location: String,
    /// The single-use token consumed by this booking, if any.
    pub single_use_token: Option<String>,
    pub created_at: Ms,
}

// ── Single-use links ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    Pending,
    Consumed,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SingleUseLink {
    pub token: String,
    pub host_id: Ulid,
    pub event_type_id: Ulid,
    pub contact_name: Option<String>,
    pub contact_email: Option<String>,
    /// Booking that consumed the link. `Some` means used.
    pub consumed_by: Option<Ulid>,
    pub expires_at: Option<Ms>,
    pub created_at: Ms,
}

impl SingleUseLink {
    pub fn is_used(&self) -> bool {
        self.consumed_by.is_some()
    }

    pub fn is_expired(&self, now: Ms) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Consumed wins over expired: a used link stays `Consumed` forever.
    pub fn state(&self, now: Ms) -> LinkState {
        if self.is_used() {
            LinkState::Consumed
        } else if self.is_expired(now) {
            LinkState::Expired
        } else {
            LinkState::Pending
        }
    }
}

// ── Host state ─────────────────────────────────────────────────

/// Everything owned by one host. Guarded by a single per-host lock.
#[derive(Debug, Clone)]
pub struct HostState {
    pub id: Ulid,
    pub name: Option<String>,
    pub default_schedule: Option<Ulid>,
    pub schedules: BTreeMap<Ulid, Schedule>,
    pub event_types: BTreeMap<Ulid, EventType>,
    /// All bookings (any status), sorted by `span.start`.
    pub bookings: Vec<Booking>,
    pub links: HashMap<String, SingleUseLink>,
}

impl HostState {
    pub fn new(id: Ulid, name: Option<String>) -> Self {
        Self {
            id,
            name,
            default_schedule: None,
            schedules: BTreeMap::new(),
            event_types: BTreeMap::new(),
            bookings: Vec::new(),
            links: HashMap::new(),
        }
    }

    /// Insert booking maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .partition_point(|b| b.span.start <= booking.span.start);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// Bookings of any status whose span overlaps the query window.
    /// Uses binary search to skip bookings starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self
            .bookings
            .partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }

    pub fn active_booking_count(&self) -> usize {
        self.bookings.iter().filter(|b| b.status.is_active()).count()
    }

    /// Links that can still be redeemed at `now`.
    pub fn pending_link_count(&self, now: Ms) -> usize {
        self.links
            .values()
            .filter(|l| l.state(now) == LinkState::Pending)
            .count()
    }

    fn is_stale_booking(b: &Booking, before: Ms) -> bool {
        !b.status.is_active() && b.span.end <= before
    }

    /// A link is stale once it expired unused by `before`, or once the
    /// booking that consumed it is gone or itself stale.
    fn is_stale_link(&self, link: &SingleUseLink, before: Ms) -> bool {
        match link.consumed_by {
            None => link.is_expired(before),
            Some(id) => self
                .booking(id)
                .is_none_or(|b| Self::is_stale_booking(b, before)),
        }
    }

    /// How many records `purge_history(before)` would drop.
    pub fn purgeable(&self, before: Ms) -> usize {
        let bookings = self
            .bookings
            .iter()
            .filter(|b| Self::is_stale_booking(b, before))
            .count();
        let links = self
            .links
            .values()
            .filter(|l| self.is_stale_link(l, before))
            .count();
        bookings + links
    }

    /// Drop cancelled and completed bookings that ended by `before`, and the
    /// links that can no longer matter. Returns the removed booking ids and
    /// link tokens.
    pub fn purge_history(&mut self, before: Ms) -> (Vec<Ulid>, Vec<String>) {
        let tokens: Vec<String> = self
            .links
            .values()
            .filter(|l| self.is_stale_link(l, before))
            .map(|l| l.token.clone())
            .collect();
        for token in &tokens {
            self.links.remove(token);
        }
        let mut ids = Vec::new();
        self.bookings.retain(|b| {
            let stale = Self::is_stale_booking(b, before);
            if stale {
                ids.push(b.id);
            }
            !stale
        });
        (ids, tokens)
    }

    /// Schedule an event type resolves to: its own, else the host default.
    pub fn schedule_for(&self, event_type: &EventType) -> Option<&Schedule> {
        let id = event_type.schedule_id.or(self.default_schedule)?;
        self.schedules.get(&id)
    }
}

/// The journal record format: one event per committed mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    HostCreated {
        id: Ulid,
        name: Option<String>,
    },
    /// Carries the full schedule so compaction can emit rules with it.
    ScheduleCreated {
        host_id: Ulid,
        schedule: Schedule,
    },
    ScheduleDeleted {
        host_id: Ulid,
        id: Ulid,
    },
    DefaultScheduleSet {
        host_id: Ulid,
        schedule_id: Ulid,
    },
    RuleAdded {
        host_id: Ulid,
        schedule_id: Ulid,
        rule: AvailabilityRule,
    },
    RuleRemoved {
        host_id: Ulid,
        schedule_id: Ulid,
        rule_id: Ulid,
    },
    OverrideSet {
        host_id: Ulid,
        schedule_id: Ulid,
        date_override: DateOverride,
    },
    OverrideRemoved {
        host_id: Ulid,
        schedule_id: Ulid,
        date: NaiveDate,
    },
    EventTypeSaved {
        host_id: Ulid,
        event_type: EventType,
    },
    LinkCreated {
        host_id: Ulid,
        link: SingleUseLink,
    },
    /// Booking insert and link consumption (via `booking.single_use_token`)
    /// in one record.
    BookingAdmitted {
        host_id: Ulid,
        booking: Booking,
    },
    BookingStatusChanged {
        host_id: Ulid,
        id: Ulid,
        status: BookingStatus,
    },
    /// `location` is `Some` when the move also re-resolved the location.
    BookingRescheduled {
        host_id: Ulid,
        id: Ulid,
        span: Span,
        location: Option<String>,
    },
    /// Retention sweep. Replays to the same removals.
    HistoryPurged {
        host_id: Ulid,
        before: Ms,
    },
}

impl Event {
    pub fn host_id(&self) -> Ulid {
        match self {
            Event::HostCreated { id, .. } => *id,
            Event::ScheduleCreated { host_id, .. }
            | Event::ScheduleDeleted { host_id, .. }
            | Event::DefaultScheduleSet { host_id, .. }
            | Event::RuleAdded { host_id, .. }
            | Event::RuleRemoved { host_id, .. }
            | Event::OverrideSet { host_id, .. }
            | Event::OverrideRemoved { host_id, .. }
            | Event::EventTypeSaved { host_id, .. }
            | Event::LinkCreated { host_id, .. }
            | Event::BookingAdmitted { host_id, .. }
            | Event::BookingStatusChanged { host_id, .. }
            | Event::BookingRescheduled { host_id, .. }
            | Event::HistoryPurged { host_id, .. } => *host_id,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    pub id: Ulid,
    pub name: Option<String>,
    pub default_schedule: Option<Ulid>,
    pub schedule_count: usize,
    pub event_type_count: usize,
}

/// One picker day and its bookable slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaySlots {
    pub date: NaiveDate,
    pub slots: Vec<Span>,
}
