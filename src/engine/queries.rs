use chrono::{Days, NaiveDate};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::availability::generate_candidates;
use super::conflict::{bookings_on_day, conflict_search_window, filter_available, now_ms};
use super::{Engine, EngineError, SharedHostState};

/// Slots of one date against an already-locked host. Empty if the
/// event type is inactive, has no schedule, or the day is at its cap.
fn slots_for_date(hs: &HostState, event_type: &EventType, date: NaiveDate, now: Ms) -> Vec<Span> {
    if !event_type.active {
        return Vec::new();
    }
    let Some(schedule) = hs.schedule_for(event_type) else {
        return Vec::new();
    };
    let candidates = generate_candidates(schedule, event_type, date, now);
    let (Some(first), Some(last)) = (candidates.first(), candidates.last()) else {
        return Vec::new();
    };

    if let Some(cap) = event_type.max_bookings_per_day {
        let taken = bookings_on_day(hs, event_type.id, &schedule.timezone, date, first.start, None);
        if taken >= cap as usize {
            return Vec::new();
        }
    }

    let before = event_type.buffer_before_ms();
    let after = event_type.buffer_after_ms();
    let window = conflict_search_window(&Span::new(first.start, last.end), before, after);
    let nearby: Vec<Booking> = hs.overlapping(&window).cloned().collect();
    filter_available(&candidates, &nearby, before, after)
}

impl Engine {
    fn event_type_host(&self, event_type_id: Ulid) -> Result<SharedHostState, EngineError> {
        let host_id = self
            .store
            .host_for_entity(&event_type_id)
            .ok_or(EngineError::NotFound(event_type_id))?;
        self.store
            .get_host(&host_id)
            .ok_or(EngineError::NotFound(host_id))
    }

    /// Bookable slots for one date, as of now.
    pub async fn available_slots(
        &self,
        event_type_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<Span>, EngineError> {
        self.available_slots_at(event_type_id, date, now_ms()).await
    }

    /// Bookable slots for one date, as of `now`. Advisory only: admission
    /// re-checks everything under the host lock.
    pub async fn available_slots_at(
        &self,
        event_type_id: Ulid,
        date: NaiveDate,
        now: Ms,
    ) -> Result<Vec<Span>, EngineError> {
        metrics::counter!(observability::SLOT_QUERIES_TOTAL).increment(1);
        let rs = self.event_type_host(event_type_id)?;
        let guard = rs.read().await;
        let event_type = guard
            .event_types
            .get(&event_type_id)
            .ok_or(EngineError::NotFound(event_type_id))?;
        Ok(slots_for_date(&guard, event_type, date, now))
    }

    /// Days in `[from, from + days)` that have at least one slot.
    pub async fn available_days(
        &self,
        event_type_id: Ulid,
        from: NaiveDate,
        days: u32,
    ) -> Result<Vec<DaySlots>, EngineError> {
        self.available_days_at(event_type_id, from, days, now_ms()).await
    }

    pub async fn available_days_at(
        &self,
        event_type_id: Ulid,
        from: NaiveDate,
        days: u32,
        now: Ms,
    ) -> Result<Vec<DaySlots>, EngineError> {
        if days > MAX_QUERY_DAYS {
            return Err(EngineError::LimitExceeded("query range too wide"));
        }
        metrics::counter!(observability::SLOT_QUERIES_TOTAL).increment(1);
        let rs = self.event_type_host(event_type_id)?;
        let guard = rs.read().await;
        let event_type = guard
            .event_types
            .get(&event_type_id)
            .ok_or(EngineError::NotFound(event_type_id))?;

        let mut result = Vec::new();
        for offset in 0..days {
            let Some(date) = from.checked_add_days(Days::new(u64::from(offset))) else {
                break;
            };
            let slots = slots_for_date(&guard, event_type, date, now);
            if !slots.is_empty() {
                result.push(DaySlots { date, slots });
            }
        }
        Ok(result)
    }

    /// The link and where it stands, for rendering a booking page.
    pub async fn link_state(&self, token: &str) -> Result<(SingleUseLink, LinkState), EngineError> {
        let host_id = self
            .store
            .host_for_token(token)
            .ok_or(EngineError::LinkInvalid)?;
        let rs = self.store.get_host(&host_id).ok_or(EngineError::LinkInvalid)?;
        let guard = rs.read().await;
        let link = guard.links.get(token).cloned().ok_or(EngineError::LinkInvalid)?;
        let state = link.state(now_ms());
        Ok((link, state))
    }

    /// A host's bookings overlapping `range`, filtered by status. An empty
    /// `statuses` means all of them.
    pub async fn get_bookings(
        &self,
        host_id: Ulid,
        range: Span,
        statuses: &[BookingStatus],
    ) -> Result<Vec<Booking>, EngineError> {
        let rs = self
            .store
            .get_host(&host_id)
            .ok_or(EngineError::NotFound(host_id))?;
        let guard = rs.read().await;
        Ok(guard
            .overlapping(&range)
            .filter(|b| statuses.is_empty() || statuses.contains(&b.status))
            .cloned()
            .collect())
    }

    pub async fn get_booking(&self, id: Ulid) -> Option<Booking> {
        let host_id = self.store.host_for_entity(&id)?;
        let rs = self.store.get_host(&host_id)?;
        let guard = rs.read().await;
        guard.booking(id).cloned()
    }

    pub async fn get_event_type(&self, id: Ulid) -> Option<EventType> {
        let host_id = self.store.host_for_entity(&id)?;
        let rs = self.store.get_host(&host_id)?;
        let guard = rs.read().await;
        guard.event_types.get(&id).cloned()
    }

    pub async fn get_schedule(&self, id: Ulid) -> Option<Schedule> {
        let host_id = self.store.host_for_entity(&id)?;
        let rs = self.store.get_host(&host_id)?;
        let guard = rs.read().await;
        guard.schedules.get(&id).cloned()
    }

    pub async fn list_hosts(&self) -> Vec<HostInfo> {
        let mut hosts = Vec::with_capacity(self.store.host_count());
        for id in self.store.host_ids() {
            let Some(rs) = self.store.get_host(&id) else {
                continue;
            };
            let guard = rs.read().await;
            hosts.push(HostInfo {
                id: guard.id,
                name: guard.name.clone(),
                default_schedule: guard.default_schedule,
                schedule_count: guard.schedules.len(),
                event_type_count: guard.event_types.len(),
            });
        }
        hosts.sort_by_key(|h| h.id);
        hosts
    }
}
