use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

/// Write access on behalf of one authenticated host.
///
/// The host id comes from the caller's identity layer and is trusted as
/// given. Entities owned by any other host are reported as `NotFound`, the
/// same as ids that never existed.
pub struct HostScope<'a> {
    engine: &'a Engine,
    host_id: Ulid,
}

impl Engine {
    pub fn as_host(&self, host_id: Ulid) -> HostScope<'_> {
        HostScope {
            engine: self,
            host_id,
        }
    }
}

impl HostScope<'_> {
    pub fn host_id(&self) -> Ulid {
        self.host_id
    }

    /// Entities never move between hosts, so the ownership check can run
    /// before the operation takes the host lock.
    fn owned(&self, entity_id: Ulid) -> Result<(), EngineError> {
        match self.engine.host_for_entity(&entity_id) {
            Some(owner) if owner == self.host_id => Ok(()),
            _ => Err(EngineError::NotFound(entity_id)),
        }
    }

    fn claims(&self, host_id: Ulid, entity_id: Ulid) -> Result<(), EngineError> {
        if host_id != self.host_id {
            return Err(EngineError::NotFound(entity_id));
        }
        // An existing id must also already belong to us.
        match self.engine.host_for_entity(&entity_id) {
            Some(owner) if owner != self.host_id => Err(EngineError::NotFound(entity_id)),
            _ => Ok(()),
        }
    }

    // ── Schedules ────────────────────────────────────────────

    pub async fn create_schedule(&self, schedule: Schedule) -> Result<(), EngineError> {
        self.claims(schedule.host_id, schedule.id)?;
        self.engine.create_schedule(schedule).await
    }

    pub async fn delete_schedule(&self, id: Ulid) -> Result<(), EngineError> {
        self.owned(id)?;
        self.engine.delete_schedule(id).await
    }

    pub async fn set_default_schedule(&self, schedule_id: Ulid) -> Result<(), EngineError> {
        self.owned(schedule_id)?;
        self.engine.set_default_schedule(schedule_id).await
    }

    pub async fn add_rule(
        &self,
        schedule_id: Ulid,
        day_of_week: u8,
        start: Minute,
        end: Minute,
    ) -> Result<Ulid, EngineError> {
        self.owned(schedule_id)?;
        self.engine.add_rule(schedule_id, day_of_week, start, end).await
    }

    pub async fn remove_rule(&self, schedule_id: Ulid, rule_id: Ulid) -> Result<(), EngineError> {
        self.owned(schedule_id)?;
        self.engine.remove_rule(schedule_id, rule_id).await
    }

    pub async fn set_override(
        &self,
        schedule_id: Ulid,
        date_override: DateOverride,
    ) -> Result<(), EngineError> {
        self.owned(schedule_id)?;
        self.engine.set_override(schedule_id, date_override).await
    }

    pub async fn remove_override(&self, schedule_id: Ulid, date: NaiveDate) -> Result<(), EngineError> {
        self.owned(schedule_id)?;
        self.engine.remove_override(schedule_id, date).await
    }

    // ── Event types and links ────────────────────────────────

    pub async fn save_event_type(&self, event_type: EventType) -> Result<(), EngineError> {
        self.claims(event_type.host_id, event_type.id)?;
        self.engine.save_event_type(event_type).await
    }

    pub async fn set_event_type_active(&self, id: Ulid, active: bool) -> Result<(), EngineError> {
        self.owned(id)?;
        self.engine.set_event_type_active(id, active).await
    }

    pub async fn create_link(
        &self,
        event_type_id: Ulid,
        contact_name: Option<String>,
        contact_email: Option<String>,
        expires_at: Option<Ms>,
    ) -> Result<SingleUseLink, EngineError> {
        self.owned(event_type_id)?;
        self.engine
            .create_link(event_type_id, contact_name, contact_email, expires_at)
            .await
    }

    // ── Bookings ─────────────────────────────────────────────

    pub async fn get_bookings(
        &self,
        range: Span,
        statuses: &[BookingStatus],
    ) -> Result<Vec<Booking>, EngineError> {
        self.engine.get_bookings(self.host_id, range, statuses).await
    }

    pub async fn cancel_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.owned(id)?;
        self.engine.cancel_booking(id).await
    }

    pub async fn confirm_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.owned(id)?;
        self.engine.confirm_booking(id).await
    }

    pub async fn reschedule_booking(&self, id: Ulid, span: Span) -> Result<Booking, EngineError> {
        self.owned(id)?;
        self.engine.reschedule_booking(id, span).await
    }
}
