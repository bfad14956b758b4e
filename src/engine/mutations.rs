use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::NaiveDate;
use rand::RngCore;
use tokio::sync::{oneshot, OwnedRwLockReadGuard};
use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::admission::status_name;
use super::conflict::now_ms;
use super::{Engine, EngineError, WalCommand};

/// 24 random bytes, 32 URL-safe characters.
const TOKEN_BYTES: usize = 24;

fn new_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn validate_name(name: &str, what: &'static str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::validation(format!("{what} is required")));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

fn validate_window(start: Minute, end: Minute) -> Result<(), EngineError> {
    if start >= end {
        return Err(EngineError::validation("window end must be after start"));
    }
    if end > MINUTES_PER_DAY {
        return Err(EngineError::validation("window must end by midnight"));
    }
    Ok(())
}

fn validate_rule(rule: &AvailabilityRule) -> Result<(), EngineError> {
    if rule.day_of_week > 6 {
        return Err(EngineError::validation("day_of_week must be 0..=6"));
    }
    validate_window(rule.start, rule.end)
}

fn validate_override(date_override: &DateOverride) -> Result<(), EngineError> {
    match date_override.kind {
        OverrideKind::Blocked => Ok(()),
        OverrideKind::Custom { start, end } => validate_window(start, end),
    }
}

fn validate_event_type(hs: &HostState, et: &EventType) -> Result<(), EngineError> {
    validate_name(&et.title, "title")?;
    if et.duration_min == 0 {
        return Err(EngineError::validation("duration must be positive"));
    }
    if et.duration_min > MAX_EVENT_DURATION_MIN {
        return Err(EngineError::LimitExceeded("event too long"));
    }
    if et.buffer_before_min > MAX_BUFFER_MIN || et.buffer_after_min > MAX_BUFFER_MIN {
        return Err(EngineError::LimitExceeded("buffer too long"));
    }
    if et.min_notice_min > MAX_NOTICE_MIN {
        return Err(EngineError::LimitExceeded("notice too long"));
    }
    if et.max_bookings_per_day == Some(0) {
        return Err(EngineError::validation("daily limit must be positive"));
    }
    if let DateRange::FixedRange { start, end } = et.date_range
        && start > end {
            return Err(EngineError::validation("date range end is before its start"));
        }
    match &et.location {
        LocationPolicy::Phone(s) | LocationPolicy::InPerson(s) if s.len() > MAX_LOCATION_LEN => {
            return Err(EngineError::LimitExceeded("location too long"));
        }
        _ => {}
    }
    if let Some(sid) = et.schedule_id
        && !hs.schedules.contains_key(&sid) {
            return Err(EngineError::NotFound(sid));
        }
    Ok(())
}

fn schedule_mut(hs: &mut HostState, id: Ulid) -> Result<&mut Schedule, EngineError> {
    hs.schedules.get_mut(&id).ok_or(EngineError::NotFound(id))
}

impl Engine {
    // ── Hosts and schedules ──────────────────────────────────

    pub async fn create_host(&self, id: Ulid, name: Option<String>) -> Result<(), EngineError> {
        if self.store.host_count() >= MAX_HOSTS {
            return Err(EngineError::LimitExceeded("too many hosts"));
        }
        if let Some(n) = &name
            && n.len() > MAX_NAME_LEN {
                return Err(EngineError::LimitExceeded("host name too long"));
            }
        let Some(guard) = self.store.reserve_host(HostState::new(id, name.clone())) else {
            return Err(EngineError::AlreadyExists(id));
        };

        let event = Event::HostCreated { id, name };
        if let Err(e) = self.wal_append(&event).await {
            self.store.remove_host(&id);
            return Err(e);
        }
        drop(guard);
        self.notify.send(id, &event);
        metrics::gauge!(observability::HOSTS_ACTIVE).set(self.store.host_count() as f64);
        info!(host = %id, "host created");
        Ok(())
    }

    /// Add a schedule with its initial rules and overrides. A host's first
    /// schedule becomes its default.
    pub async fn create_schedule(&self, schedule: Schedule) -> Result<(), EngineError> {
        validate_name(&schedule.name, "schedule name")?;
        if schedule.rules.len() > MAX_RULES_PER_SCHEDULE {
            return Err(EngineError::LimitExceeded("too many rules"));
        }
        if schedule.overrides.len() > MAX_OVERRIDES_PER_SCHEDULE {
            return Err(EngineError::LimitExceeded("too many overrides"));
        }
        for rule in &schedule.rules {
            validate_rule(rule)?;
        }
        for date_override in schedule.overrides.values() {
            validate_override(date_override)?;
        }
        if self.store.host_for_entity(&schedule.id).is_some() {
            return Err(EngineError::AlreadyExists(schedule.id));
        }

        let host_id = schedule.host_id;
        let schedule_id = schedule.id;
        let mut guard = self.lock_host(host_id).await?;
        if guard.schedules.len() >= MAX_SCHEDULES_PER_HOST {
            return Err(EngineError::LimitExceeded("too many schedules"));
        }
        // The id may have been taken while we waited for the lock.
        if self.store.claim_entity(schedule_id, host_id) != Ok(true) {
            return Err(EngineError::AlreadyExists(schedule_id));
        }
        let event = Event::ScheduleCreated { host_id, schedule };
        self.persist_and_apply(host_id, &mut guard, &event)
            .await
            .inspect_err(|_| self.store.release_entity(&schedule_id))
    }

    /// Refuses while the schedule is the default or an event type uses it.
    pub async fn delete_schedule(&self, id: Ulid) -> Result<(), EngineError> {
        let (host_id, mut guard) = self.resolve_entity_write(&id).await?;
        if !guard.schedules.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        if guard.default_schedule == Some(id)
            || guard.event_types.values().any(|et| et.schedule_id == Some(id))
        {
            return Err(EngineError::ScheduleInUse(id));
        }
        let event = Event::ScheduleDeleted { host_id, id };
        self.persist_and_apply(host_id, &mut guard, &event).await
    }

    pub async fn set_default_schedule(&self, schedule_id: Ulid) -> Result<(), EngineError> {
        let (host_id, mut guard) = self.resolve_entity_write(&schedule_id).await?;
        if !guard.schedules.contains_key(&schedule_id) {
            return Err(EngineError::NotFound(schedule_id));
        }
        let event = Event::DefaultScheduleSet {
            host_id,
            schedule_id,
        };
        self.persist_and_apply(host_id, &mut guard, &event).await
    }

    pub async fn add_rule(
        &self,
        schedule_id: Ulid,
        day_of_week: u8,
        start: Minute,
        end: Minute,
    ) -> Result<Ulid, EngineError> {
        let rule = AvailabilityRule::new(day_of_week, start, end);
        validate_rule(&rule)?;
        let (host_id, mut guard) = self.resolve_entity_write(&schedule_id).await?;
        if schedule_mut(&mut guard, schedule_id)?.rules.len() >= MAX_RULES_PER_SCHEDULE {
            return Err(EngineError::LimitExceeded("too many rules"));
        }
        let rule_id = rule.id;
        let event = Event::RuleAdded {
            host_id,
            schedule_id,
            rule,
        };
        self.persist_and_apply(host_id, &mut guard, &event).await?;
        Ok(rule_id)
    }

    pub async fn remove_rule(&self, schedule_id: Ulid, rule_id: Ulid) -> Result<(), EngineError> {
        let (host_id, mut guard) = self.resolve_entity_write(&schedule_id).await?;
        if !schedule_mut(&mut guard, schedule_id)?
            .rules
            .iter()
            .any(|r| r.id == rule_id)
        {
            return Err(EngineError::NotFound(rule_id));
        }
        let event = Event::RuleRemoved {
            host_id,
            schedule_id,
            rule_id,
        };
        self.persist_and_apply(host_id, &mut guard, &event).await
    }

    /// Set or replace the override for its date.
    pub async fn set_override(
        &self,
        schedule_id: Ulid,
        date_override: DateOverride,
    ) -> Result<(), EngineError> {
        validate_override(&date_override)?;
        let (host_id, mut guard) = self.resolve_entity_write(&schedule_id).await?;
        let schedule = schedule_mut(&mut guard, schedule_id)?;
        if !schedule.overrides.contains_key(&date_override.date)
            && schedule.overrides.len() >= MAX_OVERRIDES_PER_SCHEDULE
        {
            return Err(EngineError::LimitExceeded("too many overrides"));
        }
        let event = Event::OverrideSet {
            host_id,
            schedule_id,
            date_override,
        };
        self.persist_and_apply(host_id, &mut guard, &event).await
    }

    pub async fn remove_override(
        &self,
        schedule_id: Ulid,
        date: NaiveDate,
    ) -> Result<(), EngineError> {
        let (host_id, mut guard) = self.resolve_entity_write(&schedule_id).await?;
        if !schedule_mut(&mut guard, schedule_id)?
            .overrides
            .contains_key(&date)
        {
            return Err(EngineError::validation(format!("no override on {date}")));
        }
        let event = Event::OverrideRemoved {
            host_id,
            schedule_id,
            date,
        };
        self.persist_and_apply(host_id, &mut guard, &event).await
    }

    // ── Event types ──────────────────────────────────────────

    /// Create or replace an event type. Changes never touch existing bookings.
    pub async fn save_event_type(&self, event_type: EventType) -> Result<(), EngineError> {
        let host_id = event_type.host_id;
        if let Some(owner) = self.store.host_for_entity(&event_type.id)
            && owner != host_id {
                return Err(EngineError::AlreadyExists(event_type.id));
            }
        let mut guard = self.lock_host(host_id).await?;
        validate_event_type(&guard, &event_type)?;
        let id = event_type.id;
        let replacing = guard.event_types.contains_key(&id);
        if !replacing && guard.event_types.len() >= MAX_EVENT_TYPES_PER_HOST {
            return Err(EngineError::LimitExceeded("too many event types"));
        }
        // Re-checked under the lock: the id must be new everywhere, or already
        // one of this host's event types.
        let fresh = match self.store.claim_entity(id, host_id) {
            Ok(fresh) if fresh || replacing => fresh,
            _ => return Err(EngineError::AlreadyExists(id)),
        };
        let event = Event::EventTypeSaved {
            host_id,
            event_type,
        };
        self.persist_and_apply(host_id, &mut guard, &event)
            .await
            .inspect_err(|_| {
                if fresh {
                    self.store.release_entity(&id);
                }
            })
    }

    pub async fn set_event_type_active(&self, id: Ulid, active: bool) -> Result<(), EngineError> {
        let (host_id, mut guard) = self.resolve_entity_write(&id).await?;
        let mut event_type = guard
            .event_types
            .get(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        if event_type.active == active {
            return Ok(());
        }
        event_type.active = active;
        let event = Event::EventTypeSaved {
            host_id,
            event_type,
        };
        self.persist_and_apply(host_id, &mut guard, &event).await
    }

    // ── Single-use links ─────────────────────────────────────

    /// Issue a new pending link for one event type.
    pub async fn create_link(
        &self,
        event_type_id: Ulid,
        contact_name: Option<String>,
        contact_email: Option<String>,
        expires_at: Option<Ms>,
    ) -> Result<SingleUseLink, EngineError> {
        if contact_name.as_ref().is_some_and(|n| n.len() > MAX_NAME_LEN)
            || contact_email.as_ref().is_some_and(|e| e.len() > MAX_EMAIL_LEN)
        {
            return Err(EngineError::LimitExceeded("contact too long"));
        }
        let (host_id, mut guard) = self.resolve_entity_write(&event_type_id).await?;
        if !guard.event_types.contains_key(&event_type_id) {
            return Err(EngineError::NotFound(event_type_id));
        }
        let now = now_ms();
        // Only links that can still be redeemed count against the limit.
        if guard.links.len() >= MAX_LINKS_PER_HOST
            && guard.pending_link_count(now) >= MAX_LINKS_PER_HOST
        {
            return Err(EngineError::LimitExceeded("too many links"));
        }
        if expires_at.is_some_and(|at| at <= now) {
            return Err(EngineError::validation("expiry must be in the future"));
        }

        let link = SingleUseLink {
            token: new_token(),
            host_id,
            event_type_id,
            contact_name,
            contact_email,
            consumed_by: None,
            expires_at,
            created_at: now,
        };
        let event = Event::LinkCreated {
            host_id,
            link: link.clone(),
        };
        self.persist_and_apply(host_id, &mut guard, &event).await?;
        Ok(link)
    }

    /// Links are consumed by the admission that uses them. Calling this
    /// afterwards changes nothing and reports where the link stands.
    pub async fn mark_link_used(&self, token: &str) -> Result<LinkState, EngineError> {
        let (_, state) = self.link_state(token).await?;
        Ok(state)
    }

    // ── Booking lifecycle ────────────────────────────────────

    async fn transition_booking(
        &self,
        id: Ulid,
        next: BookingStatus,
    ) -> Result<Booking, EngineError> {
        let (host_id, mut guard) = self.resolve_entity_write(&id).await?;
        let booking = guard.booking(id).cloned().ok_or(EngineError::NotFound(id))?;
        if !booking.status.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                id,
                from: status_name(booking.status),
                to: status_name(next),
            });
        }
        let event = Event::BookingStatusChanged {
            host_id,
            id,
            status: next,
        };
        self.persist_and_apply(host_id, &mut guard, &event).await?;
        Ok(Booking {
            status: next,
            ..booking
        })
    }

    /// Cancelling frees the slot and its daily-cap count. A consumed link
    /// stays consumed.
    pub async fn cancel_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let booking = self.transition_booking(id, BookingStatus::Cancelled).await?;
        info!(booking = %id, "booking cancelled");
        self.dispatch_cancelled(booking.clone());
        Ok(booking)
    }

    pub async fn confirm_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.transition_booking(id, BookingStatus::Confirmed).await
    }

    pub async fn complete_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let booking = self.transition_booking(id, BookingStatus::Completed).await?;
        metrics::counter!(observability::BOOKINGS_COMPLETED_TOTAL).increment(1);
        Ok(booking)
    }

    /// Confirmed bookings that ended at or before `now`.
    /// Uses try_read and skips contended hosts.
    pub fn collect_completable(&self, now: Ms) -> Vec<Ulid> {
        let mut done = Vec::new();
        for host_id in self.store.host_ids() {
            let Some(rs) = self.store.get_host(&host_id) else {
                continue;
            };
            let Ok(guard) = rs.try_read() else {
                continue;
            };
            // Sorted by start; anything starting after `now` cannot have ended.
            let upto = guard.bookings.partition_point(|b| b.span.start < now);
            done.extend(
                guard.bookings[..upto]
                    .iter()
                    .filter(|b| b.status == BookingStatus::Confirmed && b.span.end <= now)
                    .map(|b| b.id),
            );
        }
        done
    }

    /// Drop cancelled and completed bookings that ended before `before`,
    /// along with expired links and links whose booking is gone. Contended
    /// hosts are skipped until the next pass. Returns how many records went.
    pub async fn purge_history(&self, before: Ms) -> Result<usize, EngineError> {
        let mut purged = 0;
        for host_id in self.store.host_ids() {
            let Some(rs) = self.store.get_host(&host_id) else {
                continue;
            };
            if rs.try_read().is_ok_and(|hs| hs.purgeable(before) == 0) {
                continue;
            }
            let mut guard = match self.lock_host(host_id).await {
                Ok(guard) => guard,
                Err(EngineError::LockTimeout(_)) => {
                    warn!(host = %host_id, "history purge skipped a busy host");
                    continue;
                }
                Err(EngineError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            let n = guard.purgeable(before);
            if n == 0 {
                continue;
            }
            let event = Event::HistoryPurged { host_id, before };
            self.persist_and_apply(host_id, &mut guard, &event).await?;
            purged += n;
        }
        if purged > 0 {
            metrics::counter!(observability::HISTORY_PURGED_TOTAL).increment(purged as u64);
        }
        Ok(purged)
    }

    // ── Journal compaction ───────────────────────────────────

    /// Rewrite the journal as the minimal event sequence for current state.
    /// Read locks on every host are held until the rewrite lands, so no
    /// mutation can slip between snapshot and swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut host_ids = self.store.host_ids();
        host_ids.sort();

        let mut guards: Vec<OwnedRwLockReadGuard<HostState>> = Vec::with_capacity(host_ids.len());
        for id in &host_ids {
            if let Some(rs) = self.store.get_host(id) {
                let guard = rs.clone().read_owned().await;
                // A reservation undone while we waited.
                if self.store.is_current(id, &rs) {
                    guards.push(guard);
                }
            }
        }

        let mut events = Vec::new();
        for hs in &guards {
            emit_host(hs, &mut events);
        }
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::Storage("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("journal writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        drop(guards);
        info!(events = count, "journal compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// Events that rebuild `hs` exactly when replayed in order.
fn emit_host(hs: &HostState, events: &mut Vec<Event>) {
    let host_id = hs.id;
    events.push(Event::HostCreated {
        id: host_id,
        name: hs.name.clone(),
    });
    for schedule in hs.schedules.values() {
        events.push(Event::ScheduleCreated {
            host_id,
            schedule: schedule.clone(),
        });
    }
    if let Some(schedule_id) = hs.default_schedule {
        events.push(Event::DefaultScheduleSet {
            host_id,
            schedule_id,
        });
    }
    for event_type in hs.event_types.values() {
        events.push(Event::EventTypeSaved {
            host_id,
            event_type: event_type.clone(),
        });
    }
    for link in hs.links.values() {
        events.push(Event::LinkCreated {
            host_id,
            link: link.clone(),
        });
    }
    for booking in &hs.bookings {
        events.push(Event::BookingAdmitted {
            host_id,
            booking: booking.clone(),
        });
    }
}
