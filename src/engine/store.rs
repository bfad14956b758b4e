use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;

pub type SharedHostState = Arc<RwLock<HostState>>;

/// In-memory authoritative state: one lock per host, plus reverse indexes
/// so an entity id or link token finds its host without scanning.
pub struct HostStore {
    hosts: DashMap<Ulid, SharedHostState>,
    /// Schedule / event type / booking id → host id.
    entity_to_host: DashMap<Ulid, Ulid>,
    token_to_host: DashMap<String, Ulid>,
}

impl Default for HostStore {
    fn default() -> Self {
        Self::new()
    }
}

impl HostStore {
    pub fn new() -> Self {
        Self {
            hosts: DashMap::new(),
            entity_to_host: DashMap::new(),
            token_to_host: DashMap::new(),
        }
    }

    // ── Host map ─────────────────────────────────────────────

    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }

    pub fn get_host(&self, id: &Ulid) -> Option<SharedHostState> {
        self.hosts.get(id).map(|e| e.value().clone())
    }

    /// Insert a new host and hand back its write guard, or `None` if the id
    /// is taken. Other writers queue on the guard until the creation is
    /// journaled.
    pub fn reserve_host(&self, state: HostState) -> Option<OwnedRwLockWriteGuard<HostState>> {
        match self.hosts.entry(state.id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let shared = Arc::new(RwLock::new(state));
                // Nobody else can see this lock yet.
                let guard = shared.clone().try_write_owned().ok()?;
                slot.insert(shared);
                Some(guard)
            }
        }
    }

    /// Undo a reservation whose creation never reached the journal.
    pub fn remove_host(&self, id: &Ulid) {
        self.hosts.remove(id);
    }

    /// Whether `shared` is still the lock registered for `id`. A lock
    /// acquired just as its reservation was undone is stale.
    pub fn is_current(&self, id: &Ulid, shared: &SharedHostState) -> bool {
        self.hosts
            .get(id)
            .is_some_and(|e| Arc::ptr_eq(e.value(), shared))
    }

    pub fn host_ids(&self) -> Vec<Ulid> {
        self.hosts.iter().map(|e| *e.key()).collect()
    }

    // ── Indexes ──────────────────────────────────────────────

    pub fn host_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_host.get(entity_id).map(|e| *e.value())
    }

    pub fn host_for_token(&self, token: &str) -> Option<Ulid> {
        self.token_to_host.get(token).map(|e| *e.value())
    }

    /// Claim `entity_id` for `host_id`. `Ok(true)` for a fresh claim,
    /// `Ok(false)` when the host already owns it, `Err(owner)` otherwise.
    pub fn claim_entity(&self, entity_id: Ulid, host_id: Ulid) -> Result<bool, Ulid> {
        match self.entity_to_host.entry(entity_id) {
            Entry::Occupied(e) if *e.get() == host_id => Ok(false),
            Entry::Occupied(e) => Err(*e.get()),
            Entry::Vacant(slot) => {
                slot.insert(host_id);
                Ok(true)
            }
        }
    }

    /// Drop a claim whose event never committed.
    pub fn release_entity(&self, entity_id: &Ulid) {
        self.entity_to_host.remove(entity_id);
    }

    fn map_entity(&self, entity_id: Ulid, host_id: Ulid) {
        self.entity_to_host.insert(entity_id, host_id);
    }

    fn unmap_entity(&self, entity_id: &Ulid) {
        self.entity_to_host.remove(entity_id);
    }

    // ── Event application ────────────────────────────────────

    /// Apply an event to a host's state (caller holds the lock).
    pub fn apply_event(&self, hs: &mut HostState, event: &Event) {
        match event {
            Event::ScheduleCreated { host_id, schedule } => {
                if hs.default_schedule.is_none() {
                    hs.default_schedule = Some(schedule.id);
                }
                hs.schedules.insert(schedule.id, schedule.clone());
                self.map_entity(schedule.id, *host_id);
            }
            Event::ScheduleDeleted { id, .. } => {
                hs.schedules.remove(id);
                if hs.default_schedule == Some(*id) {
                    hs.default_schedule = None;
                }
                self.unmap_entity(id);
            }
            Event::DefaultScheduleSet { schedule_id, .. } => {
                hs.default_schedule = Some(*schedule_id);
            }
            Event::RuleAdded {
                schedule_id, rule, ..
            } => {
                if let Some(s) = hs.schedules.get_mut(schedule_id) {
                    s.rules.push(rule.clone());
                }
            }
            Event::RuleRemoved {
                schedule_id,
                rule_id,
                ..
            } => {
                if let Some(s) = hs.schedules.get_mut(schedule_id) {
                    s.rules.retain(|r| r.id != *rule_id);
                }
            }
            Event::OverrideSet {
                schedule_id,
                date_override,
                ..
            } => {
                if let Some(s) = hs.schedules.get_mut(schedule_id) {
                    s.overrides.insert(date_override.date, date_override.clone());
                }
            }
            Event::OverrideRemoved {
                schedule_id, date, ..
            } => {
                if let Some(s) = hs.schedules.get_mut(schedule_id) {
                    s.overrides.remove(date);
                }
            }
            Event::EventTypeSaved {
                host_id,
                event_type,
            } => {
                hs.event_types.insert(event_type.id, event_type.clone());
                self.map_entity(event_type.id, *host_id);
            }
            Event::LinkCreated { host_id, link } => {
                hs.links.insert(link.token.clone(), link.clone());
                self.token_to_host.insert(link.token.clone(), *host_id);
            }
            Event::BookingAdmitted { host_id, booking } => {
                if let Some(token) = &booking.single_use_token
                    && let Some(link) = hs.links.get_mut(token) {
                        link.consumed_by = Some(booking.id);
                    }
                hs.insert_booking(booking.clone());
                self.map_entity(booking.id, *host_id);
            }
            Event::BookingStatusChanged { id, status, .. } => {
                if let Some(b) = hs.booking_mut(*id) {
                    b.status = *status;
                }
            }
            Event::BookingRescheduled {
                id, span, location, ..
            } => {
                // Re-insert to keep the start ordering.
                if let Some(mut b) = hs.remove_booking(*id) {
                    b.span = *span;
                    if let Some(location) = location {
                        b.location = location.clone();
                    }
                    hs.insert_booking(b);
                }
            }
            Event::HistoryPurged { before, .. } => {
                let (ids, tokens) = hs.purge_history(*before);
                for id in &ids {
                    self.unmap_entity(id);
                }
                for token in &tokens {
                    self.token_to_host.remove(token);
                }
            }
            // Handled at the host-map level, not here
            Event::HostCreated { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::Tz;

    fn admitted(host_id: Ulid, start: Ms, token: Option<String>) -> Booking {
        Booking {
            id: Ulid::new(),
            event_type_id: Ulid::new(),
            host_id,
            span: Span::new(start, start + 30 * MINUTE_MS),
            status: BookingStatus::Confirmed,
            invitee: Invitee::new("Lin", "lin@example.com"),
            location: String::new(),
            single_use_token: token,
            created_at: 0,
        }
    }

    #[test]
    fn first_schedule_becomes_default() {
        let store = HostStore::new();
        let host_id = Ulid::new();
        let mut hs = HostState::new(host_id, None);
        let first = Schedule::new(Ulid::new(), host_id, "A", Tz::UTC);
        let second = Schedule::new(Ulid::new(), host_id, "B", Tz::UTC);
        let first_id = first.id;
        store.apply_event(&mut hs, &Event::ScheduleCreated { host_id, schedule: first });
        store.apply_event(&mut hs, &Event::ScheduleCreated { host_id, schedule: second });
        assert_eq!(hs.default_schedule, Some(first_id));
        assert_eq!(store.host_for_entity(&first_id), Some(host_id));
    }

    #[test]
    fn admission_consumes_link_in_same_event() {
        let store = HostStore::new();
        let host_id = Ulid::new();
        let mut hs = HostState::new(host_id, None);
        let link = SingleUseLink {
            token: "tok".into(),
            host_id,
            event_type_id: Ulid::new(),
            contact_name: None,
            contact_email: None,
            consumed_by: None,
            expires_at: None,
            created_at: 0,
        };
        store.apply_event(&mut hs, &Event::LinkCreated { host_id, link });
        assert_eq!(store.host_for_token("tok"), Some(host_id));

        let booking = admitted(host_id, 1_000_000, Some("tok".into()));
        let booking_id = booking.id;
        store.apply_event(&mut hs, &Event::BookingAdmitted { host_id, booking });
        assert_eq!(hs.links["tok"].consumed_by, Some(booking_id));
        assert_eq!(hs.bookings.len(), 1);
        assert_eq!(store.host_for_entity(&booking_id), Some(host_id));
    }

    #[test]
    fn reschedule_keeps_ordering() {
        let store = HostStore::new();
        let host_id = Ulid::new();
        let mut hs = HostState::new(host_id, None);
        let early = admitted(host_id, 1_000_000, None);
        let late = admitted(host_id, 9_000_000, None);
        let early_id = early.id;
        store.apply_event(&mut hs, &Event::BookingAdmitted { host_id, booking: early });
        store.apply_event(&mut hs, &Event::BookingAdmitted { host_id, booking: late });

        let span = Span::new(20_000_000, 21_000_000);
        store.apply_event(
            &mut hs,
            &Event::BookingRescheduled {
                host_id,
                id: early_id,
                span,
                location: Some("https://meet.example/moved".into()),
            },
        );
        assert_eq!(hs.bookings[1].id, early_id);
        assert_eq!(hs.bookings[1].span, span);
        assert_eq!(hs.bookings[1].location, "https://meet.example/moved");
    }

    #[test]
    fn purge_drops_index_entries() {
        let store = HostStore::new();
        let host_id = Ulid::new();
        let mut hs = HostState::new(host_id, None);
        let link = SingleUseLink {
            token: "old".into(),
            host_id,
            event_type_id: Ulid::new(),
            contact_name: None,
            contact_email: None,
            consumed_by: None,
            expires_at: Some(500),
            created_at: 0,
        };
        store.apply_event(&mut hs, &Event::LinkCreated { host_id, link });
        let booking = admitted(host_id, 1_000, None);
        let booking_id = booking.id;
        store.apply_event(&mut hs, &Event::BookingAdmitted { host_id, booking });
        store.apply_event(
            &mut hs,
            &Event::BookingStatusChanged { host_id, id: booking_id, status: BookingStatus::Cancelled },
        );

        store.apply_event(&mut hs, &Event::HistoryPurged { host_id, before: Ms::MAX });
        assert!(hs.bookings.is_empty() && hs.links.is_empty());
        assert_eq!(store.host_for_entity(&booking_id), None);
        assert_eq!(store.host_for_token("old"), None);
    }

    #[test]
    fn reserved_host_ids_are_exclusive() {
        let store = HostStore::new();
        let id = Ulid::new();
        let guard = store.reserve_host(HostState::new(id, None)).unwrap();
        assert!(store.reserve_host(HostState::new(id, Some("Again".into()))).is_none());
        let shared = store.get_host(&id).unwrap();
        assert!(store.is_current(&id, &shared));

        drop(guard);
        store.remove_host(&id);
        assert!(!store.is_current(&id, &shared));
        assert!(store.reserve_host(HostState::new(id, None)).is_some());
    }

    #[test]
    fn entity_claims() {
        let store = HostStore::new();
        let (alice, bob, entity) = (Ulid::new(), Ulid::new(), Ulid::new());
        assert_eq!(store.claim_entity(entity, alice), Ok(true));
        assert_eq!(store.claim_entity(entity, alice), Ok(false));
        assert_eq!(store.claim_entity(entity, bob), Err(alice));
        store.release_entity(&entity);
        assert_eq!(store.claim_entity(entity, bob), Ok(true));
    }

    #[test]
    fn deleting_default_clears_it() {
        let store = HostStore::new();
        let host_id = Ulid::new();
        let mut hs = HostState::new(host_id, None);
        let s = Schedule::new(Ulid::new(), host_id, "A", Tz::UTC);
        let id = s.id;
        store.apply_event(&mut hs, &Event::ScheduleCreated { host_id, schedule: s });
        store.apply_event(&mut hs, &Event::ScheduleDeleted { host_id, id });
        assert!(hs.schedules.is_empty());
        assert_eq!(hs.default_schedule, None);
        assert_eq!(store.host_for_entity(&id), None);
    }
}
