use thiserror::Error;
use ulid::Ulid;

#[derive(Debug, Error)]
pub enum EngineError {
    // ── Admission taxonomy ───────────────────────────────────
    #[error("this slot was just taken (conflicts with booking {0})")]
    SlotTaken(Ulid),
    #[error("the requested time is not an offered slot")]
    SlotUnavailable,
    #[error("no more bookings can be made on this day (limit {0})")]
    DailyCapReached(u32),
    #[error("this booking link is not valid")]
    LinkInvalid,
    #[error("this booking link has already been used")]
    LinkConsumed,
    #[error("this booking link has expired")]
    LinkExpired,
    #[error("this booking link is for a different event")]
    LinkMismatch,
    #[error("event type {0} is not accepting bookings")]
    EventTypeInactive(Ulid),
    #[error("invalid request: {0}")]
    Validation(String),

    // ── Management ───────────────────────────────────────────
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("schedule {0} is still in use")]
    ScheduleInUse(Ulid),
    #[error("booking {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: Ulid,
        from: &'static str,
        to: &'static str,
    },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),

    // ── Infrastructure ───────────────────────────────────────
    #[error("host {0} is busy, try again")]
    LockTimeout(Ulid),
    #[error("storage error: {0}")]
    Storage(String),
}

impl EngineError {
    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }

    /// "Try again later": the request itself was fine.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::LockTimeout(_) | EngineError::Storage(_))
    }

    /// "Try a different slot": lost to another booking.
    pub fn is_contention(&self) -> bool {
        matches!(
            self,
            EngineError::SlotTaken(_) | EngineError::DailyCapReached(_)
        )
    }

    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            EngineError::SlotTaken(_) => "slot_taken",
            EngineError::SlotUnavailable => "slot_unavailable",
            EngineError::DailyCapReached(_) => "daily_cap_reached",
            EngineError::LinkInvalid => "link_invalid",
            EngineError::LinkConsumed => "link_consumed",
            EngineError::LinkExpired => "link_expired",
            EngineError::LinkMismatch => "link_mismatch",
            EngineError::EventTypeInactive(_) => "event_type_inactive",
            EngineError::Validation(_) => "validation",
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::ScheduleInUse(_) => "schedule_in_use",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::LockTimeout(_) => "lock_timeout",
            EngineError::Storage(_) => "storage",
        }
    }
}
