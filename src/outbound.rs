//! Collaborators the engine calls out to: conferencing-link creation and
//! booking notifications. Both are best-effort from the engine's side.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;
use ulid::Ulid;

use crate::model::{Booking, Ms, Span};

#[derive(Debug, Error)]
pub enum OutboundError {
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
    #[error("collaborator rejected request: {0}")]
    Rejected(String),
}

/// What the conferencing provider needs to open a meeting room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeetingRequest {
    pub topic: String,
    pub start: Ms,
    pub duration_min: u32,
    pub host_id: Ulid,
}

#[async_trait]
pub trait Conferencer: Send + Sync {
    /// Returns a join URL.
    async fn create_meeting(&self, request: &MeetingRequest) -> Result<String, OutboundError>;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn booking_confirmed(&self, booking: &Booking) -> Result<(), OutboundError>;

    async fn booking_cancelled(&self, _booking: &Booking) -> Result<(), OutboundError> {
        Ok(())
    }

    /// `booking` already carries its new span and location.
    async fn booking_rescheduled(
        &self,
        _booking: &Booking,
        _previous: &Span,
    ) -> Result<(), OutboundError> {
        Ok(())
    }
}

/// No provider configured: every request fails, so video bookings use the
/// placeholder location.
pub struct NoConferencing;

#[async_trait]
impl Conferencer for NoConferencing {
    async fn create_meeting(&self, _request: &MeetingRequest) -> Result<String, OutboundError> {
        Err(OutboundError::Unavailable("no conferencing provider configured".into()))
    }
}

/// Logs instead of delivering.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn booking_confirmed(&self, booking: &Booking) -> Result<(), OutboundError> {
        info!(
            booking = %booking.id,
            host = %booking.host_id,
            invitee = %booking.invitee.email,
            "booking confirmed"
        );
        Ok(())
    }

    async fn booking_cancelled(&self, booking: &Booking) -> Result<(), OutboundError> {
        info!(booking = %booking.id, host = %booking.host_id, "booking cancelled");
        Ok(())
    }

    async fn booking_rescheduled(
        &self,
        booking: &Booking,
        previous: &Span,
    ) -> Result<(), OutboundError> {
        info!(
            booking = %booking.id,
            host = %booking.host_id,
            from = previous.start,
            to = booking.span.start,
            "booking rescheduled"
        );
        Ok(())
    }
}

#[derive(Clone)]
pub struct Collaborators {
    pub conferencer: Arc<dyn Conferencer>,
    pub notifier: Arc<dyn Notifier>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            conferencer: Arc::new(NoConferencing),
            notifier: Arc::new(LogNotifier),
        }
    }
}
