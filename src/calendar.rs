use async_trait::async_trait;
use chrono::NaiveDate;

use crate::engine::EngineError;
use crate::model::{Booking, Span};

/// An external calendar whose free/busy state gates availability and which
/// mirrors confirmed bookings. Every call is bounded by the caller and any
/// failure degrades to local-only behavior.
#[async_trait]
pub trait CalendarGateway: Send + Sync {
    /// Busy intervals within `window` on `date`. Order and overlap are unconstrained.
    async fn query_busy(&self, date: NaiveDate, window: Span) -> Result<Vec<Span>, EngineError>;

    /// Create an event for the booking and return its external id.
    async fn create_event(&self, booking: &Booking) -> Result<String, EngineError>;

    async fn delete_event(&self, external_event_id: &str) -> Result<(), EngineError>;
}
