use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;
use crate::observability;

use super::availability::resolve_slots;
use super::{Engine, EngineError, Entity};

impl Engine {
    /// Spans of active bookings on `date`, sorted by start.
    pub async fn local_busy(&self, date: NaiveDate) -> Vec<Span> {
        let Some(day) = self.days.get(&date).map(|d| d.value().clone()) else {
            return Vec::new();
        };
        let guard = day.read().await;
        guard.spans()
    }

    /// Resolve every active slot on `date` against local bookings and the
    /// given remote busy set. Recomputed on every call.
    pub async fn availability(
        &self,
        date: NaiveDate,
        remote: RemoteBusy,
    ) -> Result<Availability, EngineError> {
        let slots = self.list_active_slots();
        let local = self.local_busy(date).await;
        let resolved = resolve_slots(
            &slots,
            date,
            self.config().utc_offset,
            &local,
            &remote.spans,
        )?;
        metrics::counter!(
            observability::AVAILABILITY_QUERIES_TOTAL,
            "remote" => observability::remote_label(remote.status)
        )
        .increment(1);
        Ok(Availability {
            date,
            slots: resolved,
            remote: remote.status,
        })
    }

    /// A booking owned by `principal`. Other principals' bookings are `NotFound`.
    pub fn get_booking(&self, principal: UserId, id: Ulid) -> Result<Booking, EngineError> {
        match self.bookings.get(&id) {
            Some(b) if b.owner_id == principal => Ok(b.clone()),
            _ => Err(EngineError::NotFound(Entity::Booking(id))),
        }
    }

    /// `principal`'s bookings, newest first.
    pub fn list_bookings(&self, principal: UserId) -> Vec<Booking> {
        let mut bookings: Vec<Booking> = self
            .bookings
            .iter()
            .filter(|b| b.owner_id == principal)
            .map(|b| b.clone())
            .collect();
        bookings.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        bookings
    }

    /// Every booking on `date` in any status, ordered by start time.
    pub fn bookings_on(&self, date: NaiveDate) -> Vec<Booking> {
        let mut bookings: Vec<Booking> = self
            .bookings
            .iter()
            .filter(|b| b.date == date)
            .map(|b| b.clone())
            .collect();
        bookings.sort_by_key(|b| (b.span.start, b.created_at, b.id));
        bookings
    }

    /// Bookings recorded for a move, oldest first.
    pub async fn bookings_for_move(&self, move_id: MoveId) -> Vec<Booking> {
        let Some(ledger) = self.moves.get(&move_id).map(|l| l.value().clone()) else {
            return Vec::new();
        };
        let ids = ledger.lock().await.bookings.clone();
        ids.iter()
            .filter_map(|id| self.bookings.get(id).map(|b| b.clone()))
            .collect()
    }
}
