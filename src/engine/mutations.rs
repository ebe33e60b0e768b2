use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rand::Rng;
use serde_json::json;
use tokio::sync::oneshot;
use tracing::{debug, info};
use ulid::Ulid;

use crate::effects::{Committed, Effect};
use crate::moves::MoveInfo;
use crate::model::*;
use crate::notify::TemplateKind;
use crate::observability;

use super::conflict::{check_no_conflict, now_ms, validate_phone};
use super::error::ConflictReason;
use super::{Engine, EngineError, Entity, WalCommand};

const CODE_PREFIX: &str = "BK";
const CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const CODE_LEN: usize = 6;
const CODE_ATTEMPTS: usize = 16;

fn generate_confirmation_code() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..CODE_LEN)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect();
    format!("{CODE_PREFIX}{suffix}")
}

/// A confirmation code held for a booking that is not yet durable.
/// Released on drop unless kept.
struct CodeReservation {
    codes: Arc<DashMap<String, Ulid>>,
    code: String,
    kept: bool,
}

impl CodeReservation {
    fn keep(&mut self) {
        self.kept = true;
    }
}

impl Drop for CodeReservation {
    fn drop(&mut self) {
        if !self.kept {
            self.codes.remove(&self.code);
        }
    }
}

fn conflict(reason: ConflictReason) -> EngineError {
    metrics::counter!(
        observability::BOOKING_CONFLICTS_TOTAL,
        "reason" => observability::conflict_label(&reason)
    )
    .increment(1);
    EngineError::Conflict(reason)
}

impl Engine {
    /// Checks that need no collaborator: the slot is bookable and the phone
    /// number is well formed. Returns the slot.
    pub fn check_request(&self, req: &BookingRequest) -> Result<SlotDefinition, EngineError> {
        let slot = self.bookable_slot(req.slot_id)?;
        validate_phone(&req.phone_number)?;
        Ok(slot)
    }

    /// Reserve a unique confirmation code for `booking_id`.
    fn reserve_confirmation_code(&self, booking_id: Ulid) -> Result<CodeReservation, EngineError> {
        for _ in 0..CODE_ATTEMPTS {
            let code = generate_confirmation_code();
            if let Entry::Vacant(slot) = self.confirmation_codes.entry(code.clone()) {
                slot.insert(booking_id);
                return Ok(CodeReservation {
                    codes: self.confirmation_codes.clone(),
                    code,
                    kept: false,
                });
            }
        }
        Err(conflict(ConflictReason::Duplicate("confirmation code")))
    }

    /// Validate and durably record a booking for `owner`.
    ///
    /// `mv` is the move as reported by the move service for this caller and
    /// `remote_busy` the external calendar's busy intervals for the date
    /// (empty when unconfigured or unreachable). The move and day locks are
    /// held from the availability check through the WAL write, so two racing
    /// requests for overlapping windows or for the same move cannot both win.
    pub async fn commit_booking(
        &self,
        owner: UserId,
        mv: &MoveInfo,
        req: &BookingRequest,
        remote_busy: &[Span],
    ) -> Result<Committed<Booking>, EngineError> {
        let slot = self.check_request(req)?;
        if mv.id != req.move_id || mv.owner_id != owner {
            return Err(EngineError::PermissionDenied(req.move_id));
        }
        if mv.date != req.date {
            debug!("move {} is on {}, not {}", mv.id, mv.date, req.date);
            return Err(EngineError::NotFound(Entity::Move(req.move_id)));
        }
        let span = slot.span_on(req.date, self.config().utc_offset)?;

        let commit = self.commit_gate.clone().read_owned().await;
        let ledger = self.shared_ledger(req.move_id).lock_owned().await;
        let day = self.shared_day(req.date).write_owned().await;

        // The slot may have been disabled while we waited for the locks.
        let slot = self.bookable_slot(slot.id)?;
        check_no_conflict(&day, slot.id, &span, remote_busy).map_err(|e| match e {
            EngineError::Conflict(reason) => conflict(reason),
            other => other,
        })?;
        if let Some(active) = ledger.active {
            return Err(conflict(ConflictReason::ActiveBookingExists(active)));
        }

        let id = Ulid::new();
        let reservation = self.reserve_confirmation_code(id)?;
        let confirmation_code = reservation.code.clone();
        let now = now_ms();
        let booking = Booking {
            id,
            move_id: req.move_id,
            owner_id: owner,
            slot_id: slot.id,
            date: req.date,
            span,
            phone_number: req.phone_number.clone(),
            status: BookingStatus::Confirmed,
            confirmation_code: confirmation_code.clone(),
            created_at: now,
            updated_at: now,
            external_event_id: None,
        };

        let event = Event::BookingRecorded {
            booking: booking.clone(),
        };
        let tables = self.tables();
        self.persist_and_apply(
            event,
            (commit, ledger, day, reservation),
            move |e, (_, ledger, day, reservation)| {
                tables.apply_booking(e, day, ledger);
                reservation.keep();
            },
        )
        .await?;
        metrics::counter!(observability::BOOKINGS_CREATED_TOTAL).increment(1);
        info!(
            "booking {id} ({confirmation_code}) for move {} on {} {}",
            req.move_id,
            req.date,
            slot.label()
        );

        let payload = json!({
            "booking_id": id.to_string(),
            "move_date": req.date.format("%B %d, %Y").to_string(),
            "time_slot": slot.label(),
            "price": format_price(slot.price_cents),
            "confirmation_number": confirmation_code,
            "phone_number": booking.phone_number,
        });
        Ok(Committed::new(booking.clone())
            .with(Effect::SetMoveStatus {
                move_id: booking.move_id,
                owner_id: owner,
                status: MoveStatus::Scheduled,
                only_from: None,
            })
            .with(Effect::MirrorCreate {
                booking: booking.clone(),
            })
            .with(Effect::Notify {
                user_id: owner,
                kind: TemplateKind::BookingConfirmation,
                payload,
            }))
    }

    /// Cancel one of `principal`'s bookings. Terminal bookings are `InvalidState`.
    pub async fn cancel_booking(
        &self,
        principal: UserId,
        id: Ulid,
    ) -> Result<Committed<Booking>, EngineError> {
        let (move_id, date) = match self.bookings.get(&id) {
            Some(b) if b.owner_id == principal => (b.move_id, b.date),
            _ => return Err(EngineError::NotFound(Entity::Booking(id))),
        };

        let commit = self.commit_gate.clone().read_owned().await;
        let ledger = self.shared_ledger(move_id).lock_owned().await;
        let day = self.shared_day(date).write_owned().await;

        let status = self.booking_status(id)?;
        if !status.can_transition_to(BookingStatus::Cancelled) {
            return Err(EngineError::InvalidState { id, status });
        }

        let event = Event::BookingStatusChanged {
            id,
            status: BookingStatus::Cancelled,
            at: now_ms(),
        };
        let tables = self.tables();
        let move_released = self
            .persist_and_apply(event, (commit, ledger, day), move |e, (_, ledger, day)| {
                tables.apply_booking(e, day, ledger);
                ledger.active.is_none()
            })
            .await?;
        metrics::counter!(observability::BOOKINGS_CANCELLED_TOTAL).increment(1);
        info!("booking {id} cancelled");

        let booking = self
            .bookings
            .get(&id)
            .map(|b| b.clone())
            .ok_or(EngineError::NotFound(Entity::Booking(id)))?;
        let mut committed = Committed::new(booking.clone());
        if move_released {
            committed = committed.with(Effect::SetMoveStatus {
                move_id,
                owner_id: principal,
                status: MoveStatus::Planning,
                only_from: Some(MoveStatus::Scheduled),
            });
        }
        if let Some(external_event_id) = booking.external_event_id {
            committed = committed.with(Effect::MirrorDelete {
                booking_id: id,
                external_event_id,
            });
        }
        Ok(committed)
    }

    /// Externally driven progress: `confirmed -> in_progress -> completed`.
    /// Completion releases the slot and the move's active booking.
    pub async fn advance_booking(
        &self,
        id: Ulid,
        next: BookingStatus,
    ) -> Result<Booking, EngineError> {
        if next == BookingStatus::Cancelled {
            return Err(EngineError::InvalidArgument(
                "cancellation goes through cancel_booking".into(),
            ));
        }
        let (move_id, date) = self
            .bookings
            .get(&id)
            .map(|b| (b.move_id, b.date))
            .ok_or(EngineError::NotFound(Entity::Booking(id)))?;

        let commit = self.commit_gate.clone().read_owned().await;
        let ledger = self.shared_ledger(move_id).lock_owned().await;
        let day = self.shared_day(date).write_owned().await;

        let status = self.booking_status(id)?;
        if !status.can_transition_to(next) {
            return Err(EngineError::InvalidState { id, status });
        }
        let event = Event::BookingStatusChanged {
            id,
            status: next,
            at: now_ms(),
        };
        let tables = self.tables();
        self.persist_and_apply(event, (commit, ledger, day), move |e, (_, ledger, day)| {
            tables.apply_booking(e, day, ledger)
        })
        .await?;
        info!("booking {id}: {status} -> {next}");
        self.bookings
            .get(&id)
            .map(|b| b.clone())
            .ok_or(EngineError::NotFound(Entity::Booking(id)))
    }

    /// Record the external calendar event that mirrors a booking. Returns the
    /// booking as of the link; a caller seeing `Cancelled` should delete the event.
    pub async fn link_calendar_event(
        &self,
        id: Ulid,
        external_event_id: String,
    ) -> Result<Booking, EngineError> {
        let (move_id, date) = self
            .bookings
            .get(&id)
            .map(|b| (b.move_id, b.date))
            .ok_or(EngineError::NotFound(Entity::Booking(id)))?;

        let commit = self.commit_gate.clone().read_owned().await;
        let ledger = self.shared_ledger(move_id).lock_owned().await;
        let day = self.shared_day(date).write_owned().await;

        let event = Event::CalendarEventLinked {
            id,
            external_event_id,
        };
        let tables = self.tables();
        self.persist_and_apply(event, (commit, ledger, day), move |e, (_, ledger, day)| {
            tables.apply_booking(e, day, ledger)
        })
        .await?;
        self.bookings
            .get(&id)
            .map(|b| b.clone())
            .ok_or(EngineError::NotFound(Entity::Booking(id)))
    }

    fn booking_status(&self, id: Ulid) -> Result<BookingStatus, EngineError> {
        self.bookings
            .get(&id)
            .map(|b| b.status)
            .ok_or(EngineError::NotFound(Entity::Booking(id)))
    }

    /// Rewrite the WAL as a snapshot of current state.
    ///
    /// Holds `commit_gate` for writing, so no mutation is between its WAL
    /// write and its apply while the snapshot is taken.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _exclusive = self.commit_gate.write().await;

        let mut events = Vec::new();
        for slot in self.list_slots() {
            events.push(Event::SlotDefined { slot });
        }

        let mut bookings: Vec<Booking> = self.bookings.iter().map(|b| b.clone()).collect();
        bookings.sort_by_key(|b| b.id);
        events.extend(
            bookings
                .into_iter()
                .map(|booking| Event::BookingRecorded { booking }),
        );

        let shared: Vec<_> = self.tokens.iter().map(|t| t.value().clone()).collect();
        let mut tokens = Vec::with_capacity(shared.len());
        for token in shared {
            tokens.push(token.lock().await.clone());
        }
        tokens.sort_by_key(|t| t.id);
        events.extend(tokens.into_iter().map(|token| Event::TokenIssued { token }));

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;

        metrics::counter!(observability::WAL_COMPACTIONS_TOTAL).increment(1);
        info!("compacted WAL to {count} events");
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
