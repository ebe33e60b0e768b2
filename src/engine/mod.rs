mod availability;
mod catalog;
mod conflict;
mod error;
mod mutations;
mod queries;
mod tokens;

pub use availability::{merge_overlapping, query_window, resolve_slots, subtract, subtract_intervals, union};
pub use catalog::DEFAULT_WINDOWS;
pub use error::{ConflictReason, EngineError, Entity};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedMutexGuard, OwnedRwLockReadGuard, RwLock};
use tracing::{info, warn};
use ulid::Ulid;

use crate::config::Config;
use crate::model::*;
use crate::observability;
use crate::wal::Wal;

pub type SharedDayState = Arc<RwLock<DayState>>;
pub type SharedLedger = Arc<Mutex<MoveLedger>>;
pub type SharedToken = Arc<Mutex<Token>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Drain every Append already queued behind it.
/// 3. One flush_sync for the whole batch, then answer every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                commit_batch(&mut wal, batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, &batch);
    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        warn!("WAL flush of {} events failed: {e}", batch.len());
    }
    for (_, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after a failed append so the buffer starts empty next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => commit_batch(wal, vec![(event, response)]),
    }
}

/// Write event to WAL via the background group-commit writer.
async fn wal_append(wal_tx: &mpsc::Sender<WalCommand>, event: &Event) -> Result<(), EngineError> {
    let (tx, rx) = oneshot::channel();
    wal_tx
        .send(WalCommand::Append {
            event: event.clone(),
            response: tx,
        })
        .await
        .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
    rx.await
        .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
        .map_err(|e| EngineError::WalError(e.to_string()))
}

// ── Engine ───────────────────────────────────────────────

/// Commit gate and catalog writer, shared by every slot write of one catalog call.
pub(super) type CatalogHold = Arc<(OwnedRwLockReadGuard<()>, OwnedMutexGuard<()>)>;

/// The maps an applied event writes through. Cheap to clone into a commit task.
#[derive(Clone)]
pub(super) struct Tables {
    slots: Arc<DashMap<Ulid, SlotDefinition>>,
    bookings: Arc<DashMap<Ulid, Booking>>,
    confirmation_codes: Arc<DashMap<String, Ulid>>,
}

/// In-memory reservation state rebuilt from the WAL.
///
/// Per-key locks: a [`MoveLedger`] per move and a [`DayState`] per date.
/// Booking writes take the move lock first, then the day lock, and hold both
/// across the durable write. Every mutation also holds `commit_gate` for
/// reading so compaction can take a consistent snapshot.
pub struct Engine {
    pub(super) slots: Arc<DashMap<Ulid, SlotDefinition>>,
    pub(super) bookings: Arc<DashMap<Ulid, Booking>>,
    pub(super) days: DashMap<NaiveDate, SharedDayState>,
    pub(super) moves: DashMap<MoveId, SharedLedger>,
    pub(super) confirmation_codes: Arc<DashMap<String, Ulid>>,
    pub(super) tokens: Arc<DashMap<String, SharedToken>>,
    /// Serializes catalog writers so log order matches apply order.
    pub(super) catalog_writer: Arc<Mutex<()>>,
    pub(super) commit_gate: Arc<RwLock<()>>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    config: Arc<Config>,
}

impl Engine {
    pub fn new(wal_path: PathBuf, config: Arc<Config>) -> io::Result<Self> {
        let replay = Wal::replay(&wal_path)?;
        if replay.discarded_tail {
            warn!(
                "discarded torn or corrupt tail of {} after {} events",
                wal_path.display(),
                replay.events.len()
            );
        }
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            slots: Arc::new(DashMap::new()),
            bookings: Arc::new(DashMap::new()),
            days: DashMap::new(),
            moves: DashMap::new(),
            confirmation_codes: Arc::new(DashMap::new()),
            tokens: Arc::new(DashMap::new()),
            catalog_writer: Arc::new(Mutex::new(())),
            commit_gate: Arc::new(RwLock::new(())),
            wal_tx,
            config,
        };

        // Nothing else holds these locks yet, so try_* always succeeds.
        // Never block here: this may run inside an async context.
        for event in &replay.events {
            engine.replay_event(event);
        }
        info!(
            "replayed {} events: {} slots, {} bookings, {} tokens",
            replay.events.len(),
            engine.slots.len(),
            engine.bookings.len(),
            engine.tokens.len()
        );

        Ok(engine)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(super) fn tables(&self) -> Tables {
        Tables {
            slots: self.slots.clone(),
            bookings: self.bookings.clone(),
            confirmation_codes: self.confirmation_codes.clone(),
        }
    }

    fn replay_event(&self, event: &Event) {
        match event {
            Event::SlotDefined { .. } | Event::SlotActivationChanged { .. } => {
                self.tables().apply_catalog(event)
            }
            Event::BookingRecorded { booking } => {
                let ledger = self.shared_ledger(booking.move_id);
                let day = self.shared_day(booking.date);
                let mut ledger = ledger.try_lock().expect("replay: uncontended ledger");
                let mut day = day.try_write().expect("replay: uncontended day");
                if booking.status.is_active() {
                    if let Some(active) = ledger.active.filter(|a| *a != booking.id) {
                        warn!(
                            "replay: skipping booking {}: move {} already holds {active}",
                            booking.id, booking.move_id
                        );
                        return;
                    }
                    if let Some(clash) = day
                        .overlapping(&booking.span)
                        .find(|i| i.booking_id != booking.id)
                    {
                        warn!(
                            "replay: skipping booking {}: overlaps {} on {}",
                            booking.id, clash.booking_id, booking.date
                        );
                        return;
                    }
                }
                self.tables().apply_booking(event, &mut day, &mut ledger);
            }
            Event::BookingStatusChanged { id, .. } | Event::CalendarEventLinked { id, .. } => {
                let Some((move_id, date)) = self.bookings.get(id).map(|b| (b.move_id, b.date))
                else {
                    warn!("replay: {event:?} refers to unknown booking");
                    return;
                };
                let ledger = self.shared_ledger(move_id);
                let day = self.shared_day(date);
                let mut ledger = ledger.try_lock().expect("replay: uncontended ledger");
                let mut day = day.try_write().expect("replay: uncontended day");
                self.tables().apply_booking(event, &mut day, &mut ledger);
            }
            Event::TokenIssued { token } => {
                self.tokens
                    .insert(token.value.clone(), Arc::new(Mutex::new(token.clone())));
            }
            Event::TokenRedeemed { value, .. } => {
                if let Some(token) = self.tokens.get(value) {
                    token.try_lock().expect("replay: uncontended token").used = true;
                }
            }
        }
    }

    /// WAL-append, then apply, on a task that owns `held`.
    ///
    /// `held` carries the guards `apply` mutates through and is released once
    /// `apply` returns or the write fails. After the spawn the commit runs to
    /// the end even if the caller's future is dropped, so the log and memory
    /// never disagree.
    pub(super) async fn persist_and_apply<H, T>(
        &self,
        event: Event,
        mut held: H,
        apply: impl FnOnce(&Event, &mut H) -> T + Send + 'static,
    ) -> Result<T, EngineError>
    where
        H: Send + 'static,
        T: Send + 'static,
    {
        let wal_tx = self.wal_tx.clone();
        let commit = tokio::spawn(async move {
            wal_append(&wal_tx, &event).await?;
            let applied = apply(&event, &mut held);
            drop(held);
            Ok(applied)
        });
        commit
            .await
            .map_err(|e| EngineError::WalError(format!("commit task failed: {e}")))?
    }

    pub(super) async fn catalog_hold(&self) -> CatalogHold {
        let commit = self.commit_gate.clone().read_owned().await;
        let writer = self.catalog_writer.clone().lock_owned().await;
        Arc::new((commit, writer))
    }

    pub(super) fn shared_day(&self, date: NaiveDate) -> SharedDayState {
        self.days
            .entry(date)
            .or_insert_with(|| Arc::new(RwLock::new(DayState::new(date))))
            .clone()
    }

    pub(super) fn shared_ledger(&self, move_id: MoveId) -> SharedLedger {
        self.moves.entry(move_id).or_default().clone()
    }
}

impl Tables {
    pub(super) fn apply_catalog(&self, event: &Event) {
        match event {
            Event::SlotDefined { slot } => {
                self.slots.insert(slot.id, slot.clone());
            }
            Event::SlotActivationChanged { id, active } => {
                if let Some(mut slot) = self.slots.get_mut(id) {
                    slot.active = *active;
                }
            }
            _ => {}
        }
    }

    /// Apply a booking event. The caller holds the move's ledger and the
    /// booking date's day state.
    pub(super) fn apply_booking(&self, event: &Event, day: &mut DayState, ledger: &mut MoveLedger) {
        match event {
            Event::BookingRecorded { booking } => {
                if booking.status.is_active() {
                    day.insert_interval(BusyInterval {
                        booking_id: booking.id,
                        slot_id: booking.slot_id,
                        span: booking.span,
                    });
                    ledger.active = Some(booking.id);
                }
                if !ledger.bookings.contains(&booking.id) {
                    ledger.bookings.push(booking.id);
                }
                self.confirmation_codes
                    .insert(booking.confirmation_code.clone(), booking.id);
                self.bookings.insert(booking.id, booking.clone());
            }
            Event::BookingStatusChanged { id, status, at } => {
                if let Some(mut booking) = self.bookings.get_mut(id) {
                    booking.status = *status;
                    booking.updated_at = *at;
                }
                if !status.is_active() {
                    day.remove_interval(*id);
                    if ledger.active == Some(*id) {
                        ledger.active = None;
                    }
                }
            }
            Event::CalendarEventLinked {
                id,
                external_event_id,
            } => {
                if let Some(mut booking) = self.bookings.get_mut(id) {
                    booking.external_event_id = Some(external_event_id.clone());
                }
            }
            _ => {}
        }
    }
}
