use chrono::{FixedOffset, NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::EngineError;

/// Unix milliseconds, the only instant type.
pub type Ms = i64;

/// Account identity owned by the user service.
pub type UserId = Ulid;

/// Move identity owned by the move service.
pub type MoveId = Ulid;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Checked constructor for spans built from outside input.
    pub fn try_new(start: Ms, end: Ms) -> Result<Self, EngineError> {
        if start >= end {
            return Err(EngineError::InvalidInterval { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// The instant at which wall-clock `time` on `date` occurs in `offset`.
/// `InvalidArgument` when that instant is outside chrono's range.
pub fn local_instant(
    date: NaiveDate,
    time: NaiveTime,
    offset: FixedOffset,
) -> Result<Ms, EngineError> {
    let shift = chrono::Duration::seconds(i64::from(offset.local_minus_utc()));
    date.and_time(time)
        .checked_sub_signed(shift)
        .map(|utc| utc.and_utc().timestamp_millis())
        .ok_or_else(|| EngineError::InvalidArgument(format!("date out of range: {date}")))
}

// ── Slot catalog ─────────────────────────────────────────────────

/// A reusable daily window, e.g. 10:00–12:00.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotDefinition {
    pub id: Ulid,
    pub start_of_day: NaiveTime,
    pub end_of_day: NaiveTime,
    /// Minor currency units.
    pub price_cents: u32,
    pub active: bool,
}

impl SlotDefinition {
    /// Materialize this window on a concrete date.
    pub fn span_on(&self, date: NaiveDate, offset: FixedOffset) -> Result<Span, EngineError> {
        Ok(Span::new(
            local_instant(date, self.start_of_day, offset)?,
            local_instant(date, self.end_of_day, offset)?,
        ))
    }

    /// `HH:MM - HH:MM`
    pub fn label(&self) -> String {
        format!(
            "{} - {}",
            self.start_of_day.format("%H:%M"),
            self.end_of_day.format("%H:%M")
        )
    }
}

/// Parse a decimal price such as `200`, `200.5` or `200.00` into cents.
pub fn parse_price(s: &str) -> Result<u32, EngineError> {
    let invalid = || EngineError::InvalidArgument(format!("invalid price: {s:?}"));
    let (whole, frac) = match s.trim().split_once('.') {
        Some((w, f)) => (w, f),
        None => (s.trim(), ""),
    };
    if whole.is_empty() || frac.len() > 2 || !frac.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    let whole: u32 = whole.parse().map_err(|_| invalid())?;
    let frac: u32 = match frac.len() {
        0 => 0,
        1 => frac.parse::<u32>().map_err(|_| invalid())? * 10,
        _ => frac.parse().map_err(|_| invalid())?,
    };
    whole
        .checked_mul(100)
        .and_then(|c| c.checked_add(frac))
        .ok_or_else(invalid)
}

pub fn format_price(cents: u32) -> String {
    format!("{}.{:02}", cents / 100, cents % 100)
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Confirmed,
    InProgress,
    Completed,
    Cancelled,
}

impl BookingStatus {
    /// Active bookings occupy their slot and count against the move.
    pub fn is_active(self) -> bool {
        matches!(self, BookingStatus::Confirmed | BookingStatus::InProgress)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, BookingStatus::Completed | BookingStatus::Cancelled)
    }

    pub fn can_transition_to(self, next: BookingStatus) -> bool {
        use BookingStatus::*;
        match (self, next) {
            (Confirmed, InProgress) | (InProgress, Completed) => true,
            (Confirmed, Cancelled) | (InProgress, Cancelled) => true,
            (Confirmed, _) | (InProgress, _) => false,
            (Completed, _) | (Cancelled, _) => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::InProgress => "in_progress",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a move, owned by the move service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MoveStatus {
    Planning,
    Scheduled,
    InProgress,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub move_id: MoveId,
    pub owner_id: UserId,
    pub slot_id: Ulid,
    pub date: NaiveDate,
    /// The slot window materialized on `date`.
    pub span: Span,
    pub phone_number: String,
    pub status: BookingStatus,
    pub confirmation_code: String,
    pub created_at: Ms,
    pub updated_at: Ms,
    /// Event id in the external calendar, when the mirror succeeded.
    pub external_event_id: Option<String>,
}

/// What a caller asks to book. The date must match the move's date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub move_id: MoveId,
    pub slot_id: Ulid,
    pub date: NaiveDate,
    pub phone_number: String,
}

// ── Tokens ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TokenPurpose {
    EmailVerification,
    PasswordReset,
}

impl TokenPurpose {
    pub fn as_str(self) -> &'static str {
        match self {
            TokenPurpose::EmailVerification => "email_verification",
            TokenPurpose::PasswordReset => "password_reset",
        }
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub id: Ulid,
    pub owner_id: UserId,
    pub value: String,
    pub purpose: TokenPurpose,
    pub created_at: Ms,
    pub expires_at: Ms,
    /// Monotonic: once set, never cleared.
    pub used: bool,
}

impl Token {
    pub fn is_redeemable(&self, now: Ms) -> bool {
        !self.used && now < self.expires_at
    }
}

// Token values are credentials; keep them out of logs.
impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Token")
            .field("id", &self.id)
            .field("owner_id", &self.owner_id)
            .field("value", &"<redacted>")
            .field("purpose", &self.purpose)
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .field("used", &self.used)
            .finish()
    }
}

// ── Per-key state ────────────────────────────────────────────────

/// An active booking's footprint on its day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusyInterval {
    pub booking_id: Ulid,
    pub slot_id: Ulid,
    pub span: Span,
}

/// Active bookings on one calendar date, sorted by `span.start`.
#[derive(Debug, Clone)]
pub struct DayState {
    pub date: NaiveDate,
    pub intervals: Vec<BusyInterval>,
}

impl DayState {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            intervals: Vec::new(),
        }
    }

    /// Insert interval maintaining sort order by span.start.
    pub fn insert_interval(&mut self, interval: BusyInterval) {
        let pos = self
            .intervals
            .binary_search_by_key(&interval.span.start, |i| i.span.start)
            .unwrap_or_else(|e| e);
        self.intervals.insert(pos, interval);
    }

    pub fn remove_interval(&mut self, booking_id: Ulid) -> Option<BusyInterval> {
        let pos = self
            .intervals
            .iter()
            .position(|i| i.booking_id == booking_id)?;
        Some(self.intervals.remove(pos))
    }

    /// Intervals whose span overlaps the query window.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &BusyInterval> {
        // Everything at index >= right_bound starts at or after query.end.
        let right_bound = self
            .intervals
            .partition_point(|i| i.span.start < query.end);
        self.intervals[..right_bound]
            .iter()
            .filter(move |i| i.span.end > query.start)
    }

    pub fn spans(&self) -> Vec<Span> {
        self.intervals.iter().map(|i| i.span).collect()
    }
}

/// Bookings that belong to one move. At most one of them is active.
#[derive(Debug, Clone, Default)]
pub struct MoveLedger {
    pub active: Option<Ulid>,
    pub bookings: Vec<Ulid>,
}

// ── Log records ──────────────────────────────────────────────────

/// Flat WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    SlotDefined {
        slot: SlotDefinition,
    },
    SlotActivationChanged {
        id: Ulid,
        active: bool,
    },
    /// A booking as of this record; compaction re-emits it with its current status.
    BookingRecorded {
        booking: Booking,
    },
    BookingStatusChanged {
        id: Ulid,
        status: BookingStatus,
        at: Ms,
    },
    CalendarEventLinked {
        id: Ulid,
        external_event_id: String,
    },
    TokenIssued {
        token: Token,
    },
    TokenRedeemed {
        value: String,
        at: Ms,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotAvailability {
    pub slot: SlotDefinition,
    pub span: Span,
    pub available: bool,
}

/// Whether the external calendar contributed to an availability answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RemoteStatus {
    /// No calendar gateway configured; local bookings are the whole truth.
    NotConfigured,
    Confirmed,
    /// The gateway failed or timed out; the answer reflects local bookings only.
    Unconfirmed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Availability {
    pub date: NaiveDate,
    pub slots: Vec<SlotAvailability>,
    pub remote: RemoteStatus,
}

/// Busy intervals reported by the external calendar for one day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteBusy {
    pub spans: Vec<Span>,
    pub status: RemoteStatus,
}

impl RemoteBusy {
    pub fn not_configured() -> Self {
        Self {
            spans: Vec::new(),
            status: RemoteStatus::NotConfigured,
        }
    }

    pub fn confirmed(spans: Vec<Span>) -> Self {
        Self {
            spans,
            status: RemoteStatus::Confirmed,
        }
    }

    pub fn unconfirmed() -> Self {
        Self {
            spans: Vec::new(),
            status: RemoteStatus::Unconfirmed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn busy(start: Ms, end: Ms) -> BusyInterval {
        BusyInterval {
            booking_id: Ulid::new(),
            slot_id: Ulid::new(),
            span: Span::new(start, end),
        }
    }

    fn day() -> DayState {
        DayState::new(NaiveDate::from_ymd_opt(2030, 1, 1).unwrap())
    }

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
    }

    #[test]
    fn span_contains_span() {
        let outer = Span::new(100, 400);
        assert!(outer.contains_span(&Span::new(150, 300)));
        assert!(outer.contains_span(&outer));
        assert!(!outer.contains_span(&Span::new(50, 200)));
    }

    #[test]
    fn try_new_rejects_empty_and_inverted() {
        assert!(matches!(
            Span::try_new(200, 200),
            Err(EngineError::InvalidInterval { start: 200, end: 200 })
        ));
        assert!(matches!(
            Span::try_new(300, 200),
            Err(EngineError::InvalidInterval { .. })
        ));
        assert_eq!(Span::try_new(1, 2).unwrap(), Span::new(1, 2));
    }

    #[test]
    fn slot_materializes_in_offset() {
        let slot = SlotDefinition {
            id: Ulid::new(),
            start_of_day: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
            end_of_day: NaiveTime::from_hms_opt(12, 0, 0).unwrap(),
            price_cents: 20_000,
            active: true,
        };
        let date = NaiveDate::from_ymd_opt(2030, 1, 1).unwrap();
        let utc = slot.span_on(date, FixedOffset::east_opt(0).unwrap()).unwrap();
        let plus2 = slot
            .span_on(date, FixedOffset::east_opt(2 * 3600).unwrap())
            .unwrap();
        assert_eq!(utc.duration_ms(), 2 * 3_600_000);
        // 10:00 at UTC+2 is 08:00 UTC.
        assert_eq!(utc.start - plus2.start, 2 * 3_600_000);
        assert_eq!(slot.label(), "10:00 - 12:00");
    }

    #[test]
    fn instants_past_the_calendar_edge_are_rejected() {
        let late = NaiveTime::from_hms_opt(23, 0, 0).unwrap();
        let west = FixedOffset::west_opt(5 * 3600).unwrap();
        let east = FixedOffset::east_opt(5 * 3600).unwrap();
        assert!(matches!(
            local_instant(NaiveDate::MAX, late, west),
            Err(EngineError::InvalidArgument(_))
        ));
        assert!(matches!(
            local_instant(NaiveDate::MIN, NaiveTime::MIN, east),
            Err(EngineError::InvalidArgument(_))
        ));
        // Same wall clock, shifted back into range.
        assert!(local_instant(NaiveDate::MAX, late, east).is_ok());
    }

    #[test]
    fn price_parsing() {
        assert_eq!(parse_price("200").unwrap(), 20_000);
        assert_eq!(parse_price("200.5").unwrap(), 20_050);
        assert_eq!(parse_price("250.00").unwrap(), 25_000);
        assert!(parse_price("").is_err());
        assert!(parse_price("1.234").is_err());
        assert!(parse_price("abc").is_err());
        assert!(parse_price("-1").is_err());
        assert_eq!(format_price(25_005), "250.05");
    }

    #[test]
    fn booking_status_transitions() {
        use BookingStatus::*;
        assert!(Confirmed.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Completed));
        assert!(Confirmed.can_transition_to(Cancelled));
        assert!(InProgress.can_transition_to(Cancelled));
        assert!(!Confirmed.can_transition_to(Completed));
        assert!(!InProgress.can_transition_to(Confirmed));
        for next in [Confirmed, InProgress, Completed, Cancelled] {
            assert!(!Completed.can_transition_to(next));
            assert!(!Cancelled.can_transition_to(next));
        }
        assert!(Confirmed.is_active() && InProgress.is_active());
        assert!(!Completed.is_active() && !Cancelled.is_active());
    }

    #[test]
    fn token_redeemable_window() {
        let mut token = Token {
            id: Ulid::new(),
            owner_id: Ulid::new(),
            value: "v".into(),
            purpose: TokenPurpose::PasswordReset,
            created_at: 1_000,
            expires_at: 2_000,
            used: false,
        };
        assert!(token.is_redeemable(1_999));
        assert!(!token.is_redeemable(2_000));
        token.used = true;
        assert!(!token.is_redeemable(1_500));
    }

    #[test]
    fn token_debug_hides_value() {
        let token = Token {
            id: Ulid::new(),
            owner_id: Ulid::new(),
            value: "super-secret".into(),
            purpose: TokenPurpose::EmailVerification,
            created_at: 0,
            expires_at: 1,
            used: false,
        };
        assert!(!format!("{token:?}").contains("super-secret"));
    }

    #[test]
    fn day_interval_ordering() {
        let mut d = day();
        d.insert_interval(busy(300, 400));
        d.insert_interval(busy(100, 200));
        d.insert_interval(busy(200, 300));
        let starts: Vec<Ms> = d.intervals.iter().map(|i| i.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn day_remove_middle_preserves_order() {
        let mut d = day();
        let items: Vec<BusyInterval> = (0..3).map(|i| busy(i * 100, i * 100 + 50)).collect();
        for i in &items {
            d.insert_interval(*i);
        }
        assert_eq!(d.remove_interval(items[1].booking_id), Some(items[1]));
        assert_eq!(d.intervals, vec![items[0], items[2]]);
        assert!(d.remove_interval(Ulid::new()).is_none());
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let mut d = day();
        d.insert_interval(busy(100, 200));
        d.insert_interval(busy(450, 600));
        d.insert_interval(busy(1000, 1100));
        let hits: Vec<_> = d.overlapping(&Span::new(500, 800)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(450, 600));
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        let mut d = day();
        d.insert_interval(busy(100, 200));
        assert_eq!(d.overlapping(&Span::new(200, 300)).count(), 0);
        assert_eq!(d.overlapping(&Span::new(0, 100)).count(), 0);
        assert_eq!(d.overlapping(&Span::new(199, 300)).count(), 1);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::SlotDefined {
            slot: SlotDefinition {
                id: Ulid::new(),
                start_of_day: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
                end_of_day: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
                price_cents: 20_000,
                active: true,
            },
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
