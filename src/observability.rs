// Metric names. The embedding process installs the recorder.

// ── Reservations ────────────────────────────────────────────────

/// Counter: bookings committed.
pub const BOOKINGS_CREATED_TOTAL: &str = "slotd_bookings_created_total";

/// Counter: bookings cancelled.
pub const BOOKINGS_CANCELLED_TOTAL: &str = "slotd_bookings_cancelled_total";

/// Counter: booking attempts rejected by a uniqueness rule. Labels: reason.
pub const BOOKING_CONFLICTS_TOTAL: &str = "slotd_booking_conflicts_total";

/// Counter: availability answers. Labels: remote (not_configured, confirmed, unconfirmed).
pub const AVAILABILITY_QUERIES_TOTAL: &str = "slotd_availability_queries_total";

// ── Collaborators ───────────────────────────────────────────────

/// Counter: calendar gateway failures and timeouts. Labels: op.
pub const CALENDAR_FAILURES_TOTAL: &str = "slotd_calendar_failures_total";

/// Counter: post-commit effects that failed. Labels: effect.
pub const EFFECT_FAILURES_TOTAL: &str = "slotd_effect_failures_total";

// ── Tokens ──────────────────────────────────────────────────────

/// Counter: tokens issued. Labels: purpose.
pub const TOKENS_ISSUED_TOTAL: &str = "slotd_tokens_issued_total";

/// Counter: redemption attempts. Labels: outcome.
pub const TOKEN_REDEMPTIONS_TOTAL: &str = "slotd_token_redemptions_total";

// ── Storage ─────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotd_wal_flush_batch_size";

/// Counter: completed WAL compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "slotd_wal_compactions_total";

/// Label for a [`RemoteStatus`](crate::model::RemoteStatus).
pub fn remote_label(status: crate::model::RemoteStatus) -> &'static str {
    use crate::model::RemoteStatus;
    match status {
        RemoteStatus::NotConfigured => "not_configured",
        RemoteStatus::Confirmed => "confirmed",
        RemoteStatus::Unconfirmed => "unconfirmed",
    }
}

/// Label for a conflict reason.
pub fn conflict_label(reason: &crate::engine::ConflictReason) -> &'static str {
    use crate::engine::ConflictReason;
    match reason {
        ConflictReason::SlotUnavailable(_) => "slot_unavailable",
        ConflictReason::ActiveBookingExists(_) => "active_booking_exists",
        ConflictReason::Duplicate(_) => "duplicate",
    }
}
