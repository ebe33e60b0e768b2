use std::sync::LazyLock;

use regex::Regex;
use ulid::Ulid;

use crate::model::*;

use super::error::ConflictReason;
use super::EngineError;

static PHONE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[+0-9 ()\-]{8,20}$").expect("phone pattern compiles"));

pub(crate) fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn validate_phone(phone: &str) -> Result<(), EngineError> {
    if PHONE_PATTERN.is_match(phone) {
        Ok(())
    } else {
        Err(EngineError::InvalidArgument(
            "phone number must be 8-20 characters of digits, spaces, +, -, ( and )".into(),
        ))
    }
}

/// Fails if `span` overlaps an active booking on this day or a remote busy interval.
pub(crate) fn check_no_conflict(
    day: &DayState,
    slot_id: Ulid,
    span: &Span,
    remote_busy: &[Span],
) -> Result<(), EngineError> {
    if let Some(hit) = day.overlapping(span).next() {
        tracing::debug!(
            "slot {slot_id} on {} overlaps booking {}",
            day.date,
            hit.booking_id
        );
        return Err(EngineError::Conflict(ConflictReason::SlotUnavailable(slot_id)));
    }
    if remote_busy.iter().any(|b| b.overlaps(span)) {
        tracing::debug!("slot {slot_id} on {} is busy in the external calendar", day.date);
        return Err(EngineError::Conflict(ConflictReason::SlotUnavailable(slot_id)));
    }
    Ok(())
}
