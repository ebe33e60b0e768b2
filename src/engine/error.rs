use ulid::Ulid;

use crate::model::{BookingStatus, Ms};

/// What a `NotFound` refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entity {
    Slot(Ulid),
    Booking(Ulid),
    Move(Ulid),
    /// Token values are never echoed back.
    Token,
    User,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictReason {
    /// The slot window overlaps an active booking or a remote busy interval.
    SlotUnavailable(Ulid),
    /// The move already holds this active booking.
    ActiveBookingExists(Ulid),
    /// A storage-level uniqueness constraint was hit.
    Duplicate(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    InvalidInterval { start: Ms, end: Ms },
    InvalidArgument(String),
    NotFound(Entity),
    PermissionDenied(Ulid),
    Conflict(ConflictReason),
    InvalidState { id: Ulid, status: BookingStatus },
    Expired,
    AlreadyUsed,
    /// A collaborator (calendar, notifications, moves) failed or timed out.
    UpstreamUnavailable(String),
    WalError(String),
}

impl EngineError {
    /// Short stable label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidInterval { .. } => "invalid_interval",
            EngineError::InvalidArgument(_) => "invalid_argument",
            EngineError::NotFound(_) => "not_found",
            EngineError::PermissionDenied(_) => "permission_denied",
            EngineError::Conflict(_) => "conflict",
            EngineError::InvalidState { .. } => "invalid_state",
            EngineError::Expired => "expired",
            EngineError::AlreadyUsed => "already_used",
            EngineError::UpstreamUnavailable(_) => "upstream_unavailable",
            EngineError::WalError(_) => "wal_error",
        }
    }
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Entity::Slot(id) => write!(f, "slot {id}"),
            Entity::Booking(id) => write!(f, "booking {id}"),
            Entity::Move(id) => write!(f, "move {id}"),
            Entity::Token => write!(f, "token"),
            Entity::User => write!(f, "user"),
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidInterval { start, end } => {
                write!(f, "invalid interval [{start}, {end}): start must be before end")
            }
            EngineError::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            EngineError::NotFound(entity) => write!(f, "not found: {entity}"),
            EngineError::PermissionDenied(id) => write!(f, "permission denied: {id}"),
            EngineError::Conflict(ConflictReason::SlotUnavailable(slot)) => {
                write!(f, "conflict: slot {slot} is not available for the selected date")
            }
            EngineError::Conflict(ConflictReason::ActiveBookingExists(id)) => {
                write!(f, "conflict: move already has an active booking {id}")
            }
            EngineError::Conflict(ConflictReason::Duplicate(what)) => {
                write!(f, "conflict: duplicate {what}")
            }
            EngineError::InvalidState { id, status } => {
                write!(f, "booking {id} cannot change state: already {status}")
            }
            EngineError::Expired => write!(f, "token has expired"),
            EngineError::AlreadyUsed => write!(f, "token has already been used"),
            EngineError::UpstreamUnavailable(e) => write!(f, "upstream unavailable: {e}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
