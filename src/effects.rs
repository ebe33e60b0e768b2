//! Side effects that follow a committed decision.
//!
//! Engine mutations never call collaborators themselves. They return the
//! effects that should follow and the [`Service`](crate::service::Service)
//! runs them after the write is durable. None of them can undo the commit.

use serde_json::Value;

use crate::model::{Booking, MoveId, MoveStatus, UserId};
use crate::notify::TemplateKind;

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Move the owning move to `status`, optionally only from `only_from`.
    SetMoveStatus {
        move_id: MoveId,
        owner_id: UserId,
        status: MoveStatus,
        only_from: Option<MoveStatus>,
    },
    Notify {
        user_id: UserId,
        kind: TemplateKind,
        payload: Value,
    },
    /// Mirror the booking into the external calendar.
    MirrorCreate { booking: Booking },
    MirrorDelete {
        booking_id: ulid::Ulid,
        external_event_id: String,
    },
}

impl Effect {
    pub fn label(&self) -> &'static str {
        match self {
            Effect::SetMoveStatus { .. } => "set_move_status",
            Effect::Notify { .. } => "notify",
            Effect::MirrorCreate { .. } => "mirror_create",
            Effect::MirrorDelete { .. } => "mirror_delete",
        }
    }
}

/// A committed value plus the effects that should follow it.
#[derive(Debug, Clone, PartialEq)]
pub struct Committed<T> {
    pub value: T,
    pub effects: Vec<Effect>,
}

impl<T> Committed<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            effects: Vec::new(),
        }
    }

    pub fn with(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }
}
