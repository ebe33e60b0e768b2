use async_trait::async_trait;
use chrono::NaiveDate;

use crate::engine::EngineError;
use crate::model::{MoveId, MoveStatus, UserId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveInfo {
    pub id: MoveId,
    pub owner_id: UserId,
    pub date: NaiveDate,
    pub status: MoveStatus,
}

/// The service that owns moves and their status.
#[async_trait]
pub trait MoveDirectory: Send + Sync {
    /// `NotFound` when the move does not exist, `PermissionDenied` when it
    /// belongs to someone else.
    async fn get_move_for_user(&self, move_id: MoveId, user_id: UserId)
    -> Result<MoveInfo, EngineError>;

    async fn set_status(&self, move_id: MoveId, status: MoveStatus) -> Result<(), EngineError>;
}
