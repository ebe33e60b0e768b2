use async_trait::async_trait;

use crate::engine::EngineError;
use crate::model::UserId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: UserId,
    pub email_verified: bool,
}

/// Lookup into the account service, used by the email-driven token flows.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_by_email(&self, email: &str) -> Result<Option<UserRecord>, EngineError>;
}
