use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::engine::EngineError;
use crate::model::UserId;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TemplateKind {
    BookingConfirmation,
    VerifyEmail,
    PasswordReset,
}

impl TemplateKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TemplateKind::BookingConfirmation => "booking_confirmation",
            TemplateKind::VerifyEmail => "verify_email",
            TemplateKind::PasswordReset => "password_reset",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub user_id: UserId,
    pub kind: TemplateKind,
    pub payload: Value,
}

/// Delivers a templated message to a user. Callers treat every failure as advisory.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, user_id: UserId, kind: TemplateKind, payload: Value)
    -> Result<(), EngineError>;
}

/// In-process fan-out of notifications to per-user subscribers
/// (a mail worker, a websocket session, a test).
pub struct BroadcastNotifier {
    channels: DashMap<UserId, broadcast::Sender<Notification>>,
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastNotifier {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to notifications for a user. Creates the channel if needed.
    pub fn subscribe(&self, user_id: UserId) -> broadcast::Receiver<Notification> {
        let sender = self
            .channels
            .entry(user_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Drop a user's channel; existing receivers see the stream close.
    pub fn remove(&self, user_id: &UserId) {
        self.channels.remove(user_id);
    }
}

#[async_trait]
impl Notifier for BroadcastNotifier {
    /// No-op if nobody is listening.
    async fn send(
        &self,
        user_id: UserId,
        kind: TemplateKind,
        payload: Value,
    ) -> Result<(), EngineError> {
        if let Some(sender) = self.channels.get(&user_id) {
            let _ = sender.send(Notification {
                user_id,
                kind,
                payload,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use ulid::Ulid;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = BroadcastNotifier::new();
        let user = Ulid::new();
        let mut rx = hub.subscribe(user);

        hub.send(user, TemplateKind::VerifyEmail, json!({"link": "x"}))
            .await
            .unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.user_id, user);
        assert_eq!(received.kind, TemplateKind::VerifyEmail);
        assert_eq!(received.payload["link"], "x");
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = BroadcastNotifier::new();
        hub.send(Ulid::new(), TemplateKind::PasswordReset, Value::Null)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn users_are_isolated() {
        let hub = BroadcastNotifier::new();
        let (a, b) = (Ulid::new(), Ulid::new());
        let mut rx_a = hub.subscribe(a);
        let _rx_b = hub.subscribe(b);

        hub.send(b, TemplateKind::BookingConfirmation, Value::Null)
            .await
            .unwrap();
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn remove_closes_stream() {
        let hub = BroadcastNotifier::new();
        let user = Ulid::new();
        let mut rx = hub.subscribe(user);
        hub.remove(&user);
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }
}
