//! The outer orchestrator. Consults collaborators before a decision, hands the
//! decision to the [`Engine`], then runs the returned effects.
//!
//! Collaborator failures after a commit are logged and counted, never
//! reported as the operation's outcome.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::calendar::CalendarGateway;
use crate::compactor;
use crate::effects::Effect;
use crate::engine::{query_window, Engine, EngineError};
use crate::model::*;
use crate::moves::MoveDirectory;
use crate::notify::{Notifier, TemplateKind};
use crate::observability;
use crate::users::UserDirectory;

pub struct Service {
    engine: Arc<Engine>,
    moves: Arc<dyn MoveDirectory>,
    users: Arc<dyn UserDirectory>,
    notifier: Arc<dyn Notifier>,
    calendar: Option<Arc<dyn CalendarGateway>>,
}

/// `2 hours`, `1 hour`, `45 minutes`.
fn describe_ttl(ttl: Duration) -> String {
    let minutes = ttl.as_secs() / 60;
    let plural = |n: u64, unit: &str| {
        if n == 1 {
            format!("1 {unit}")
        } else {
            format!("{n} {unit}s")
        }
    };
    if minutes >= 60 && minutes % 60 == 0 {
        plural(minutes / 60, "hour")
    } else {
        plural(minutes, "minute")
    }
}

impl Service {
    pub fn new(
        engine: Arc<Engine>,
        moves: Arc<dyn MoveDirectory>,
        users: Arc<dyn UserDirectory>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            engine,
            moves,
            users,
            notifier,
            calendar: None,
        }
    }

    pub fn with_calendar(mut self, calendar: Arc<dyn CalendarGateway>) -> Self {
        self.calendar = Some(calendar);
        self
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Start the background WAL compactor for this service's engine.
    pub fn start_compactor(&self) -> JoinHandle<()> {
        compactor::spawn_compactor(self.engine.clone())
    }

    /// Run a collaborator call under the configured timeout.
    async fn bounded<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = Result<T, EngineError>>,
    ) -> Result<T, EngineError> {
        let timeout = self.engine.config().calendar_timeout;
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::UpstreamUnavailable(format!(
                "{op} timed out after {}ms",
                timeout.as_millis()
            ))),
        }
    }

    /// Remote busy intervals for the window covering `slots` on `date`.
    /// Gateway errors and timeouts yield `Unconfirmed`; only a date whose
    /// window cannot be represented is an error.
    async fn remote_busy(
        &self,
        date: NaiveDate,
        slots: &[SlotDefinition],
    ) -> Result<RemoteBusy, EngineError> {
        let window = query_window(self.engine.config(), date, slots)?;
        let Some(calendar) = &self.calendar else {
            return Ok(RemoteBusy::not_configured());
        };
        Ok(match self
            .bounded("query_busy", calendar.query_busy(date, window))
            .await
        {
            Ok(spans) => RemoteBusy::confirmed(spans),
            Err(e) => {
                warn!("calendar busy query for {date} failed, using local bookings only: {e}");
                metrics::counter!(observability::CALENDAR_FAILURES_TOTAL, "op" => "query_busy")
                    .increment(1);
                RemoteBusy::unconfirmed()
            }
        })
    }

    pub async fn availability(&self, date: NaiveDate) -> Result<Availability, EngineError> {
        let slots = self.engine.list_active_slots();
        let remote = self.remote_busy(date, &slots).await?;
        self.engine.availability(date, remote).await
    }

    /// Preconditions run in order (slot, phone, move, availability, one
    /// active booking per move) and the first failure is returned.
    pub async fn create_booking(
        &self,
        principal: UserId,
        req: &BookingRequest,
    ) -> Result<Booking, EngineError> {
        let slot = self.engine.check_request(req)?;
        let mv = self.moves.get_move_for_user(req.move_id, principal).await?;
        let remote = self
            .remote_busy(req.date, std::slice::from_ref(&slot))
            .await?;
        let committed = self
            .engine
            .commit_booking(principal, &mv, req, &remote.spans)
            .await?;
        let id = committed.value.id;
        self.run_effects(committed.effects).await;
        // Effects may have linked a calendar event.
        Ok(self
            .engine
            .get_booking(principal, id)
            .unwrap_or(committed.value))
    }

    pub async fn cancel_booking(&self, principal: UserId, id: Ulid) -> Result<Booking, EngineError> {
        let committed = self.engine.cancel_booking(principal, id).await?;
        self.run_effects(committed.effects).await;
        Ok(committed.value)
    }

    pub fn get_booking(&self, principal: UserId, id: Ulid) -> Result<Booking, EngineError> {
        self.engine.get_booking(principal, id)
    }

    pub fn list_bookings(&self, principal: UserId) -> Vec<Booking> {
        self.engine.list_bookings(principal)
    }

    pub async fn issue_token(&self, user_id: UserId, purpose: TokenPurpose) -> Result<Token, EngineError> {
        self.engine.issue_token(user_id, purpose).await
    }

    pub async fn redeem_token(&self, value: &str, purpose: TokenPurpose) -> Result<UserId, EngineError> {
        self.engine.redeem_token(value, purpose).await
    }

    /// Issue a verification token and email its link. Used at registration.
    pub async fn send_verification(&self, user_id: UserId) -> Result<Token, EngineError> {
        let token = self
            .engine
            .issue_token(user_id, TokenPurpose::EmailVerification)
            .await?;
        let config = self.engine.config();
        let payload = json!({
            "verification_url": format!("{}/verify-email?token={}", config.frontend_url, token.value),
            "expires_in": describe_ttl(config.verification_ttl),
        });
        self.run_effects(vec![Effect::Notify {
            user_id,
            kind: TemplateKind::VerifyEmail,
            payload,
        }])
        .await;
        Ok(token)
    }

    /// Same outcome whether or not the email is registered or already verified.
    pub async fn resend_verification(&self, email: &str) {
        match self.users.find_by_email(email).await {
            Ok(Some(user)) if !user.email_verified => {
                if let Err(e) = self.send_verification(user.id).await {
                    warn!("resend verification for {} failed: {e}", user.id);
                }
            }
            Ok(Some(user)) => debug!("user {} already verified", user.id),
            Ok(None) => debug!("resend verification: no matching user"),
            Err(e) => warn!("resend verification lookup failed: {e}"),
        }
    }

    /// Same outcome whether or not the email is registered.
    pub async fn forgot_password(&self, email: &str) {
        let user = match self.users.find_by_email(email).await {
            Ok(Some(user)) => user,
            Ok(None) => {
                debug!("password reset: no matching user");
                return;
            }
            Err(e) => {
                warn!("password reset lookup failed: {e}");
                return;
            }
        };
        let token = match self
            .engine
            .issue_token(user.id, TokenPurpose::PasswordReset)
            .await
        {
            Ok(token) => token,
            Err(e) => {
                warn!("password reset token for {} failed: {e}", user.id);
                return;
            }
        };
        let config = self.engine.config();
        let payload = json!({
            "reset_url": format!("{}/reset-password/confirm/{}", config.frontend_url, token.value),
            "expires_in": describe_ttl(config.reset_ttl),
        });
        self.run_effects(vec![Effect::Notify {
            user_id: user.id,
            kind: TemplateKind::PasswordReset,
            payload,
        }])
        .await;
    }

    /// Run effects in order. Each failure is logged and counted, then skipped.
    pub async fn run_effects(&self, effects: Vec<Effect>) {
        for effect in effects {
            let label = effect.label();
            if let Err(e) = self.run_effect(effect).await {
                warn!("{label} effect failed: {e}");
                metrics::counter!(observability::EFFECT_FAILURES_TOTAL, "effect" => label)
                    .increment(1);
            }
        }
    }

    async fn run_effect(&self, effect: Effect) -> Result<(), EngineError> {
        match effect {
            Effect::SetMoveStatus {
                move_id,
                owner_id,
                status,
                only_from,
            } => {
                if let Some(from) = only_from {
                    let mv = self
                        .bounded("get_move", self.moves.get_move_for_user(move_id, owner_id))
                        .await?;
                    if mv.status != from {
                        debug!("move {move_id} is {:?}, leaving it", mv.status);
                        return Ok(());
                    }
                }
                self.bounded("set_move_status", self.moves.set_status(move_id, status))
                    .await
            }
            Effect::Notify {
                user_id,
                kind,
                payload,
            } => {
                self.bounded("notify", self.notifier.send(user_id, kind, payload))
                    .await
            }
            Effect::MirrorCreate { booking } => {
                let Some(calendar) = &self.calendar else {
                    return Ok(());
                };
                let external_id = self
                    .bounded("create_event", calendar.create_event(&booking))
                    .await
                    .inspect_err(|_| calendar_failure("create_event"))?;
                let linked = self
                    .engine
                    .link_calendar_event(booking.id, external_id.clone())
                    .await?;
                info!("booking {} mirrored as {external_id}", booking.id);
                if linked.status == BookingStatus::Cancelled {
                    // Cancelled before the link landed; nothing else will delete it.
                    self.bounded("delete_event", calendar.delete_event(&external_id))
                        .await
                        .inspect_err(|_| calendar_failure("delete_event"))?;
                }
                Ok(())
            }
            Effect::MirrorDelete {
                booking_id,
                external_event_id,
            } => {
                let Some(calendar) = &self.calendar else {
                    return Ok(());
                };
                self.bounded("delete_event", calendar.delete_event(&external_event_id))
                    .await
                    .inspect_err(|_| calendar_failure("delete_event"))?;
                debug!("removed calendar event for booking {booking_id}");
                Ok(())
            }
        }
    }
}

fn calendar_failure(op: &'static str) {
    metrics::counter!(observability::CALENDAR_FAILURES_TOTAL, "op" => op).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_descriptions() {
        assert_eq!(describe_ttl(Duration::from_secs(2 * 3600)), "2 hours");
        assert_eq!(describe_ttl(Duration::from_secs(3600)), "1 hour");
        assert_eq!(describe_ttl(Duration::from_secs(24 * 3600)), "24 hours");
        assert_eq!(describe_ttl(Duration::from_secs(90 * 60)), "90 minutes");
        assert_eq!(describe_ttl(Duration::from_secs(60)), "1 minute");
    }
}
