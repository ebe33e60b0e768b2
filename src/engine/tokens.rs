use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use rand::rngs::OsRng;
use tokio::sync::Mutex;
use tracing::{debug, info};
use ulid::Ulid;

use crate::model::*;
use crate::observability;

use super::conflict::now_ms;
use super::{Engine, EngineError, Entity};

/// Random bytes behind every token value.
const TOKEN_BYTES: usize = 32;

fn generate_token_value() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn redemption_outcome(outcome: &'static str) {
    metrics::counter!(observability::TOKEN_REDEMPTIONS_TOTAL, "outcome" => outcome).increment(1);
}

impl Engine {
    pub async fn issue_token(
        &self,
        owner_id: UserId,
        purpose: TokenPurpose,
    ) -> Result<Token, EngineError> {
        self.issue_token_at(owner_id, purpose, now_ms()).await
    }

    /// Issue a single-use token valid for the configured TTL of `purpose`.
    /// Earlier tokens of the same owner and purpose stay valid.
    pub async fn issue_token_at(
        &self,
        owner_id: UserId,
        purpose: TokenPurpose,
        now: Ms,
    ) -> Result<Token, EngineError> {
        let commit = self.commit_gate.clone().read_owned().await;
        let mut value = generate_token_value();
        while self.tokens.contains_key(&value) {
            value = generate_token_value();
        }
        let token = Token {
            id: Ulid::new(),
            owner_id,
            value,
            purpose,
            created_at: now,
            expires_at: now.saturating_add(self.config().token_ttl_ms(purpose)),
            used: false,
        };

        let tokens = self.tokens.clone();
        self.persist_and_apply(
            Event::TokenIssued {
                token: token.clone(),
            },
            commit,
            move |e, _| {
                if let Event::TokenIssued { token } = e {
                    tokens.insert(token.value.clone(), Arc::new(Mutex::new(token.clone())));
                }
            },
        )
        .await?;

        metrics::counter!(observability::TOKENS_ISSUED_TOTAL, "purpose" => purpose.as_str())
            .increment(1);
        info!("issued {} token {} for {owner_id}", purpose.as_str(), token.id);
        Ok(token)
    }

    pub async fn redeem_token(
        &self,
        value: &str,
        purpose: TokenPurpose,
    ) -> Result<UserId, EngineError> {
        self.redeem_token_at(value, purpose, now_ms()).await
    }

    /// Atomically mark a token used and return its owner.
    ///
    /// Checks in order: unknown value or other purpose (`NotFound`), already
    /// redeemed (`AlreadyUsed`), past `expires_at` (`Expired`). The token's
    /// lock is held across the WAL write so concurrent redemptions of one
    /// value see exactly one success.
    pub async fn redeem_token_at(
        &self,
        value: &str,
        purpose: TokenPurpose,
        now: Ms,
    ) -> Result<UserId, EngineError> {
        let commit = self.commit_gate.clone().read_owned().await;
        let Some(shared) = self.tokens.get(value).map(|t| t.value().clone()) else {
            redemption_outcome("not_found");
            return Err(EngineError::NotFound(Entity::Token));
        };
        let token = shared.lock_owned().await;

        if token.purpose != purpose {
            debug!("token {} presented for {}", token.id, purpose.as_str());
            redemption_outcome("not_found");
            return Err(EngineError::NotFound(Entity::Token));
        }
        if token.used {
            redemption_outcome("already_used");
            return Err(EngineError::AlreadyUsed);
        }
        if now >= token.expires_at {
            redemption_outcome("expired");
            return Err(EngineError::Expired);
        }

        let (id, owner_id) = (token.id, token.owner_id);
        self.persist_and_apply(
            Event::TokenRedeemed {
                value: value.to_string(),
                at: now,
            },
            (commit, token),
            |_, (_, token)| token.used = true,
        )
        .await?;
        redemption_outcome("redeemed");
        info!("redeemed {} token {id}", purpose.as_str());
        Ok(owner_id)
    }
}
