//! Refresh token issuance, validation, revocation and rotation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tessera_auth::{RefreshToken, RefreshTokenConfig, generate_token_value};
use tessera_core::UserId;

use super::store::{RefreshTokenStore, TokenStoreError};

/// How many fresh values `create` tries before giving up on collisions.
pub const MAX_GENERATION_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum RefreshTokenError {
    #[error(transparent)]
    Store(#[from] TokenStoreError),

    #[error("could not generate a unique refresh token after {attempts} attempts")]
    GenerationExhausted { attempts: u32 },

    #[error("refresh token operation cancelled")]
    Cancelled,
}

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Refresh token lifecycle over a [`RefreshTokenStore`].
///
/// Lookups that find nothing, and checks that fail, are reported as
/// `None`/`false`; only storage failures are errors. Token values never
/// appear in logs.
pub struct RefreshTokenService<S> {
    store: S,
    config: RefreshTokenConfig,
    clock: Clock,
}

impl<S> RefreshTokenService<S> {
    pub fn new(store: S, config: RefreshTokenConfig) -> Self {
        Self::with_clock(store, config, Arc::new(Utc::now))
    }

    /// Same as [`new`](Self::new) with an injected time source.
    pub fn with_clock(store: S, config: RefreshTokenConfig, clock: Clock) -> Self {
        Self {
            store,
            config,
            clock,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &RefreshTokenConfig {
        &self.config
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }
}

impl<S: RefreshTokenStore> RefreshTokenService<S> {
    /// Issue and persist a new token for `user_id`.
    pub async fn create(
        &self,
        user_id: UserId,
        cancel: &CancellationToken,
    ) -> Result<RefreshToken, RefreshTokenError> {
        guarded(cancel, self.issue(user_id)).await
    }

    /// Revoke a token. `false` if it is unknown or already revoked.
    pub async fn revoke(
        &self,
        token: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, RefreshTokenError> {
        guarded(cancel, self.revoke_one(token)).await
    }

    /// True only if the token exists, belongs to `user_id`, is not revoked
    /// and has not expired.
    pub async fn is_valid(
        &self,
        token: &str,
        user_id: UserId,
        cancel: &CancellationToken,
    ) -> Result<bool, RefreshTokenError> {
        let found = guarded(cancel, self.find_by_token(token)).await?;
        let now = self.now();
        Ok(found.is_some_and(|t| t.is_valid_for(user_id, now)))
    }

    pub async fn get_by_token(
        &self,
        token: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<RefreshToken>, RefreshTokenError> {
        guarded(cancel, self.find_by_token(token)).await
    }

    /// Lookup scoped to `user_id`; another user's token is reported as absent.
    pub async fn get(
        &self,
        user_id: UserId,
        token: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<RefreshToken>, RefreshTokenError> {
        guarded(cancel, self.find_for_user(user_id, token)).await
    }

    /// Exchange a valid token for a new one.
    ///
    /// Returns `None` if `old` is not valid for `user_id`, including when it
    /// gets revoked while the rotation is running (the replacement is then
    /// revoked too). The new token is stored before `old` is revoked, so a
    /// failed creation leaves `old` usable.
    pub async fn rotate(
        &self,
        user_id: UserId,
        old: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<RefreshToken>, RefreshTokenError> {
        guarded(cancel, self.exchange(user_id, old)).await
    }

    /// Revoke every active token of a user (sign out everywhere).
    pub async fn revoke_all_for_user(
        &self,
        user_id: UserId,
        cancel: &CancellationToken,
    ) -> Result<u64, RefreshTokenError> {
        guarded(cancel, self.revoke_every(user_id)).await
    }

    async fn issue(&self, user_id: UserId) -> Result<RefreshToken, RefreshTokenError> {
        for attempt in 1..=MAX_GENERATION_ATTEMPTS {
            let value = generate_token_value(self.config.token_bytes);
            let token = RefreshToken::issue(user_id, value, self.now(), self.config.lifetime);

            match self.store.insert(&token).await {
                Ok(()) => {
                    info!(user_id = %user_id, expires_at = %token.expires_at, "refresh token issued");
                    return Ok(token);
                }
                Err(TokenStoreError::Duplicate) => {
                    warn!(user_id = %user_id, attempt, "refresh token value collided; regenerating");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(RefreshTokenError::GenerationExhausted {
            attempts: MAX_GENERATION_ATTEMPTS,
        })
    }

    async fn revoke_one(&self, token: &str) -> Result<bool, RefreshTokenError> {
        let revoked = self.store.revoke(token, self.now()).await?;
        if revoked {
            info!("refresh token revoked");
        }
        Ok(revoked)
    }

    async fn find_by_token(&self, token: &str) -> Result<Option<RefreshToken>, RefreshTokenError> {
        Ok(self.store.find_by_token(token).await?)
    }

    async fn find_for_user(
        &self,
        user_id: UserId,
        token: &str,
    ) -> Result<Option<RefreshToken>, RefreshTokenError> {
        Ok(self.store.find_for_user(user_id, token).await?)
    }

    async fn exchange(
        &self,
        user_id: UserId,
        old: &str,
    ) -> Result<Option<RefreshToken>, RefreshTokenError> {
        let current = self.store.find_for_user(user_id, old).await?;
        let now = self.now();
        if !current.is_some_and(|t| t.is_active(now)) {
            return Ok(None);
        }

        let fresh = self.issue(user_id).await?;
        if !self.store.revoke(old, self.now()).await? {
            // Revoked concurrently (logout or a parallel rotation): the old
            // token no longer entitles anyone to a replacement.
            warn!(user_id = %user_id, "refresh token revoked during rotation; discarding replacement");
            if let Err(e) = self.store.revoke(&fresh.token, self.now()).await {
                warn!(user_id = %user_id, error = %e, "failed to revoke discarded replacement token");
            }
            return Ok(None);
        }
        info!(user_id = %user_id, "refresh token rotated");
        Ok(Some(fresh))
    }

    async fn revoke_every(&self, user_id: UserId) -> Result<u64, RefreshTokenError> {
        let revoked = self.store.revoke_all_for_user(user_id, self.now()).await?;
        info!(user_id = %user_id, revoked, "refresh tokens revoked for user");
        Ok(revoked)
    }
}

impl<S> core::fmt::Debug for RefreshTokenService<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RefreshTokenService")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Reject up front if already cancelled, otherwise race `op` against `cancel`.
async fn guarded<T, F>(cancel: &CancellationToken, op: F) -> Result<T, RefreshTokenError>
where
    F: Future<Output = Result<T, RefreshTokenError>>,
{
    if cancel.is_cancelled() {
        return Err(RefreshTokenError::Cancelled);
    }
    cancel
        .run_until_cancelled(op)
        .await
        .unwrap_or(Err(RefreshTokenError::Cancelled))
}
