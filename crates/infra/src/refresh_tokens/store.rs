use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use tessera_auth::RefreshToken;
use tessera_core::UserId;

#[derive(Debug, Error)]
pub enum TokenStoreError {
    /// A token with the same value already exists.
    #[error("duplicate refresh token value")]
    Duplicate,

    #[error("token storage error: {0}")]
    Storage(String),
}

/// Refresh token persistence abstraction.
///
/// "Not found" is never an error here: lookups return `None` and `revoke`
/// returns `false`.
#[async_trait]
pub trait RefreshTokenStore: Send + Sync {
    /// Persist a new token. Values are unique.
    async fn insert(&self, token: &RefreshToken) -> Result<(), TokenStoreError>;

    async fn find_by_token(&self, token: &str) -> Result<Option<RefreshToken>, TokenStoreError>;

    /// Lookup scoped to an owner; another user's token is reported as absent.
    async fn find_for_user(
        &self,
        user_id: UserId,
        token: &str,
    ) -> Result<Option<RefreshToken>, TokenStoreError>;

    /// Flip an unrevoked token to revoked. Returns whether a row changed.
    async fn revoke(&self, token: &str, at: DateTime<Utc>) -> Result<bool, TokenStoreError>;

    /// Revoke every unrevoked token of a user. Returns how many changed.
    async fn revoke_all_for_user(
        &self,
        user_id: UserId,
        at: DateTime<Utc>,
    ) -> Result<u64, TokenStoreError>;
}

#[async_trait]
impl<S> RefreshTokenStore for Arc<S>
where
    S: RefreshTokenStore + ?Sized,
{
    async fn insert(&self, token: &RefreshToken) -> Result<(), TokenStoreError> {
        (**self).insert(token).await
    }

    async fn find_by_token(&self, token: &str) -> Result<Option<RefreshToken>, TokenStoreError> {
        (**self).find_by_token(token).await
    }

    async fn find_for_user(
        &self,
        user_id: UserId,
        token: &str,
    ) -> Result<Option<RefreshToken>, TokenStoreError> {
        (**self).find_for_user(user_id, token).await
    }

    async fn revoke(&self, token: &str, at: DateTime<Utc>) -> Result<bool, TokenStoreError> {
        (**self).revoke(token, at).await
    }

    async fn revoke_all_for_user(
        &self,
        user_id: UserId,
        at: DateTime<Utc>,
    ) -> Result<u64, TokenStoreError> {
        (**self).revoke_all_for_user(user_id, at).await
    }
}
