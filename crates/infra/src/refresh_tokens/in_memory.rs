//! In-memory refresh token store (tests/dev).

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use tessera_auth::RefreshToken;
use tessera_core::UserId;

use super::store::{RefreshTokenStore, TokenStoreError};

/// Scripted failure for the next `insert` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertFailure {
    /// Reject as if the value collided.
    Duplicate,
    /// Reject as a backend failure.
    Storage,
}

/// Token rows keyed by value.
#[derive(Debug, Default)]
pub struct InMemoryRefreshTokenStore {
    tokens: RwLock<HashMap<String, RefreshToken>>,
    insert_failures: Mutex<VecDeque<InsertFailure>>,
}

impl InMemoryRefreshTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a failure for an upcoming `insert`; queued failures are consumed
    /// one per call, in order.
    pub fn fail_next_insert(&self, failure: InsertFailure) {
        self.insert_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(failure);
    }

    pub fn len(&self) -> usize {
        self.tokens
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RefreshTokenStore for InMemoryRefreshTokenStore {
    async fn insert(&self, token: &RefreshToken) -> Result<(), TokenStoreError> {
        let scripted = self
            .insert_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        match scripted {
            Some(InsertFailure::Duplicate) => return Err(TokenStoreError::Duplicate),
            Some(InsertFailure::Storage) => {
                return Err(TokenStoreError::Storage("injected insert failure".into()));
            }
            None => {}
        }

        let mut tokens = self.tokens.write().unwrap_or_else(PoisonError::into_inner);
        if tokens.contains_key(&token.token) {
            return Err(TokenStoreError::Duplicate);
        }
        tokens.insert(token.token.clone(), token.clone());
        Ok(())
    }

    async fn find_by_token(&self, token: &str) -> Result<Option<RefreshToken>, TokenStoreError> {
        let tokens = self.tokens.read().unwrap_or_else(PoisonError::into_inner);
        Ok(tokens.get(token).cloned())
    }

    async fn find_for_user(
        &self,
        user_id: UserId,
        token: &str,
    ) -> Result<Option<RefreshToken>, TokenStoreError> {
        let tokens = self.tokens.read().unwrap_or_else(PoisonError::into_inner);
        Ok(tokens.get(token).filter(|t| t.user_id == user_id).cloned())
    }

    async fn revoke(&self, token: &str, at: DateTime<Utc>) -> Result<bool, TokenStoreError> {
        let mut tokens = self.tokens.write().unwrap_or_else(PoisonError::into_inner);
        Ok(tokens.get_mut(token).is_some_and(|t| t.revoke(at)))
    }

    async fn revoke_all_for_user(
        &self,
        user_id: UserId,
        at: DateTime<Utc>,
    ) -> Result<u64, TokenStoreError> {
        let mut tokens = self.tokens.write().unwrap_or_else(PoisonError::into_inner);
        let revoked = tokens
            .values_mut()
            .filter(|t| t.user_id == user_id)
            .map(|t| t.revoke(at))
            .filter(|changed| *changed)
            .count();
        Ok(revoked as u64)
    }
}
