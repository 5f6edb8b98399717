//! Refresh token record and its validity rules.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use tessera_core::UserId;

/// A long-lived credential exchanged for short-lived access credentials.
///
/// # Invariants
/// - Valid iff not revoked, not expired, and owned by the claimed user.
/// - Revocation is monotonic: once revoked, never valid again.
/// - Records are never deleted by this crate (retention is an outside concern).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshToken {
    /// Opaque, unguessable token value.
    pub token: String,
    pub user_id: UserId,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl RefreshToken {
    /// Build a fresh, unrevoked token expiring `lifetime` after `now`.
    pub fn issue(user_id: UserId, token: String, now: DateTime<Utc>, lifetime: Duration) -> Self {
        Self {
            token,
            user_id,
            expires_at: now + lifetime,
            revoked: false,
            created_at: now,
            revoked_at: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Not revoked and not expired (owner not checked).
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        !self.revoked && !self.is_expired(now)
    }

    /// Composite check: active and owned by `user_id`.
    pub fn is_valid_for(&self, user_id: UserId, now: DateTime<Utc>) -> bool {
        self.user_id == user_id && self.is_active(now)
    }

    /// Mark revoked. Returns `false` if it already was.
    pub fn revoke(&mut self, now: DateTime<Utc>) -> bool {
        if self.revoked {
            return false;
        }
        self.revoked = true;
        self.revoked_at = Some(now);
        true
    }
}
