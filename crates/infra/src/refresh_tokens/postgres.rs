//! Postgres-backed refresh token store.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | TokenStoreError | Scenario |
//! |------------|----------------------|-----------------|----------|
//! | Database (unique violation) | `23505` | `Duplicate` | Token value collision |
//! | Database (other) | Any other | `Storage` | Constraint or backend failure |
//! | PoolClosed | N/A | `Storage` | Connection pool was closed |
//! | Other | N/A | `Storage` | Network errors, decode failures, etc. |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;

use tessera_auth::RefreshToken;
use tessera_core::UserId;

use super::store::{RefreshTokenStore, TokenStoreError};

/// DDL for the `refresh_tokens` table.
///
/// Tokens are looked up by value (unique index) and revoked in bulk per user.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS refresh_tokens (
    token       TEXT        PRIMARY KEY,
    user_id     UUID        NOT NULL,
    expires_at  TIMESTAMPTZ NOT NULL,
    revoked     BOOLEAN     NOT NULL DEFAULT FALSE,
    created_at  TIMESTAMPTZ NOT NULL,
    revoked_at  TIMESTAMPTZ NULL
);
CREATE INDEX IF NOT EXISTS refresh_tokens_user_id_idx ON refresh_tokens (user_id);
"#;

/// Refresh token store over a shared SQLx pool.
#[derive(Debug, Clone)]
pub struct PostgresRefreshTokenStore {
    pool: Arc<PgPool>,
}

impl PostgresRefreshTokenStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the table and index if missing.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), TokenStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }
}

#[async_trait]
impl RefreshTokenStore for PostgresRefreshTokenStore {
    #[instrument(skip(self, token), fields(user_id = %token.user_id), err)]
    async fn insert(&self, token: &RefreshToken) -> Result<(), TokenStoreError> {
        sqlx::query(
            r#"
            INSERT INTO refresh_tokens (token, user_id, expires_at, revoked, created_at, revoked_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&token.token)
        .bind(token.user_id.as_uuid())
        .bind(token.expires_at)
        .bind(token.revoked)
        .bind(token.created_at)
        .bind(token.revoked_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert", e))?;
        Ok(())
    }

    #[instrument(skip(self, token), err)]
    async fn find_by_token(&self, token: &str) -> Result<Option<RefreshToken>, TokenStoreError> {
        let row = sqlx::query(
            r#"
            SELECT token, user_id, expires_at, revoked, created_at, revoked_at
            FROM refresh_tokens
            WHERE token = $1
            "#,
        )
        .bind(token)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_by_token", e))?;

        row.map(|r| decode(&r)).transpose()
    }

    #[instrument(skip(self, token), fields(user_id = %user_id), err)]
    async fn find_for_user(
        &self,
        user_id: UserId,
        token: &str,
    ) -> Result<Option<RefreshToken>, TokenStoreError> {
        let row = sqlx::query(
            r#"
            SELECT token, user_id, expires_at, revoked, created_at, revoked_at
            FROM refresh_tokens
            WHERE token = $1 AND user_id = $2
            "#,
        )
        .bind(token)
        .bind(user_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_for_user", e))?;

        row.map(|r| decode(&r)).transpose()
    }

    #[instrument(skip(self, token), err)]
    async fn revoke(&self, token: &str, at: DateTime<Utc>) -> Result<bool, TokenStoreError> {
        // The `revoked = false` guard keeps the transition one-way.
        let result = sqlx::query(
            r#"
            UPDATE refresh_tokens
            SET revoked = true, revoked_at = $2
            WHERE token = $1 AND revoked = false
            "#,
        )
        .bind(token)
        .bind(at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("revoke", e))?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), fields(user_id = %user_id), err)]
    async fn revoke_all_for_user(
        &self,
        user_id: UserId,
        at: DateTime<Utc>,
    ) -> Result<u64, TokenStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE refresh_tokens
            SET revoked = true, revoked_at = $2
            WHERE user_id = $1 AND revoked = false
            "#,
        )
        .bind(user_id.as_uuid())
        .bind(at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("revoke_all_for_user", e))?;

        Ok(result.rows_affected())
    }
}

struct RefreshTokenRow {
    token: String,
    user_id: uuid::Uuid,
    expires_at: DateTime<Utc>,
    revoked: bool,
    created_at: DateTime<Utc>,
    revoked_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, PgRow> for RefreshTokenRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(RefreshTokenRow {
            token: row.try_get("token")?,
            user_id: row.try_get("user_id")?,
            expires_at: row.try_get("expires_at")?,
            revoked: row.try_get("revoked")?,
            created_at: row.try_get("created_at")?,
            revoked_at: row.try_get("revoked_at")?,
        })
    }
}

impl From<RefreshTokenRow> for RefreshToken {
    fn from(row: RefreshTokenRow) -> Self {
        RefreshToken {
            token: row.token,
            user_id: UserId::from_uuid(row.user_id),
            expires_at: row.expires_at,
            revoked: row.revoked,
            created_at: row.created_at,
            revoked_at: row.revoked_at,
        }
    }
}

fn decode(row: &PgRow) -> Result<RefreshToken, TokenStoreError> {
    RefreshTokenRow::from_row(row)
        .map(RefreshToken::from)
        .map_err(|e| TokenStoreError::Storage(format!("failed to decode refresh token row: {e}")))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> TokenStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            if db_err.code().as_deref() == Some("23505") {
                TokenStoreError::Duplicate
            } else {
                TokenStoreError::Storage(format!(
                    "database error in {operation}: {}",
                    db_err.message()
                ))
            }
        }
        sqlx::Error::PoolClosed => {
            TokenStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        other => TokenStoreError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}
