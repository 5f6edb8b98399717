//! Refresh token configuration.

use chrono::Duration;

use tessera_core::{DomainError, DomainResult};

/// Default refresh token lifetime in days.
const DEFAULT_LIFETIME_DAYS: i64 = 7;
/// Default number of random bytes per token value (256 bits).
const DEFAULT_TOKEN_BYTES: usize = 32;
/// Below this the collision probability stops being negligible.
const MIN_TOKEN_BYTES: usize = 16;

/// Lifetime and entropy of issued refresh tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshTokenConfig {
    pub lifetime: Duration,
    pub token_bytes: usize,
}

impl Default for RefreshTokenConfig {
    fn default() -> Self {
        Self {
            lifetime: Duration::days(DEFAULT_LIFETIME_DAYS),
            token_bytes: DEFAULT_TOKEN_BYTES,
        }
    }
}

impl RefreshTokenConfig {
    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = lifetime;
        self
    }

    pub fn with_token_bytes(mut self, bytes: usize) -> Self {
        self.token_bytes = bytes;
        self
    }

    /// Load configuration from environment variables.
    ///
    /// | Env Var                        | Default |
    /// |--------------------------------|---------|
    /// | `REFRESH_TOKEN_LIFETIME_DAYS`  | `7`     |
    /// | `REFRESH_TOKEN_BYTES`          | `32`    |
    pub fn from_env() -> DomainResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> DomainResult<Self> {
        let mut config = Self::default();

        if let Some(raw) = lookup("REFRESH_TOKEN_LIFETIME_DAYS") {
            let days: i64 = raw.trim().parse().map_err(|e| {
                DomainError::validation(format!("REFRESH_TOKEN_LIFETIME_DAYS: {e}"))
            })?;
            config.lifetime = Duration::try_days(days).ok_or_else(|| {
                DomainError::validation("REFRESH_TOKEN_LIFETIME_DAYS: out of range")
            })?;
        }

        if let Some(raw) = lookup("REFRESH_TOKEN_BYTES") {
            config.token_bytes = raw
                .trim()
                .parse()
                .map_err(|e| DomainError::validation(format!("REFRESH_TOKEN_BYTES: {e}")))?;
        }

        config.validate()?;
        tracing::debug!(
            lifetime_secs = config.lifetime.num_seconds(),
            token_bytes = config.token_bytes,
            "refresh token config loaded"
        );
        Ok(config)
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.lifetime <= Duration::zero() {
            return Err(DomainError::validation("refresh token lifetime must be positive"));
        }
        if self.token_bytes < MIN_TOKEN_BYTES {
            return Err(DomainError::validation(format!(
                "refresh token must use at least {MIN_TOKEN_BYTES} random bytes"
            )));
        }
        Ok(())
    }
}
