//! Refresh token persistence and lifecycle service.
//!
//! - `store`: `RefreshTokenStore` trait + error type
//! - `in_memory`: in-memory implementation (tests/dev)
//! - `postgres`: Postgres-backed implementation (`sqlx`)
//! - `service`: `RefreshTokenService` (create, validate, revoke, rotate)

pub mod in_memory;
pub mod postgres;
pub mod service;
pub mod store;

pub use in_memory::{InMemoryRefreshTokenStore, InsertFailure};
pub use postgres::PostgresRefreshTokenStore;
pub use service::{Clock, MAX_GENERATION_ATTEMPTS, RefreshTokenError, RefreshTokenService};
pub use store::{RefreshTokenStore, TokenStoreError};
