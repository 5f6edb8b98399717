//! `tessera-auth`: refresh-token domain model (pure, no storage).
//!
//! This crate is intentionally decoupled from HTTP and storage; the store and
//! the service that drives it live in `tessera-infra`.

pub mod config;
pub mod refresh_token;
pub mod token;

pub use config::RefreshTokenConfig;
pub use refresh_token::RefreshToken;
pub use token::generate_token_value;
