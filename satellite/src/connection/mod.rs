//! Connection management.

pub mod auth;
pub mod backoff;
pub mod controller;

pub use auth::{decode_claims, AuthState, TokenClaims};
pub use backoff::Backoff;
pub use controller::ConnectionController;
