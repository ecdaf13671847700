//! Auth token claims.
//!
//! Token issuance and verification live with the server; the engine
//! only reads the claims it needs to bind a user identity.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Deserialize;

use crate::error::Error;

/// Credentials handed to `start`.
#[derive(Debug, Clone, Default)]
pub struct AuthState {
    pub client_id: Option<String>,
    pub token: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TokenClaims {
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

impl TokenClaims {
    /// The user identity a token binds: `sub` wins, `user_id` is the
    /// fallback. A token carrying neither is rejected.
    pub fn user_id(&self) -> Option<&str> {
        self.sub.as_deref().or(self.user_id.as_deref())
    }
}

/// Decode the claims section of a JWT without verifying it.
pub fn decode_claims(token: &str) -> Result<TokenClaims, Error> {
    let mut parts = token.split('.');
    let (Some(_header), Some(payload)) = (parts.next(), parts.next()) else {
        return Err(Error::AuthRequired("malformed token".into()));
    };

    let decoded = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| Error::AuthRequired("malformed token payload".into()))?;
    serde_json::from_slice(&decoded)
        .map_err(|_| Error::AuthRequired("malformed token claims".into()))
}

#[cfg(test)]
pub fn test_token(claims: serde_json::Value) -> String {
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("e30.{}.sig", payload)
}
