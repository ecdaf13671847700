//! Engine errors.

use serde::Serialize;
use thiserror::Error;

/// Anything that can go wrong inside the engine.
///
/// Hosts match on [`Error::kind`]; the payloads carry context
/// for logs and test assertions.
#[derive(Debug, Error)]
pub enum Error {
    #[error("internal: {0}")]
    Internal(String),

    #[error("authentication required: {0}")]
    AuthRequired(String),

    #[error("authentication token expired")]
    AuthExpired,

    #[error("client is behind the server replication window")]
    BehindWindow,

    #[error("connection cancelled by disconnect")]
    ConnectionCancelledByDisconnect,

    #[error("table not found: {0}")]
    TableNotFound(String),

    #[error("subscription already exists: {0}")]
    SubscriptionAlreadyExists(String),

    #[error("foreign key violation: {0}")]
    FkViolation(String),

    #[error("shape delivery failed: {0}")]
    ShapeDeliveryError(String),

    /// Returned by database adapters. The engine never inspects
    /// the message, it only classifies and propagates.
    #[error("database: {0}")]
    Database(String),

    #[error("encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Host-visible error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Internal,
    AuthRequired,
    AuthExpired,
    BehindWindow,
    ConnectionCancelledByDisconnect,
    TableNotFound,
    SubscriptionAlreadyExists,
    FkViolation,
    ShapeDeliveryError,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        use Error::*;
        match self {
            Internal(_) | Database(_) | Encoding(_) => ErrorKind::Internal,
            AuthRequired(_) => ErrorKind::AuthRequired,
            AuthExpired => ErrorKind::AuthExpired,
            BehindWindow => ErrorKind::BehindWindow,
            ConnectionCancelledByDisconnect => ErrorKind::ConnectionCancelledByDisconnect,
            TableNotFound(_) => ErrorKind::TableNotFound,
            SubscriptionAlreadyExists(_) => ErrorKind::SubscriptionAlreadyExists,
            FkViolation(_) => ErrorKind::FkViolation,
            ShapeDeliveryError(_) => ErrorKind::ShapeDeliveryError,
        }
    }

    /// Transient errors are safe to retry with backoff.
    pub fn transient(&self) -> bool {
        matches!(self, Error::Database(_) | Error::Internal(_))
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use ErrorKind::*;
        match self {
            Internal => write!(f, "INTERNAL"),
            AuthRequired => write!(f, "AUTH_REQUIRED"),
            AuthExpired => write!(f, "AUTH_EXPIRED"),
            BehindWindow => write!(f, "BEHIND_WINDOW"),
            ConnectionCancelledByDisconnect => write!(f, "CONNECTION_CANCELLED_BY_DISCONNECT"),
            TableNotFound => write!(f, "TABLE_NOT_FOUND"),
            SubscriptionAlreadyExists => write!(f, "SUBSCRIPTION_ALREADY_EXISTS"),
            FkViolation => write!(f, "FK_VIOLATION"),
            ShapeDeliveryError => write!(f, "SHAPE_DELIVERY_ERROR"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_kind_display() {
        assert_eq!(
            Error::ConnectionCancelledByDisconnect.kind().to_string(),
            "CONNECTION_CANCELLED_BY_DISCONNECT"
        );
        assert_eq!(Error::BehindWindow.kind().to_string(), "BEHIND_WINDOW");
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::Database("io".into()).transient());
        assert!(!Error::AuthExpired.transient());
        assert!(!Error::BehindWindow.transient());
    }
}
