//! Shared error taxonomy for the control plane (C10).
//!
//! Every component in `cribcall-core` returns `Result<_, CribCallError>` at
//! its public boundary. Internal helper errors may exist per-module but are
//! always wrapped into a `CribCallError` variant before crossing a component
//! seam, so callers never have to match on more than one error type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CribCallError {
    #[error("identity store unavailable")]
    IdentityStoreUnavailable,

    #[error("server certificate fingerprint did not match the pinned value")]
    ServerPinMismatch,

    #[error("pairing session expired")]
    PairingExpired,

    #[error("pairing attempts exhausted")]
    PairingAttemptsExhausted,

    #[error("pairing authentication failed")]
    PairingAuthFailed,

    #[error("client certificate required")]
    ClientCertificateRequired,

    #[error("client certificate is not trusted")]
    ClientCertificateUntrusted,

    #[error("frame exceeds maximum size")]
    FrameTooLarge,

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("TLS handshake timed out")]
    HandshakeTimeout,

    #[error("control session idle timeout")]
    IdleTimeout,

    #[error("outbound queue full")]
    Backpressure,

    #[error("subscription expired")]
    SubscriptionExpired,

    #[error("subscription rejected: {0}")]
    SubscriptionRejected(String),

    #[error("delivery failed (transient): {0}")]
    DeliveryFailedTransient(String),

    #[error("delivery failed (permanent): {0}")]
    DeliveryFailedPermanent(String),

    #[error("trust store unavailable: {0}")]
    TrustStoreUnavailable(String),

    #[error("repository unavailable: {0}")]
    RepositoryUnavailable(String),

    #[error("request body too large")]
    BodyTooLarge,

    #[error("malformed request: {0}")]
    BadRequest(String),

    #[error("not found")]
    NotFound,
}

impl CribCallError {
    /// Stable machine-readable error code, used as the `code` field of the
    /// `{error, code}` JSON body required by the transport's propagation
    /// policy.
    pub fn code(&self) -> &'static str {
        match self {
            Self::IdentityStoreUnavailable => "IDENTITY_STORE_UNAVAILABLE",
            Self::ServerPinMismatch => "SERVER_PIN_MISMATCH",
            Self::PairingExpired => "PAIRING_EXPIRED",
            Self::PairingAttemptsExhausted => "PAIRING_ATTEMPTS_EXHAUSTED",
            Self::PairingAuthFailed => "PAIRING_AUTH_FAILED",
            Self::ClientCertificateRequired => "CLIENT_CERTIFICATE_REQUIRED",
            Self::ClientCertificateUntrusted => "CLIENT_CERTIFICATE_UNTRUSTED",
            Self::FrameTooLarge => "FRAME_TOO_LARGE",
            Self::ProtocolError(_) => "PROTOCOL_ERROR",
            Self::HandshakeTimeout => "HANDSHAKE_TIMEOUT",
            Self::IdleTimeout => "IDLE_TIMEOUT",
            Self::Backpressure => "BACKPRESSURE",
            Self::SubscriptionExpired => "SUBSCRIPTION_EXPIRED",
            Self::SubscriptionRejected(_) => "SUBSCRIPTION_REJECTED",
            Self::DeliveryFailedTransient(_) => "DELIVERY_FAILED_TRANSIENT",
            Self::DeliveryFailedPermanent(_) => "DELIVERY_FAILED_PERMANENT",
            Self::TrustStoreUnavailable(_) => "TRUST_STORE_UNAVAILABLE",
            Self::RepositoryUnavailable(_) => "REPOSITORY_UNAVAILABLE",
            Self::BodyTooLarge => "BODY_TOO_LARGE",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::NotFound => "NOT_FOUND",
        }
    }

    /// HTTP status this error maps to when surfaced from a transport handler.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::ClientCertificateRequired => 401,
            Self::ClientCertificateUntrusted => 403,
            Self::PairingExpired => 410,
            Self::BodyTooLarge => 413,
            Self::SubscriptionRejected(_) | Self::BadRequest(_) => 400,
            Self::PairingAuthFailed | Self::PairingAttemptsExhausted => 401,
            Self::NotFound => 404,
            Self::IdentityStoreUnavailable
            | Self::TrustStoreUnavailable(_)
            | Self::RepositoryUnavailable(_) => 503,
            _ => 500,
        }
    }
}
