// ===============================
// src/error.rs
// ===============================
use thiserror::Error;

/// One error taxonomy for everything that talks to an exchange.
///
/// The split that matters operationally is `is_transient()`: transient
/// errors clear up on their own (retry / wait), the rest need an operator.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Network-level failure: refused, reset, DNS, timeout.
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),

    /// Well-formed error object reported by the exchange itself.
    #[error("exchange error [{code}]: {message}")]
    Exchange { code: String, message: String },

    /// Response or stream frame did not match the documented shape.
    #[error("protocol: {0}")]
    Protocol(String),

    /// Request budget exhausted (HTTP 429 / "Too Many Requests").
    #[error("rate limited")]
    RateLimit,

    /// HTTP 403 / "Forbidden": key or subscription is unusable until an
    /// operator fixes it. Never retried automatically.
    #[error("authorization rejected")]
    Authorization,

    /// Request signing failed (bad key material).
    #[error("crypto: {0}")]
    Crypto(String),
}

impl ApiError {
    /// True for errors that are expected to clear up without intervention.
    pub fn is_transient(&self) -> bool {
        matches!(self, ApiError::Transport(_) | ApiError::RateLimit)
    }

    pub fn exchange(code: impl Into<String>, message: impl Into<String>) -> Self {
        ApiError::Exchange { code: code.into(), message: message.into() }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        ApiError::Protocol(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_split() {
        assert!(ApiError::RateLimit.is_transient());
        assert!(!ApiError::Authorization.is_transient());
        assert!(!ApiError::exchange("-1021", "timestamp out of recvWindow").is_transient());
        assert!(!ApiError::Crypto("empty secret".into()).is_transient());
    }

    #[test]
    fn display_carries_code_and_message() {
        let e = ApiError::exchange("HTTPError", "Invalid orderID");
        assert_eq!(e.to_string(), "exchange error [HTTPError]: Invalid orderID");
    }
}
