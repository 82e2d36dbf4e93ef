//! Error types shared by the capability contracts.
//!
//! Homeserver failures are split by what the caller can do about them:
//! [`IntentError::Transport`] is worth retrying, an [`IntentError::Http`]
//! carrying `M_UNKNOWN_TOKEN` or `M_EXCLUSIVE` is an operator problem that no
//! amount of retrying fixes.

use thiserror::Error;

/// `errcode` returned when the access token is not recognised.
pub const ERRCODE_UNKNOWN_TOKEN: &str = "M_UNKNOWN_TOKEN";

/// `errcode` returned when a user ID is outside the appservice namespace or
/// reserved by another appservice.
pub const ERRCODE_EXCLUSIVE: &str = "M_EXCLUSIVE";

/// `errcode` returned when the request is not allowed.
pub const ERRCODE_FORBIDDEN: &str = "M_FORBIDDEN";

/// Errors from calls made through an [`crate::Intent`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntentError {
    /// Request never got an HTTP response (DNS, connect, TLS, timeout).
    #[error("request failed: {0}")]
    Transport(String),

    /// Homeserver answered with an error status.
    #[error("HTTP {status}: {errcode}: {message}")]
    Http {
        /// HTTP status code
        status: u16,
        /// Matrix `errcode`, or `M_UNKNOWN` if the body had none
        errcode: String,
        /// Matrix `error` message
        message: String,
    },

    /// Homeserver answered 2xx with a body we could not decode.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl IntentError {
    /// Matrix error code, if the homeserver sent one.
    pub fn errcode(&self) -> Option<&str> {
        match self {
            Self::Http { errcode, .. } => Some(errcode),
            _ => None,
        }
    }

    /// The access token was rejected.
    pub fn is_unknown_token(&self) -> bool {
        self.errcode() == Some(ERRCODE_UNKNOWN_TOKEN)
    }

    /// The user ID is outside the exclusive namespace.
    pub fn is_exclusive(&self) -> bool {
        self.errcode() == Some(ERRCODE_EXCLUSIVE)
    }

    /// Returns true if this error may succeed on retry.
    ///
    /// Transport failures and 5xx/429 responses are transient. Other 4xx
    /// responses describe a request the server will keep rejecting.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Http { status, .. } => *status >= 500 || *status == 429,
            Self::InvalidResponse(_) => false,
        }
    }
}

/// Errors from the encryption engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// No session is available to decrypt the event.
    #[error("no session {session_id} from {sender_key}")]
    NoSession {
        /// Sender device key
        sender_key: String,
        /// Megolm session ID
        session_id: String,
    },

    /// Payload could not be decrypted or verified.
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    /// Payload could not be encrypted for the room.
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// Session material could not be loaded or saved.
    #[error("store error: {0}")]
    Store(String),

    /// Engine setup failed.
    #[error("initialization failed: {0}")]
    Init(String),
}

/// Errors from switching a double puppet's credentials.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DoublePuppetError {
    /// Token belongs to a different user than requested.
    #[error("access token belongs to {actual}, not {expected}")]
    MismatchedUser {
        /// User ID the caller asked for
        expected: String,
        /// User ID the token authenticates as
        actual: String,
    },

    /// Token could not be verified.
    #[error("failed to verify access token: {0}")]
    Verification(#[from] IntentError),

    /// Double puppeting is not allowed for this user or server.
    #[error("double puppeting not allowed: {0}")]
    NotAllowed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http(status: u16, errcode: &str) -> IntentError {
        IntentError::Http { status, errcode: errcode.to_string(), message: "msg".to_string() }
    }

    #[test]
    fn classifies_errcodes() {
        assert!(http(401, ERRCODE_UNKNOWN_TOKEN).is_unknown_token());
        assert!(http(403, ERRCODE_EXCLUSIVE).is_exclusive());
        assert!(!http(403, ERRCODE_FORBIDDEN).is_exclusive());
        assert!(!IntentError::Transport("refused".to_string()).is_unknown_token());
    }

    #[test]
    fn transient_errors() {
        assert!(IntentError::Transport("refused".to_string()).is_transient());
        assert!(http(502, "M_UNKNOWN").is_transient());
        assert!(http(429, "M_LIMIT_EXCEEDED").is_transient());
        assert!(!http(401, ERRCODE_UNKNOWN_TOKEN).is_transient());
    }

    #[test]
    fn display() {
        assert_eq!(http(401, ERRCODE_UNKNOWN_TOKEN).to_string(), "HTTP 401: M_UNKNOWN_TOKEN: msg");
    }
}
