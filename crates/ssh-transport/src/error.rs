use thiserror::Error;

/// Errors surfaced by the transport layer. Each variant carries the stable
/// code reported at the API boundary via [`TransportError::code`].
#[derive(Clone, Debug, Error)]
pub enum TransportError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("encrypted private key requires a passphrase")]
    EncryptedKeyNeedsPassphrase,

    #[error("transport is not connected")]
    NotConnected,

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("{0} timed out")]
    Timeout(String),

    #[error("remote command exited with {exit_code}: {stderr}")]
    Exec { exit_code: i32, stderr: String },
}

impl TransportError {
    pub fn code(&self) -> &'static str {
        match self {
            TransportError::Auth(_) => "auth",
            TransportError::EncryptedKeyNeedsPassphrase => "auth/encrypted-key-needs-passphrase",
            TransportError::NotConnected => "transport/not-connected",
            TransportError::Connection(_) => "connection",
            TransportError::Timeout(_) => "timeout",
            TransportError::Exec { .. } => "exec",
        }
    }
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Map an error bubbling out of libssh2 onto the stable categories:
/// authentication-related text becomes `auth`, timeouts become `timeout`,
/// everything else is `connection`. The original message is preserved.
pub fn classify(detail: impl Into<String>) -> TransportError {
    let detail = detail.into();
    let lowered = detail.to_ascii_lowercase();
    if lowered.contains("auth")
        || lowered.contains("username")
        || lowered.contains("password")
        || lowered.contains("publickey")
    {
        TransportError::Auth(detail)
    } else if lowered.contains("timed out") || lowered.contains("timeout") {
        TransportError::Timeout(detail)
    } else {
        TransportError::Connection(detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_auth_text() {
        let err = classify("Unable to authenticate with publickey");
        assert!(matches!(err, TransportError::Auth(_)));
        assert_eq!(err.code(), "auth");
    }

    #[test]
    fn classifies_timeout_text() {
        let err = classify("handshake timed out after 10s");
        assert!(matches!(err, TransportError::Timeout(_)));
        assert_eq!(err.code(), "timeout");
    }

    #[test]
    fn everything_else_is_connection() {
        let err = classify("connection reset by peer");
        assert!(matches!(err, TransportError::Connection(_)));
        assert_eq!(err.code(), "connection");
    }

    #[test]
    fn detail_is_preserved() {
        match classify("connection reset by peer") {
            TransportError::Connection(detail) => assert_eq!(detail, "connection reset by peer"),
            other => panic!("unexpected classification: {other:?}"),
        }
    }
}
