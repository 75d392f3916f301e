use thiserror::Error;

#[derive(Clone, Debug, Error)]
pub enum SessionError {
    #[error("session start failed during {phase}: {detail}")]
    StartFailed {
        phase: &'static str,
        /// Stable code of the underlying failure.
        cause_code: String,
        detail: String,
    },

    #[error("a session is already active")]
    AlreadyActive,

    #[error("no session is active")]
    NotActive,
}

impl SessionError {
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::StartFailed { .. } => "session/start-failed",
            SessionError::AlreadyActive => "session/already-active",
            SessionError::NotActive => "session/not-active",
        }
    }
}

pub type SessionResult<T> = Result<T, SessionError>;
