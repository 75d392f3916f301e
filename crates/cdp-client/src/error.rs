use thiserror::Error;

/// CDP-layer and page-layer failures, each with a stable boundary code.
#[derive(Clone, Debug, Error)]
pub enum CdpError {
    #[error("cdp transport closed")]
    TransportClosed,

    #[error("cdp {0} timed out")]
    Timeout(String),

    #[error("cdp protocol error in {method}: {message} (code {code})")]
    Protocol {
        method: String,
        code: i64,
        message: String,
    },

    #[error("no page target available")]
    NoTarget,

    #[error("devtools http endpoint error: {0}")]
    Http(String),

    #[error("navigation failed: {0}")]
    NavFailed(String),

    #[error("navigation wait timed out")]
    NavTimeout,

    #[error("evaluation failed: {0}")]
    EvalFailed(String),
}

impl CdpError {
    pub fn code(&self) -> &'static str {
        match self {
            CdpError::TransportClosed => "cdp/transport-closed",
            CdpError::Timeout(_) => "cdp/timeout",
            CdpError::Protocol { .. } => "cdp/protocol",
            CdpError::NoTarget => "cdp/no-target",
            CdpError::Http(_) => "cdp/timeout",
            CdpError::NavFailed(_) => "page/nav-failed",
            CdpError::NavTimeout => "page/nav-timeout",
            CdpError::EvalFailed(_) => "page/eval-failed",
        }
    }
}

pub type CdpResult<T> = Result<T, CdpError>;
