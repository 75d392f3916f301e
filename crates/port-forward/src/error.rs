use outpost_ssh_transport::TransportError;
use thiserror::Error;

#[derive(Clone, Debug, Error)]
pub enum ForwardError {
    #[error("port forward failed: {0}")]
    Setup(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ForwardError {
    pub fn code(&self) -> &'static str {
        match self {
            ForwardError::Setup(_) => "port-forward",
            ForwardError::Transport(err) => err.code(),
        }
    }
}

pub type ForwardResult<T> = Result<T, ForwardError>;
