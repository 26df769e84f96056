use shared::domain::SessionId;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ConnectError {
    #[error("authentication rejected: {0}")]
    AuthRejected(String),
    #[error("backend unreachable: {0}")]
    Unreachable(String),
}

#[derive(Debug, Error)]
pub enum NotifierError {
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error("no active connection for session {0}")]
    UnknownSession(SessionId),
    #[error("unread store failure: {0}")]
    Store(#[source] anyhow::Error),
}

impl NotifierError {
    pub fn is_auth_rejected(&self) -> bool {
        matches!(self, NotifierError::Connect(ConnectError::AuthRejected(_)))
    }
}
