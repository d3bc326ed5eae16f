//! services/api/src/broker/error.rs
//!
//! Error taxonomy for the broker client.

use interview_core::ports::PortError;

#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    #[error("not connected to the broker")]
    NotConnected,
    #[error("timed out after {0:?} waiting for the broker connection")]
    ConnectionTimeout(std::time::Duration),
    #[error("publish attempt timed out after {0:?}")]
    PublishTimeout(std::time::Duration),
    #[error("queue {0} was never declared")]
    QueueNotDeclared(String),
    #[error("broker client is shutting down")]
    Shutdown,
    #[error("already closed: not connected to the broker")]
    AlreadyClosed,
    #[error("publish to {queue} gave up after {attempts} attempts")]
    RetriesExhausted { queue: String, attempts: u32 },
    #[error("broker transport error: {0}")]
    Transport(String),
}

pub type BrokerResult<T> = Result<T, BrokerError>;

impl BrokerError {
    /// Fatal errors are propagated to callers; everything else is retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BrokerError::QueueNotDeclared(_)
                | BrokerError::Shutdown
                | BrokerError::AlreadyClosed
                | BrokerError::RetriesExhausted { .. }
        )
    }
}

impl From<lapin::Error> for BrokerError {
    fn from(err: lapin::Error) -> Self {
        BrokerError::Transport(err.to_string())
    }
}

impl From<BrokerError> for PortError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::Shutdown | BrokerError::AlreadyClosed => PortError::Shutdown,
            BrokerError::ConnectionTimeout(_) | BrokerError::PublishTimeout(_) => {
                PortError::Timeout(err.to_string())
            }
            BrokerError::NotConnected
            | BrokerError::RetriesExhausted { .. }
            | BrokerError::Transport(_) => PortError::Unavailable(err.to_string()),
            BrokerError::QueueNotDeclared(_) => PortError::Unexpected(err.to_string()),
        }
    }
}
