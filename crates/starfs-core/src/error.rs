//! Error types for StarFS core

use thiserror::Error;

/// Errors that can occur in StarFS core
#[derive(Debug, Error)]
pub enum StarfsError {
    #[error("file not found")]
    NotFound,

    #[error("insufficient work complete")]
    InsufficientWork,

    #[error("stale token")]
    StaleToken,

    #[error("token already redeemed")]
    ReplayedToken,

    #[error("out of range")]
    OutOfRange,

    #[error("account not found")]
    AccountNotFound,

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("ledger out of sync: net reputation {0}")]
    Desync(i64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Timeout")]
    Timeout,
}

impl StarfsError {
    /// Errors caused by the request itself. These go back to the requester
    /// as an error frame and leave the connection open.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            StarfsError::NotFound
                | StarfsError::InsufficientWork
                | StarfsError::StaleToken
                | StarfsError::ReplayedToken
                | StarfsError::OutOfRange
                | StarfsError::AccountNotFound
                | StarfsError::UnknownCommand(_)
                | StarfsError::Serialization(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_messages() {
        assert_eq!(StarfsError::NotFound.to_string(), "file not found");
        assert_eq!(
            StarfsError::InsufficientWork.to_string(),
            "insufficient work complete"
        );
        assert_eq!(
            StarfsError::UnknownCommand("upload".into()).to_string(),
            "unknown command: upload"
        );
    }

    #[test]
    fn test_client_errors() {
        assert!(StarfsError::OutOfRange.is_client_error());
        assert!(StarfsError::StaleToken.is_client_error());
        assert!(!StarfsError::Timeout.is_client_error());
        assert!(!StarfsError::Transport("closed".into()).is_client_error());
    }
}
