//! Crate-level error type
//!
//! Nothing here is fatal to the connection loop: these errors report misuse
//! of the public surface or configuration problems to the caller.

use crate::broker::SessionError;
use crate::config::ConfigError;
use crate::ledger::LedgerError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeeperError {
    #[error("Network descriptor has no network name")]
    MissingNetworkName,

    #[error("No candidate networks supplied")]
    NoCandidates,

    #[error("Start index {index} out of range for {len} candidate networks")]
    StartIndexOutOfRange { index: usize, len: usize },

    #[error("Broker session is not connected")]
    NotConnected,

    #[error("Manager has not been started")]
    NotStarted,

    #[error("Subscription error: {0}")]
    Subscription(#[from] LedgerError),

    #[error("Broker session error: {0}")]
    Session(#[from] SessionError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl KeeperError {
    /// Whether retrying later, once the session is back, may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, KeeperError::NotConnected | KeeperError::Session(_))
    }
}

/// Result type for manager operations
pub type KeeperResult<T> = Result<T, KeeperError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ledger_error_converts() {
        let error: KeeperError = LedgerError::Full { capacity: 4 }.into();
        assert!(matches!(error, KeeperError::Subscription(_)));
        assert_eq!(
            error.to_string(),
            "Subscription error: Subscription ledger is full (4 slots)"
        );
    }

    #[test]
    fn test_start_index_message() {
        let error = KeeperError::StartIndexOutOfRange { index: 3, len: 2 };
        assert!(error.to_string().contains('3'));
        assert!(error.to_string().contains('2'));
    }

    #[test]
    fn test_transient_classification() {
        assert!(KeeperError::NotConnected.is_transient());
        assert!(KeeperError::Session(SessionError::NotConnected).is_transient());
        assert!(!KeeperError::MissingNetworkName.is_transient());
        assert!(!KeeperError::Subscription(LedgerError::NotFound("t".to_string())).is_transient());
    }
}
