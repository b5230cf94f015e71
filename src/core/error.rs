use std::fmt;
use thiserror::Error;

/// MySQL error code for `XAER_NOTA: Unknown XID`.
pub const ER_XAER_NOTA: u16 = 1397;

/// SQLSTATE reported together with [`ER_XAER_NOTA`].
pub const SQLSTATE_XAER_NOTA: &str = "XAE04";

/// Why an in-flight query was interrupted on our side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptReason {
    Timeout,
    MaxMemory,
}

impl fmt::Display for InterruptReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterruptReason::Timeout => write!(f, "timeout"),
            InterruptReason::MaxMemory => write!(f, "max memory usage exceeded"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProxyError {
    #[error("Pool '{0}' is closed")]
    PoolClosed(String),

    #[error("Server unavailable: {0}")]
    ServerUnavailable(String),

    #[error("Query execution was interrupted, {0}")]
    QueryInterrupted(InterruptReason),

    #[error("Backend '{0}' not found")]
    BackendNotFound(String),

    #[error("Backend '{0}' already exists")]
    BackendExists(String),

    #[error("XAER_NOTA: Unknown XID '{0}'")]
    XaUnknownXid(String),

    #[error("Duplicate xid '{0}' in recovery journal")]
    DuplicateXid(String),

    #[error("Backend error {code} ({state}): {message}")]
    Server {
        code: u16,
        state: String,
        message: String,
    },

    #[error("Transaction error: {0}")]
    TransactionError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("I/O error: {0}")]
    IoError(String),
}

impl ProxyError {
    /// Builds an error from a backend error packet.
    ///
    /// `1397`/`XAE04` is folded into [`ProxyError::XaUnknownXid`] so the
    /// phase-two retry loop can short-circuit on it.
    pub fn server(code: u16, state: impl Into<String>, message: impl Into<String>) -> Self {
        let state = state.into();
        let message = message.into();
        if code == ER_XAER_NOTA || state == SQLSTATE_XAER_NOTA {
            return ProxyError::XaUnknownXid(message);
        }
        ProxyError::Server {
            code,
            state,
            message,
        }
    }

    pub fn is_unknown_xid(&self) -> bool {
        matches!(self, ProxyError::XaUnknownXid(_))
    }

    /// True for dial and I/O failures, where the session is gone.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, ProxyError::ServerUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;

impl<T> From<std::sync::PoisonError<T>> for ProxyError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for ProxyError {
    fn from(err: serde_json::Error) -> Self {
        Self::IoError(format!("json: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_xid_is_folded() {
        let err = ProxyError::server(1397, "XAE04", "XAER_NOTA: Unknown XID");
        assert!(err.is_unknown_xid());

        let err = ProxyError::server(1064, "42000", "syntax error");
        assert!(!err.is_unknown_xid());
        assert_eq!(
            err.to_string(),
            "Backend error 1064 (42000): syntax error"
        );
    }

    #[test]
    fn test_interrupt_messages() {
        let err = ProxyError::QueryInterrupted(InterruptReason::Timeout);
        assert_eq!(err.to_string(), "Query execution was interrupted, timeout");

        let err = ProxyError::QueryInterrupted(InterruptReason::MaxMemory);
        assert_eq!(
            err.to_string(),
            "Query execution was interrupted, max memory usage exceeded"
        );
    }
}
