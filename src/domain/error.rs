use std::{sync::Arc, time::Duration};

use thiserror::Error;

/// Common error types for the dispatch system
#[derive(Error, Debug, Clone)]
pub enum DispatchError {
    /// Could not reach a peer (transient, retried with backoff)
    #[error("connection failed: {0}")]
    Connection(String),

    /// Framing or wire protocol violation (fatal to one request only)
    #[error("protocol error: {0}")]
    Protocol(String),

    /// No reply within the caller's timeout
    #[error("timed out after {timeout:?} waiting for {operation}")]
    Timeout { operation: String, timeout: Duration },

    /// A reply arrived that is not a reply message
    #[error("invalid reply: {0}")]
    InvalidReply(String),

    /// The remote service reported a failure
    #[error("remote failure ({state}): {errmsg}")]
    RemoteFailure { state: String, errmsg: String, backtrace: String },

    /// A remote failure rehydrated into a registered local error type
    #[error("{name}: {error}")]
    Forwarded { name: String, error: Arc<dyn std::error::Error + Send + Sync> },

    /// Generic RPC failure
    #[error("rpc error: {0}")]
    Rpc(String),

    /// Job id was never registered with the dispatcher
    #[error("unknown job: {0}")]
    UnknownJob(String),

    /// Bus session/connection errors
    #[error("bus error: {0}")]
    Bus(String),

    /// Command execution errors
    #[error("execution error: {0}")]
    Execution(String),

    /// Validation errors
    #[error("validation error: {0}")]
    Validation(String),

    /// Serialization/deserialization errors
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration related errors
    #[error("configuration error: {0}")]
    Configuration(String),

    /// File system related errors
    #[error("filesystem error: {0}")]
    FileSystem(String),

    /// Actor spawn errors
    #[error("spawn error: {0}")]
    Spawn(String),

    /// Generic errors with context
    #[error("{0}")]
    Generic(String)
}

impl DispatchError {
    /// Whether the failure is transient and worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, DispatchError::Connection(_))
    }

    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        DispatchError::Timeout { operation: operation.into(), timeout }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, DispatchError::Timeout { .. })
    }
}

/// Convert from anyhow::Error
impl From<anyhow::Error> for DispatchError {
    fn from(err: anyhow::Error) -> Self {
        DispatchError::Generic(err.to_string())
    }
}

/// Convert from std::io::Error
impl From<std::io::Error> for DispatchError {
    fn from(err: std::io::Error) -> Self {
        DispatchError::FileSystem(err.to_string())
    }
}

/// Convert from serde_yaml::Error
impl From<serde_yaml::Error> for DispatchError {
    fn from(err: serde_yaml::Error) -> Self {
        DispatchError::Serialization(err.to_string())
    }
}

/// Convert from serde_json::Error
impl From<serde_json::Error> for DispatchError {
    fn from(err: serde_json::Error) -> Self {
        DispatchError::Serialization(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for DispatchError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        DispatchError::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for DispatchError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        DispatchError::Serialization(err.to_string())
    }
}

impl From<base64::DecodeError> for DispatchError {
    fn from(err: base64::DecodeError) -> Self {
        DispatchError::Protocol(err.to_string())
    }
}

/// Convert from ractor::SpawnErr
impl From<ractor::SpawnErr> for DispatchError {
    fn from(err: ractor::SpawnErr) -> Self {
        DispatchError::Spawn(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_connection_failures_are_retryable() {
        assert!(DispatchError::Connection("refused".into()).is_retryable());
        assert!(!DispatchError::Protocol("short read".into()).is_retryable());
        assert!(!DispatchError::timeout("reply", Duration::from_secs(1)).is_retryable());
    }

    #[test]
    fn test_timeout_message_names_operation() {
        let err = DispatchError::timeout("reply from echo", Duration::from_millis(250));
        assert!(err.is_timeout());
        assert!(err.to_string().contains("reply from echo"));
    }
}
