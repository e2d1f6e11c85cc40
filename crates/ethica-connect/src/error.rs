use thiserror::Error;

/// Failure reported by a remote source for a single call.
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    #[error("network error: {0}")]
    Network(String),
    #[error("remote call timed out after {0} ms")]
    Timeout(u64),
    #[error("remote returned status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("remote rejected credentials (status {status})")]
    Auth { status: u16 },
    #[error("remote rejected request: {0}")]
    Validation(String),
    #[error("undecodable remote payload: {0}")]
    Decode(String),
}

impl RemoteError {
    /// Network failures, timeouts and 5xx/408/429 responses are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::Network(_) | RemoteError::Timeout(_) => true,
            RemoteError::Status { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            RemoteError::Auth { .. } | RemoteError::Validation(_) | RemoteError::Decode(_) => {
                false
            }
        }
    }

    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 | 403 => RemoteError::Auth { status },
            400 | 404 | 405 | 409 | 422 => RemoteError::Validation(format!("{status}: {message}")),
            _ => RemoteError::Status { status, message },
        }
    }
}

/// A raw record that cannot be turned into a canonical record at all.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransformError {
    #[error("raw record is not an object (found {0})")]
    NotAnObject(&'static str),
    #[error("raw record has no identifier (looked for {0})")]
    MissingId(String),
}

/// Push channel failures. Logged and retried, never surfaced to query callers.
#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    #[error("push channel connect failed: {0}")]
    Connect(String),
    #[error("push channel disconnected: {0}")]
    Disconnected(String),
    #[error("malformed push message: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Error)]
pub enum ConnectorError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("remote unavailable after {attempts} attempt(s): {last_error}")]
    RemoteUnavailable { attempts: u32, last_error: RemoteError },
    #[error("remote rejected call: {0}")]
    Rejected(RemoteError),
    #[error("unsupported query shape: {0}")]
    UnsupportedQuery(String),
    #[error("connector {0} is not connected")]
    NotConnected(String),
}

impl ConnectorError {
    pub fn unsupported(msg: impl Into<String>) -> Self {
        ConnectorError::UnsupportedQuery(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        ConnectorError::Configuration(msg.into())
    }
}

pub type Result<T, E = ConnectorError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(RemoteError::from_status(503, "busy").is_transient());
        assert!(RemoteError::from_status(429, "slow down").is_transient());
        assert!(!RemoteError::from_status(401, "").is_transient());
        assert!(matches!(
            RemoteError::from_status(403, ""),
            RemoteError::Auth { status: 403 }
        ));
        assert!(matches!(
            RemoteError::from_status(422, "bad filter"),
            RemoteError::Validation(_)
        ));
        assert!(RemoteError::Timeout(20).is_transient());
        assert!(!RemoteError::Decode("eof".into()).is_transient());
    }
}
