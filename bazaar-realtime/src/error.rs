//! Error taxonomy for the synchronization layer.
//!
//! Only [`SyncError::Mutation`] is meant to reach the user. Connection
//! problems are retried and logged inside the channel layer, and aborted
//! writes are reported as outcomes rather than errors.

use std::fmt;

use crate::protocol::ProtocolError;

/// Failure reported by the query/write backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The write was refused (constraint, validation, conflict).
    Rejected(String),
    /// The caller does not own the record.
    Unauthorized(String),
    /// Network or transport failure.
    Transport(String),
    Timeout,
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected(e) => write!(f, "Write rejected: {e}"),
            Self::Unauthorized(e) => write!(f, "Not authorized: {e}"),
            Self::Transport(e) => write!(f, "Transport error: {e}"),
            Self::Timeout => write!(f, "Backend timeout"),
        }
    }
}

impl std::error::Error for BackendError {}

/// Failure talking to the realtime channel provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    Connect(String),
    Protocol(ProtocolError),
    Closed,
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect(e) => write!(f, "Connection failed: {e}"),
            Self::Protocol(e) => write!(f, "Protocol error: {e}"),
            Self::Closed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProviderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Protocol(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ProtocolError> for ProviderError {
    fn from(e: ProtocolError) -> Self {
        ProviderError::Protocol(e)
    }
}

/// Errors surfaced by the synchronization layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// A remote write failed and its optimistic patch was rolled back.
    Mutation { entity_id: String, cause: BackendError },
    /// Fetching a snapshot failed.
    Fetch(BackendError),
    Provider(ProviderError),
    /// A record lacked an id or could not be converted.
    InvalidRecord(String),
    /// The entity is not present in the local collection.
    UnknownEntity(String),
    SessionClosed,
    /// A bug in caller-supplied code, such as a panicking commit.
    Internal(String),
}

impl SyncError {
    /// Whether this error should be shown to the user.
    pub fn is_user_visible(&self) -> bool {
        matches!(self, SyncError::Mutation { .. })
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mutation { entity_id, cause } => {
                write!(f, "Change to {entity_id} was not saved: {cause}")
            }
            Self::Fetch(e) => write!(f, "Snapshot fetch failed: {e}"),
            Self::Provider(e) => write!(f, "Realtime provider error: {e}"),
            Self::InvalidRecord(e) => write!(f, "Invalid record: {e}"),
            Self::UnknownEntity(id) => write!(f, "Unknown entity: {id}"),
            Self::SessionClosed => write!(f, "Session closed"),
            Self::Internal(e) => write!(f, "Internal error: {e}"),
        }
    }
}

impl std::error::Error for SyncError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Mutation { cause, .. } => Some(cause),
            Self::Fetch(e) => Some(e),
            Self::Provider(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ProviderError> for SyncError {
    fn from(e: ProviderError) -> Self {
        SyncError::Provider(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_mutation_failures_are_user_visible() {
        let failure = SyncError::Mutation {
            entity_id: "p1".into(),
            cause: BackendError::Unauthorized("not the author".into()),
        };
        assert!(failure.is_user_visible());
        assert!(!SyncError::Fetch(BackendError::Timeout).is_user_visible());
        assert!(!SyncError::Provider(ProviderError::Closed).is_user_visible());
    }

    #[test]
    fn test_mutation_display_keeps_cause() {
        let failure = SyncError::Mutation {
            entity_id: "p1".into(),
            cause: BackendError::Rejected("body too long".into()),
        };
        let text = failure.to_string();
        assert!(text.contains("p1"));
        assert!(text.contains("body too long"));
        assert!(std::error::Error::source(&failure).is_some());
    }
}
