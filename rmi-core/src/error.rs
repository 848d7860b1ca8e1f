//! Error taxonomy shared by every component.
//!
//! Mirrors the kinds enumerated in the protocol spec: transport failures
//! dispose a [`crate::peer::PeerHandler`] and fan out through fault
//! observers, while per-call failures are handed back to the caller that
//! issued the invocation (unless the method is fault-suppressed).

use std::sync::Arc;

/// A structured, reconstructable remote error value.
///
/// Carried in `Return` frames instead of attempting to move a
/// language-specific exception object across the wire (spec's "exception
/// marshalling" redesign note).
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteErrorValue {
    pub kind: String,
    pub message: String,
    pub stack_frames: Vec<String>,
}

impl RemoteErrorValue {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            stack_frames: Vec::new(),
        }
    }

    pub fn with_frames(mut self, frames: Vec<String>) -> Self {
        self.stack_frames = frames;
        self
    }
}

impl std::fmt::Display for RemoteErrorValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

#[derive(Debug, thiserror::Error, Clone)]
pub enum RmiError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("remote handler disposed: {0}")]
    RemoteFailure(String),

    #[error("object not found: {0}")]
    ObjectNotFound(String),

    #[error("no such method: {method} on {object_id}")]
    NoSuchMethod { object_id: String, method: String },

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("not authorized to invoke {method} on {object_id}")]
    Authorization { object_id: String, method: String },

    #[error("argument is not marshalable: {0}")]
    UnmarshalableArgument(String),

    #[error("invocation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("application error: {0}")]
    Application(RemoteErrorValue),

    #[error("invalid wire message: {0}")]
    Protocol(String),

    #[error("name already bound: {0}")]
    NameAlreadyBound(String),

    #[error("reserved name prefix used for explicit publish: {0}")]
    ReservedName(String),
}

impl RmiError {
    /// The type-default substitute used by fault-suppressed methods and by
    /// `remoteExceptionEnabled = false`.
    pub fn is_transport_class(&self) -> bool {
        matches!(
            self,
            RmiError::Transport(_) | RmiError::RemoteFailure(_) | RmiError::Timeout(_)
        )
    }
}

pub type SharedError = Arc<RmiError>;

impl From<std::io::Error> for RmiError {
    fn from(e: std::io::Error) -> Self {
        RmiError::Transport(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn application_error_round_trips_message() {
        let err = RemoteErrorValue::new("IllegalState", "test exception");
        let wrapped = RmiError::Application(err.clone());
        assert!(wrapped.to_string().contains("test exception"));
        assert!(!wrapped.is_transport_class());
    }

    #[test]
    fn transport_errors_are_classified() {
        assert!(RmiError::Transport("eof".into()).is_transport_class());
        assert!(RmiError::Timeout(std::time::Duration::from_secs(1)).is_transport_class());
        assert!(!RmiError::ObjectNotFound("x".into()).is_transport_class());
    }
}
