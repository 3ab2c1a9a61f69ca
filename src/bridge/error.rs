use thiserror::Error;
use tonic::{Code, Status};

use crate::bridge::call::CallId;

/// A participant broke the credit or cardinality contract of a call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Violation {
    /// The transport pushed a message it had no credit for.
    #[error("transport delivered a message without credit")]
    CreditExceeded,

    /// A second message arrived while one was already held without demand.
    #[error("a second message arrived while one was pending without demand")]
    PendingOverflow,

    /// A single-cardinality direction completed without a message.
    #[error("expected exactly one message, received none")]
    MissingItem,

    /// A single-cardinality direction carried more than one message.
    #[error("expected exactly one message, received more than one")]
    ExtraItem,
}

/// Errors that end a call, in either direction.
#[derive(Debug, Clone, Error)]
pub enum CallError {
    /// The credit or cardinality contract was broken.
    #[error("protocol violation: {0}")]
    ProtocolViolation(#[from] Violation),

    /// The transport reported a failure (network error, peer error status).
    #[error("transport failure: {}", .0.message())]
    Transport(Status),

    /// The application code supplying a sequence failed.
    #[error("business logic failure: {}", .0.message())]
    BusinessLogic(Status),

    /// Either side cancelled before natural completion.
    #[error("call cancelled: {0}")]
    Cancelled(String),

    /// An inbound frame could not be decoded.
    #[error("failed to decode message: {0}")]
    Decode(String),
}

impl CallError {
    /// Classify a status reported by the transport.
    pub fn from_transport(status: Status) -> Self {
        if status.code() == Code::Cancelled {
            Self::Cancelled(status.message().to_string())
        } else {
            Self::Transport(status)
        }
    }

    /// Whether this error is a cancellation rather than a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// The status a peer observes for this error.
    pub fn to_status(&self) -> Status {
        match self {
            Self::ProtocolViolation(violation) => Status::internal(violation.to_string()),
            Self::Transport(status) | Self::BusinessLogic(status) => status.clone(),
            Self::Cancelled(reason) => Status::cancelled(reason.clone()),
            Self::Decode(message) => Status::internal(format!("decode error: {message}")),
        }
    }

    /// The status code a peer observes for this error.
    pub fn code(&self) -> Code {
        match self {
            Self::Transport(status) | Self::BusinessLogic(status) => status.code(),
            Self::Cancelled(_) => Code::Cancelled,
            Self::ProtocolViolation(_) | Self::Decode(_) => Code::Internal,
        }
    }
}

impl From<CallError> for Status {
    fn from(error: CallError) -> Self {
        error.to_status()
    }
}

impl From<prost::DecodeError> for CallError {
    fn from(error: prost::DecodeError) -> Self {
        Self::Decode(error.to_string())
    }
}

/// Errors from registering handlers or dispatching calls.
#[derive(Debug, Error)]
pub enum RouterError {
    /// A handler is already registered for this method path.
    #[error("handler already registered for '{0}'")]
    DuplicateHandler(String),

    /// No handler registered for the method path.
    #[error("no handler registered for '{0}'")]
    NoHandler(String),

    /// A call with this id is already tracked.
    #[error("call {0} is already active")]
    CallAlreadyActive(CallId),

    /// The router is at its configured call limit.
    #[error("too many active calls (limit {0})")]
    TooManyCalls(usize),
}

impl RouterError {
    /// The status reported to the caller of a rejected call.
    pub fn to_status(&self) -> Status {
        match self {
            RouterError::NoHandler(path) => {
                Status::unimplemented(format!("method '{path}' is not implemented"))
            }
            RouterError::TooManyCalls(_) => Status::resource_exhausted(self.to_string()),
            RouterError::DuplicateHandler(_) | RouterError::CallAlreadyActive(_) => {
                Status::internal(self.to_string())
            }
        }
    }
}

impl From<RouterError> for Status {
    fn from(error: RouterError) -> Self {
        error.to_status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelled_status_is_classified_as_cancellation() {
        let error = CallError::from_transport(Status::cancelled("peer went away"));
        assert!(error.is_cancellation());
        assert_eq!(error.code(), Code::Cancelled);
    }

    #[test]
    fn test_other_status_is_transport_failure() {
        let error = CallError::from_transport(Status::unavailable("connection reset"));
        assert!(matches!(error, CallError::Transport(ref s) if s.code() == Code::Unavailable));
    }

    #[test]
    fn test_violation_maps_to_internal() {
        let status = CallError::from(Violation::ExtraItem).to_status();
        assert_eq!(status.code(), Code::Internal);
        assert!(status.message().contains("more than one"));
    }

    #[test]
    fn test_no_handler_maps_to_unimplemented() {
        let status = Status::from(RouterError::NoHandler("a.B/C".to_string()));
        assert_eq!(status.code(), Code::Unimplemented);
    }
}
