//! The error taxonomy shared by every fallible operation in this crate.

use std::fmt;

/// Classification of an [`AbiError`], used by callers that need to branch on
/// failure category rather than match on a message string.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    /// Default when no more specific classification applies.
    Unknown,
    /// The call context was cancelled by the caller.
    Canceled,
    /// The call context's deadline was exceeded.
    Timeout,
    /// An invariant was violated or the engine reached an unexpected state.
    Internal,
    /// Bad API usage: `step` without a prior `execute`, handler arity
    /// mismatch, and similar caller errors.
    Invalid,
    /// An allocator failed, or guest memory was exhausted.
    ResourceExhausted,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Unknown => "unknown",
            ErrorKind::Canceled => "canceled",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Internal => "internal",
            ErrorKind::Invalid => "invalid",
            ErrorKind::ResourceExhausted => "resource exhausted",
        };
        f.write_str(name)
    }
}

/// The error type returned by every fallible operation in this crate.
#[derive(thiserror::Error, Debug)]
#[error("{kind}: {message}")]
pub struct AbiError {
    kind: ErrorKind,
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl AbiError {
    /// Builds a new error of the given `kind` with a human-readable `message`.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        AbiError {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Attaches an underlying cause to this error.
    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// The classification of this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Shorthand for [`AbiError::new`] with [`ErrorKind::Internal`].
    pub fn internal(message: impl Into<String>) -> Self {
        AbiError::new(ErrorKind::Internal, message)
    }

    /// Shorthand for [`AbiError::new`] with [`ErrorKind::Invalid`].
    pub fn invalid(message: impl Into<String>) -> Self {
        AbiError::new(ErrorKind::Invalid, message)
    }

    /// Shorthand for [`AbiError::new`] with [`ErrorKind::ResourceExhausted`].
    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        AbiError::new(ErrorKind::ResourceExhausted, message)
    }

    /// Shorthand for [`AbiError::new`] with [`ErrorKind::Canceled`].
    pub fn canceled() -> Self {
        AbiError::new(ErrorKind::Canceled, "context canceled")
    }

    /// Shorthand for [`AbiError::new`] with [`ErrorKind::Timeout`].
    pub fn timeout() -> Self {
        AbiError::new(ErrorKind::Timeout, "context deadline exceeded")
    }

    /// Wraps a caught host-handler panic as an [`ErrorKind::Internal`] error.
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "host handler panicked".to_string()
        };
        AbiError::new(ErrorKind::Internal, format!("host handler panicked: {message}"))
    }
}

/// Convenience alias used throughout the crate.
pub type AbiResult<T> = Result<T, AbiError>;

/// Runs `f`, catching a panic and reclassifying it as an
/// [`ErrorKind::Internal`] [`AbiError`] instead of unwinding across the
/// guest/host boundary.
pub fn catch_handler_panic<T>(
    f: impl FnOnce() -> AbiResult<T> + std::panic::UnwindSafe,
) -> AbiResult<T> {
    match std::panic::catch_unwind(f) {
        Ok(result) => result,
        Err(payload) => Err(AbiError::from_panic(payload)),
    }
}
