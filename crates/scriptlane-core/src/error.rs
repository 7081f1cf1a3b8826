//! Error types for scriptlane-core.
//!
//! Every failure the host can observe, whether it started as a guest syntax
//! error, a rejected promise or a failing host operation, ends up as one
//! [`Error`]. The guest-facing classification lives in [`crate::convert`].

use std::fmt;

use thiserror::Error;

use crate::session::TransactionId;

/// Result type for scriptlane-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Category of a script execution failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The guest engine rejected the source at evaluation time.
    Syntax,
    /// A guest exception, or a rejection with a stack-bearing value.
    Guest,
    /// Failure raised by host-side binding code or a bridged operation.
    Host,
    /// A promise was rejected with a value that carries no error information.
    Unknown,
    /// Classifying another failure failed.
    Conversion,
    /// The session closed before the script settled.
    SessionClosed,
    /// The lane pool is disposed, or a lane thread or guest context could not
    /// be created.
    Lane,
    /// Invalid configuration or no host runtime to drive operations on.
    Config,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Syntax => "syntax error",
            Self::Guest => "guest exception",
            Self::Host => "host failure",
            Self::Unknown => "unknown error",
            Self::Conversion => "conversion failure",
            Self::SessionClosed => "session closed",
            Self::Lane => "lane failure",
            Self::Config => "configuration error",
        };
        f.write_str(name)
    }
}

/// Error produced by a script execution.
///
/// Carries enough context to correlate a failure with the execution that
/// produced it: the session transaction id and whatever the script printed
/// before failing.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
    script_output: Option<String>,
    transaction_id: Option<TransactionId>,
    guest_stack: Option<String>,
    operation: Option<String>,
}

impl Error {
    /// Create an error of the given kind with no session context.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            script_output: None,
            transaction_id: None,
            guest_stack: None,
            operation: None,
        }
    }

    pub(crate) fn lane(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Lane, message)
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message)
    }

    /// Attach the originating session and its captured output.
    pub fn with_session(mut self, transaction_id: TransactionId, script_output: String) -> Self {
        self.transaction_id = Some(transaction_id);
        self.script_output = Some(script_output);
        self
    }

    /// Attach guest stack text.
    pub fn with_guest_stack(mut self, stack: Option<String>) -> Self {
        self.guest_stack = stack.filter(|s| !s.trim().is_empty());
        self
    }

    pub(crate) fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Attach the description of the bridged operation that failed.
    pub fn with_operation(mut self, description: impl Into<String>) -> Self {
        self.operation = Some(description.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Console output the script produced before failing, if captured.
    pub fn script_output(&self) -> Option<&str> {
        self.script_output.as_deref()
    }

    pub fn transaction_id(&self) -> Option<TransactionId> {
        self.transaction_id
    }

    /// Guest stack trace, or the call-site snapshot of a failed host operation.
    pub fn guest_stack(&self) -> Option<&str> {
        self.guest_stack.as_deref()
    }

    pub fn operation(&self) -> Option<&str> {
        self.operation.as_deref()
    }
}
