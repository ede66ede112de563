/*!
Error types returned by the bridge.
*/

use std::fmt;

/// The result type used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Which watchdog ceiling terminated an execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LimitKind {
    /// The wall-clock time limit.
    Time,
    /// The heap memory limit.
    Memory,
}

impl LimitKind {
    /// The label used for this limit in metrics and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitKind::Time => "time",
            LimitKind::Memory => "memory",
        }
    }
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An exception raised by guest code, translated to the host.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GuestException {
    /// The error class name (`Error`, `TypeError`, `SyntaxError`, ...), if known.
    pub name: Option<String>,
    /// The exception message.
    pub message: String,
    /// The guest stack trace, if one was captured.
    pub stack: Option<String>,
    /// The script identifier the exception was raised in.
    pub file: Option<String>,
    /// 1-based line number.
    pub line: Option<u32>,
    /// 1-based column number.
    pub column: Option<u32>,
}

impl GuestException {
    /// Create an exception carrying only a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }
}

impl fmt::Display for GuestException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{name}: {}", self.message)?,
            None => f.write_str(&self.message)?,
        }
        match (&self.file, self.line, self.column) {
            (Some(file), Some(line), Some(column)) => write!(f, " at {file}:{line}:{column}"),
            (Some(file), Some(line), None) => write!(f, " at {file}:{line}"),
            (None, Some(line), _) => write!(f, " at line {line}"),
            _ => Ok(()),
        }
    }
}

/// The error type for bridge operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An argument was rejected before touching the engine.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The guest engine rejected the script source.
    #[error("compile error: {0}")]
    Compile(GuestException),

    /// Guest code threw an exception that was not caught.
    #[error("uncaught exception: {0}")]
    Runtime(GuestException),

    /// The watchdog terminated the execution.
    #[error("execution terminated: {0} limit exceeded")]
    ResourceLimitExceeded(LimitKind),

    /// A handle from one context was used with another.
    #[error("handle belongs to a different execution context")]
    ContextMismatch,

    /// The operation is not supported on this type.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// A host callback failed while propagating host exceptions.
    #[error("host callback failed: {0:#}")]
    Host(anyhow::Error),

    /// The context has not been constructed yet.
    #[error("execution context has not been constructed")]
    NotConstructed,

    /// The context has been disposed.
    #[error("execution context has been disposed")]
    Disposed,

    /// The calling thread is already executing inside this context.
    #[error("execution context is already in use by the calling thread")]
    Reentrant,

    /// An engine level failure that is not a guest exception.
    #[error("engine error: {0}")]
    Engine(#[from] rquickjs::Error),
}

impl Error {
    /// Returns true for watchdog terminations, which are never recoverable within the call chain.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::ResourceLimitExceeded(_))
    }

    /// The guest exception carried by compile and runtime errors.
    pub fn guest_exception(&self) -> Option<&GuestException> {
        match self {
            Error::Compile(e) | Error::Runtime(e) => Some(e),
            _ => None,
        }
    }
}
