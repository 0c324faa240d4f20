//! Error types for the noblock scheduler

use core::fmt;
use std::io;
use std::time::Duration;

use crate::id::FiberId;

/// Result type for scheduler operations
pub type NbResult<T> = Result<T, NbError>;

/// Kind of a timeout, carried by the error a timeout scope raises
///
/// Callers pick the kind so that the code catching the error can tell
/// which deadline fired (a read deadline versus an outer request deadline).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeoutKind(&'static str);

impl TimeoutKind {
    /// Generic "execution expired" timeout
    pub const GENERIC: TimeoutKind = TimeoutKind("execution expired");
    /// Deadline on reading a response
    pub const READ: TimeoutKind = TimeoutKind("read timeout");
    /// Deadline on opening a connection
    pub const OPEN: TimeoutKind = TimeoutKind("open timeout");

    pub const fn new(name: &'static str) -> Self {
        TimeoutKind(name)
    }

    pub const fn name(&self) -> &'static str {
        self.0
    }
}

impl Default for TimeoutKind {
    fn default() -> Self {
        TimeoutKind::GENERIC
    }
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Errors surfaced by the scheduler primitives and adapters
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NbError {
    /// A timeout scope fired while the fiber was suspended inside it
    Timeout { kind: TimeoutKind, after: Duration },

    /// The descriptor was closed or unbound while the fiber waited on it
    HandleClosed { fd: i32 },

    /// A primitive was used outside the fiber that owns the context
    InvalidUsage(&'static str),

    /// Wait mode text other than "read" or "write"
    InvalidWaitMode(String),

    /// Configuration rejected by `validate()`
    InvalidConfig(&'static str),

    /// I/O failure, with the errno when there is one
    Io { kind: io::ErrorKind, code: Option<i32> },

    /// Application-level failure returned by a task
    Task(String),
}

impl NbError {
    pub fn timeout(kind: TimeoutKind, after: Duration) -> Self {
        NbError::Timeout { kind, after }
    }

    pub fn task(msg: impl Into<String>) -> Self {
        NbError::Task(msg.into())
    }

    #[inline]
    pub fn is_timeout(&self) -> bool {
        matches!(self, NbError::Timeout { .. })
    }

    /// Timeout kind if this is a timeout error
    pub fn timeout_kind(&self) -> Option<TimeoutKind> {
        match self {
            NbError::Timeout { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// The OS error code, if this came from a syscall
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            NbError::Io { code, .. } => *code,
            _ => None,
        }
    }
}

impl fmt::Display for NbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NbError::Timeout { kind, after } => write!(f, "{} after {:?}", kind, after),
            NbError::HandleClosed { fd } => write!(f, "descriptor {} closed while waiting", fd),
            NbError::InvalidUsage(msg) => write!(f, "invalid usage: {}", msg),
            NbError::InvalidWaitMode(mode) => write!(f, "invalid wait mode: {:?}", mode),
            NbError::InvalidConfig(msg) => write!(f, "invalid config: {}", msg),
            NbError::Io { kind, code: Some(code) } => {
                write!(f, "i/o error: {} (os error {})", io::Error::from(*kind), code)
            }
            NbError::Io { kind, code: None } => write!(f, "i/o error: {}", io::Error::from(*kind)),
            NbError::Task(msg) => write!(f, "task failed: {}", msg),
        }
    }
}

impl std::error::Error for NbError {}

impl From<io::Error> for NbError {
    fn from(e: io::Error) -> Self {
        NbError::Io {
            kind: e.kind(),
            code: e.raw_os_error(),
        }
    }
}

impl From<io::ErrorKind> for NbError {
    fn from(kind: io::ErrorKind) -> Self {
        NbError::Io { kind, code: None }
    }
}

#[cfg(unix)]
impl From<nix::errno::Errno> for NbError {
    fn from(errno: nix::errno::Errno) -> Self {
        NbError::from(io::Error::from(errno))
    }
}

impl From<NbError> for io::Error {
    fn from(e: NbError) -> Self {
        match e {
            NbError::Io { code: Some(code), .. } => io::Error::from_raw_os_error(code),
            NbError::Io { kind, code: None } => io::Error::from(kind),
            NbError::Timeout { .. } => io::Error::new(io::ErrorKind::TimedOut, e),
            NbError::HandleClosed { .. } => io::Error::new(io::ErrorKind::BrokenPipe, e),
            other => io::Error::new(io::ErrorKind::Other, other),
        }
    }
}

/// What the reactor's error boundary receives when a task ends badly
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskFailure {
    /// The task returned `Err`
    Error { fiber: FiberId, error: NbError },
    /// The task panicked; the payload message when it was a string
    Panic { fiber: FiberId, message: String },
}

impl TaskFailure {
    pub fn fiber(&self) -> FiberId {
        match self {
            TaskFailure::Error { fiber, .. } | TaskFailure::Panic { fiber, .. } => *fiber,
        }
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskFailure::Error { fiber, error } => write!(f, "fiber {}: {}", fiber, error),
            TaskFailure::Panic { fiber, message } => write!(f, "fiber {} panicked: {}", fiber, message),
        }
    }
}

impl std::error::Error for TaskFailure {}
