//! Wait modes, reactor interest and the suspension state machine

use core::fmt;
use core::str::FromStr;

use crate::error::NbError;

/// Which readiness a fiber waits for on a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaitMode {
    Read,
    Write,
}

impl WaitMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            WaitMode::Read => "read",
            WaitMode::Write => "write",
        }
    }
}

impl FromStr for WaitMode {
    type Err = NbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(WaitMode::Read),
            "write" => Ok(WaitMode::Write),
            other => Err(NbError::InvalidWaitMode(other.to_string())),
        }
    }
}

impl fmt::Display for WaitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Readiness interest registered with the reactor for one descriptor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Interest {
    pub read: bool,
    pub write: bool,
}

impl Interest {
    pub const NONE: Interest = Interest { read: false, write: false };
    pub const READ: Interest = Interest { read: true, write: false };
    pub const WRITE: Interest = Interest { read: false, write: true };

    #[inline]
    pub fn is_empty(self) -> bool {
        !self.read && !self.write
    }

    #[inline]
    pub fn contains(self, mode: WaitMode) -> bool {
        match mode {
            WaitMode::Read => self.read,
            WaitMode::Write => self.write,
        }
    }

    /// Copy with `mode` switched on or off
    #[inline]
    pub fn with(mut self, mode: WaitMode, enabled: bool) -> Interest {
        match mode {
            WaitMode::Read => self.read = enabled,
            WaitMode::Write => self.write = enabled,
        }
        self
    }
}

/// Lifecycle of one suspended primitive call
///
/// ```text
/// Idle ──arm──► Armed ──resume──► Resumed
///                 │
///                 └──timeout───► Canceled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendState {
    /// Not yet polled
    Idle,
    /// Registered and waiting for exactly one resume
    Armed,
    /// Resumed by readiness, timer or deferred yield
    Resumed,
    /// Interrupted by an enclosing timeout scope
    Canceled,
}

impl SuspendState {
    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(self, next: SuspendState) -> bool {
        matches!(
            (self, next),
            (SuspendState::Idle, SuspendState::Armed)
                | (SuspendState::Armed, SuspendState::Resumed)
                | (SuspendState::Armed, SuspendState::Canceled)
        )
    }

    #[inline]
    pub fn is_finished(self) -> bool {
        matches!(self, SuspendState::Resumed | SuspendState::Canceled)
    }
}
