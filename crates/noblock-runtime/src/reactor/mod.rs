//! Reactor contract and the single-threaded event loop
//!
//! The scheduler never polls for readiness itself. It talks to a
//! [`Reactor`]: watch a descriptor, toggle read/write interest, arm
//! one-shot timers, queue next-tick callbacks. [`EventLoop`] is the
//! concrete implementation (epoll on Linux, poll(2) elsewhere).
//!
//! ```text
//!   ┌──────────── EventLoop::turn ────────────┐
//!   │ 1. poll readiness (0 if ticks pending)  │
//!   │ 2. drain remote callbacks               │
//!   │ 3. dispatch readiness to watchers       │
//!   │ 4. fire expired timers (deadline order) │
//!   │ 5. run ticks queued before this phase   │
//!   └─────────────────────────────────────────┘
//! ```
//!
//! Readiness is dispatched before timers so a resume queued by a ready
//! descriptor is ahead of a timeout fired in the same pass.

pub mod timer;
pub mod poller;
pub mod waker;
pub mod remote;
pub mod event_loop;

#[cfg(test)]
pub(crate) mod manual;

use std::io;
use std::os::unix::io::RawFd;
use std::rc::Weak;
use std::time::Duration;

use noblock_core::{TaskFailure, WaitMode};

pub use event_loop::{EventLoop, LoopStats};
pub use remote::RemoteHandle;
pub use timer::{TimerHandle, TimerHeap};

/// Zero-argument callback run on the loop thread
pub type Callback = Box<dyn FnOnce()>;

/// Receiver of readiness notifications for one descriptor
pub trait Watcher {
    /// The descriptor is readable (or errored) and read interest is on
    fn on_readable(&self);

    /// The descriptor is writable (or errored) and write interest is on
    fn on_writable(&self);

    /// The descriptor was closed or unbound; the watcher is already forgotten
    fn on_closed(&self);
}

/// What the scheduler needs from an event reactor
///
/// All methods are called from the loop thread. Callbacks must be invoked
/// with no internal borrows held: they re-enter the reactor freely.
pub trait Reactor {
    /// True while the loop is running
    fn is_running(&self) -> bool;

    /// Start tracking `fd` with no interest. Fails if it is already watched.
    fn watch(&self, fd: RawFd, watcher: Weak<dyn Watcher>) -> io::Result<()>;

    /// Turn readiness notification for one mode on or off
    fn set_interest(&self, fd: RawFd, mode: WaitMode, enabled: bool) -> io::Result<()>;

    /// Stop tracking `fd` without notifying its watcher
    fn detach(&self, fd: RawFd);

    /// Stop tracking `fd` and tell its watcher the descriptor is gone
    fn unbind(&self, fd: RawFd);

    /// One-shot timer
    fn add_timer(&self, after: Duration, callback: Callback) -> TimerHandle;

    /// Cancel a timer; false if it already fired or was cancelled
    fn cancel_timer(&self, handle: TimerHandle) -> bool;

    /// Run `callback` on the next pass
    fn next_tick(&self, callback: Callback);

    /// Run `callback` once when the loop stops
    fn add_shutdown_hook(&self, callback: Callback);

    /// Top-level error boundary for failed tasks
    fn report_error(&self, failure: TaskFailure);
}
