//! Readiness polling backends
//!
//! Level-triggered on every backend: a descriptor that stays ready is
//! reported again on the next poll for as long as its interest is on.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use noblock_core::Interest;

/// One readiness report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollEvent {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
    /// Error or hangup; delivered to both directions so waiters retry and see it
    pub error: bool,
    /// The descriptor is not open (poll(2) `POLLNVAL`)
    pub invalid: bool,
}

/// OS readiness multiplexer
pub trait Poller {
    /// Start polling `fd` for a non-empty interest
    fn add(&mut self, fd: RawFd, interest: Interest) -> io::Result<()>;

    /// Change the interest of a polled descriptor
    fn modify(&mut self, fd: RawFd, interest: Interest) -> io::Result<()>;

    /// Stop polling `fd`; closed or unknown descriptors are not an error
    fn delete(&mut self, fd: RawFd) -> io::Result<()>;

    /// Wait up to `timeout` (forever when `None`) and append ready events.
    /// An interrupted wait returns with no events.
    fn poll(&mut self, events: &mut Vec<PollEvent>, timeout: Option<Duration>) -> io::Result<()>;

    fn name(&self) -> &'static str;
}

/// Milliseconds for epoll_wait/poll, rounding up so short timers are not spun on
pub(crate) fn timeout_ms(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(d) if d.is_zero() => 0,
        Some(d) => {
            let ms = d.as_nanos().div_ceil(1_000_000);
            ms.min(libc::c_int::MAX as u128) as libc::c_int
        }
    }
}

pub mod poll;

cfg_if::cfg_if! {
    if #[cfg(all(any(target_os = "linux", target_os = "android"), not(feature = "force-poll")))] {
        pub mod epoll;
        pub use epoll::EpollPoller as DefaultPoller;
    } else {
        pub use poll::PollPoller as DefaultPoller;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_ms_rounds_up() {
        assert_eq!(timeout_ms(None), -1);
        assert_eq!(timeout_ms(Some(Duration::ZERO)), 0);
        assert_eq!(timeout_ms(Some(Duration::from_micros(10))), 1);
        assert_eq!(timeout_ms(Some(Duration::from_millis(1500))), 1500);
        assert_eq!(timeout_ms(Some(Duration::from_secs(u64::MAX))), libc::c_int::MAX);
    }
}
