//! Timeout scopes
//!
//! Each fiber keeps a stack of active scopes ordered by creation. A scope
//! owns its deadline timer and the cancelable registrations of every
//! primitive suspended inside it. Cancelling a scope is idempotent and
//! total: timer, registrations, and (through the fiber's stack) every scope
//! created after it.

use std::cell::{Cell, RefCell};
use std::rc::Weak;
use std::time::Duration;

use noblock_core::{ktrace, ScopeId, TimeoutKind, WaitMode, WaiterId};

use crate::io_handle::IoHandle;
use crate::reactor::{Reactor, TimerHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeStatus {
    Active,
    Canceled,
}

/// Handle for removing one registration from its scope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RegistrationId(u64);

/// A suspended operation that a firing scope must cancel
pub(crate) enum Registration {
    /// Evict the waiter from the descriptor's queue
    IoWait {
        handle: Weak<IoHandle>,
        mode: WaitMode,
        waiter: WaiterId,
    },
    /// Cancel the sleep's timer
    SleepTimer(TimerHandle),
    /// Disarm the pending deferred resume
    Yield(std::rc::Rc<Cell<bool>>),
}

impl Registration {
    fn cancel(self, reactor: &dyn Reactor) {
        match self {
            Registration::IoWait { handle, mode, waiter } => {
                if let Some(handle) = handle.upgrade() {
                    handle.remove_waiter(mode, waiter);
                }
            }
            Registration::SleepTimer(timer) => {
                reactor.cancel_timer(timer);
            }
            Registration::Yield(armed) => armed.set(false),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Registration::IoWait { mode: WaitMode::Read, .. } => "io-read",
            Registration::IoWait { mode: WaitMode::Write, .. } => "io-write",
            Registration::SleepTimer(_) => "sleep-timer",
            Registration::Yield(_) => "yield",
        }
    }
}

pub struct TimeoutScope {
    id: ScopeId,
    kind: TimeoutKind,
    duration: Duration,
    timer: Cell<Option<TimerHandle>>,
    status: Cell<ScopeStatus>,
    registrations: RefCell<Vec<(RegistrationId, Registration)>>,
    next_registration: Cell<u64>,
}

impl TimeoutScope {
    pub(crate) fn new(id: ScopeId, kind: TimeoutKind, duration: Duration) -> Self {
        Self {
            id,
            kind,
            duration,
            timer: Cell::new(None),
            status: Cell::new(ScopeStatus::Active),
            registrations: RefCell::new(Vec::new()),
            next_registration: Cell::new(0),
        }
    }

    pub fn id(&self) -> ScopeId {
        self.id
    }

    pub fn kind(&self) -> TimeoutKind {
        self.kind
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn status(&self) -> ScopeStatus {
        self.status.get()
    }

    pub fn registration_count(&self) -> usize {
        self.registrations.borrow().len()
    }

    pub(crate) fn set_timer(&self, timer: TimerHandle) {
        self.timer.set(Some(timer));
    }

    pub(crate) fn register(&self, registration: Registration) -> RegistrationId {
        let id = RegistrationId(self.next_registration.get());
        self.next_registration.set(id.0 + 1);
        self.registrations.borrow_mut().push((id, registration));
        id
    }

    /// Remove a registration that completed on its own
    pub(crate) fn deregister(&self, id: RegistrationId) -> bool {
        let mut regs = self.registrations.borrow_mut();
        match regs.iter().position(|(rid, _)| *rid == id) {
            Some(pos) => {
                regs.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Cancel the timer and every registration. Later calls do nothing.
    pub(crate) fn cancel(&self, reactor: &dyn Reactor) {
        if self.status.replace(ScopeStatus::Canceled) == ScopeStatus::Canceled {
            return;
        }
        if let Some(timer) = self.timer.take() {
            reactor.cancel_timer(timer);
        }
        let regs = std::mem::take(&mut *self.registrations.borrow_mut());
        for (_, reg) in regs {
            ktrace!("scope {} cancels {}", self.id, reg.label());
            reg.cancel(reactor);
        }
    }
}

impl std::fmt::Debug for TimeoutScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutScope")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("duration", &self.duration)
            .field("status", &self.status.get())
            .field("registrations", &self.registrations.borrow().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::manual::ManualReactor;
    use std::rc::Rc;

    #[test]
    fn test_cancel_is_total_and_idempotent() {
        let reactor = ManualReactor::new();
        let scope = TimeoutScope::new(ScopeId::from(1), TimeoutKind::GENERIC, Duration::from_secs(1));

        let timer = reactor.add_timer(Duration::from_secs(1), Box::new(|| {}));
        scope.set_timer(timer);
        let sleep = reactor.add_timer(Duration::from_secs(5), Box::new(|| {}));
        scope.register(Registration::SleepTimer(sleep));
        let armed = Rc::new(Cell::new(true));
        scope.register(Registration::Yield(armed.clone()));
        assert_eq!(reactor.pending_timers(), 2);

        scope.cancel(&*reactor);
        assert_eq!(scope.status(), ScopeStatus::Canceled);
        assert_eq!(reactor.pending_timers(), 0);
        assert!(!armed.get());
        assert_eq!(scope.registration_count(), 0);

        scope.cancel(&*reactor);
        assert_eq!(scope.status(), ScopeStatus::Canceled);
    }

    #[test]
    fn test_deregister_removes_only_target() {
        let scope = TimeoutScope::new(ScopeId::from(2), TimeoutKind::READ, Duration::from_millis(5));
        let a = scope.register(Registration::Yield(Rc::new(Cell::new(true))));
        let b = scope.register(Registration::Yield(Rc::new(Cell::new(true))));
        assert!(scope.deregister(a));
        assert!(!scope.deregister(a));
        assert_eq!(scope.registration_count(), 1);
        assert!(scope.deregister(b));
    }
}
