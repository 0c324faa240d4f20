//! Per-descriptor readiness handle
//!
//! One handle per watched descriptor, shared by every fiber waiting on it.
//! Waiters queue per mode in arrival order; each readiness callback
//! releases exactly one of them through the deferred queue. The handle is
//! detached from the reactor the moment both queues are empty, so a later
//! `wait` on the same descriptor creates a fresh one.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};

use noblock_core::{kdebug, ktrace, Interest, NbError, SuspendToken, WaitMode, WaiterId};

use crate::fiber::{Fiber, Wakeup};
use crate::reactor::Watcher;
use crate::scheduler::SchedulerInner;

pub(crate) struct Waiter {
    pub(crate) id: WaiterId,
    pub(crate) fiber: Rc<Fiber>,
    pub(crate) token: SuspendToken,
}

pub struct IoHandle {
    fd: RawFd,
    sched: Weak<SchedulerInner>,
    readers: RefCell<VecDeque<Waiter>>,
    writers: RefCell<VecDeque<Waiter>>,
    interest: Cell<Interest>,
    detached: Cell<bool>,
}

impl IoHandle {
    pub(crate) fn new(fd: RawFd, sched: Weak<SchedulerInner>) -> Self {
        Self {
            fd,
            sched,
            readers: RefCell::new(VecDeque::new()),
            writers: RefCell::new(VecDeque::new()),
            interest: Cell::new(Interest::NONE),
            detached: Cell::new(false),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn waiters(&self, mode: WaitMode) -> usize {
        self.queue(mode).borrow().len()
    }

    pub fn interest(&self) -> Interest {
        self.interest.get()
    }

    pub fn is_detached(&self) -> bool {
        self.detached.get()
    }

    fn queue(&self, mode: WaitMode) -> &RefCell<VecDeque<Waiter>> {
        match mode {
            WaitMode::Read => &self.readers,
            WaitMode::Write => &self.writers,
        }
    }

    /// Queue a waiter, enabling reactor interest for `mode` if it is off.
    /// On failure the waiter is not queued.
    pub(crate) fn add_waiter(&self, sched: &SchedulerInner, mode: WaitMode, waiter: Waiter) -> io::Result<()> {
        self.queue(mode).borrow_mut().push_back(waiter);
        if !self.interest.get().contains(mode) {
            if let Err(e) = sched.reactor().set_interest(self.fd, mode, true) {
                self.queue(mode).borrow_mut().pop_back();
                self.detach_if_done(sched);
                return Err(e);
            }
            self.interest.set(self.interest.get().with(mode, true));
        }
        Ok(())
    }

    /// Evict a waiter (timeout or teardown). Unknown ids are ignored.
    pub(crate) fn remove_waiter(&self, mode: WaitMode, id: WaiterId) {
        let removed = {
            let mut queue = self.queue(mode).borrow_mut();
            queue
                .iter()
                .position(|w| w.id == id)
                .and_then(|pos| queue.remove(pos))
        };
        if removed.is_none() {
            return;
        }
        if let Some(sched) = self.sched.upgrade() {
            if self.queue(mode).borrow().is_empty() {
                self.disable(&sched, mode);
            }
            self.detach_if_done(&sched);
        }
    }

    fn notify(&self, mode: WaitMode) {
        let Some(sched) = self.sched.upgrade() else { return };
        let next = self.queue(mode).borrow_mut().pop_front();
        match next {
            Some(waiter) => {
                ktrace!("fd {} {}-ready, releasing fiber {}", self.fd, mode, waiter.fiber.id());
                sched.defer_resume(waiter.fiber, waiter.token, Wakeup::Ready);
            }
            None => self.disable(&sched, mode),
        }
        self.detach_if_done(&sched);
    }

    fn disable(&self, sched: &SchedulerInner, mode: WaitMode) {
        if self.detached.get() || !self.interest.get().contains(mode) {
            return;
        }
        if let Err(e) = sched.reactor().set_interest(self.fd, mode, false) {
            kdebug!("fd {}: disabling {} interest failed: {}", self.fd, mode, e);
        }
        self.interest.set(self.interest.get().with(mode, false));
    }

    fn detach_if_done(&self, sched: &SchedulerInner) {
        if !self.readers.borrow().is_empty() || !self.writers.borrow().is_empty() {
            return;
        }
        if self.detached.replace(true) {
            return;
        }
        self.interest.set(Interest::NONE);
        sched.forget_handle(self, true);
    }

    fn close(&self) {
        let Some(sched) = self.sched.upgrade() else { return };
        self.detached.set(true);
        self.interest.set(Interest::NONE);
        sched.forget_handle(self, false);

        let mut waiters: Vec<Waiter> = self.readers.borrow_mut().drain(..).collect();
        waiters.extend(self.writers.borrow_mut().drain(..));
        if !waiters.is_empty() {
            kdebug!("fd {} closed with {} waiters", self.fd, waiters.len());
        }
        for waiter in waiters {
            sched.defer_resume(
                waiter.fiber,
                waiter.token,
                Wakeup::Failed(NbError::HandleClosed { fd: self.fd }),
            );
        }
    }
}

impl Watcher for IoHandle {
    fn on_readable(&self) {
        self.notify(WaitMode::Read);
    }

    fn on_writable(&self) {
        self.notify(WaitMode::Write);
    }

    fn on_closed(&self) {
        self.close();
    }
}

impl std::fmt::Debug for IoHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoHandle")
            .field("fd", &self.fd)
            .field("readers", &self.readers.borrow().len())
            .field("writers", &self.writers.borrow().len())
            .field("interest", &self.interest.get())
            .field("detached", &self.detached.get())
            .finish()
    }
}
