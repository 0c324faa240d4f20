//! Hand-cranked reactor with a virtual clock, for deterministic tests.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use noblock_core::{Interest, TaskFailure, WaitMode};

use super::timer::{TimerHandle, TimerHeap};
use super::{Callback, Reactor, Watcher};
use crate::config::RuntimeConfig;
use crate::scheduler::Scheduler;

/// Scheduler over a fresh manual reactor
pub(crate) fn scheduler(pool_size: usize, fair_handoff: bool) -> (Rc<ManualReactor>, Scheduler) {
    let reactor = ManualReactor::new();
    let config = RuntimeConfig::new()
        .pool_size(pool_size)
        .fair_handoff(fair_handoff);
    let dyn_reactor: Rc<dyn Reactor> = reactor.clone();
    let sched = Scheduler::new(dyn_reactor, config).expect("valid test config");
    (reactor, sched)
}

pub(crate) struct ManualReactor {
    base: Instant,
    elapsed: Cell<Duration>,
    watches: RefCell<HashMap<RawFd, (Weak<dyn Watcher>, Interest)>>,
    rejected: RefCell<HashSet<RawFd>>,
    timers: RefCell<TimerHeap>,
    ticks: RefCell<VecDeque<Callback>>,
    hooks: RefCell<Vec<Callback>>,
    failures: RefCell<Vec<TaskFailure>>,
    running: Cell<bool>,
}

impl ManualReactor {
    pub(crate) fn new() -> Rc<Self> {
        Rc::new(Self {
            base: Instant::now(),
            elapsed: Cell::new(Duration::ZERO),
            watches: RefCell::new(HashMap::new()),
            rejected: RefCell::new(HashSet::new()),
            timers: RefCell::new(TimerHeap::new()),
            ticks: RefCell::new(VecDeque::new()),
            hooks: RefCell::new(Vec::new()),
            failures: RefCell::new(Vec::new()),
            running: Cell::new(true),
        })
    }

    fn now(&self) -> Instant {
        self.base + self.elapsed.get()
    }

    fn watcher(&self, fd: RawFd, mode: Option<WaitMode>) -> Option<Rc<dyn Watcher>> {
        let watches = self.watches.borrow();
        let (weak, interest) = watches.get(&fd)?;
        if let Some(mode) = mode {
            if !interest.contains(mode) {
                return None;
            }
        }
        weak.upgrade()
    }

    /// Deliver a read readiness event (ignored without read interest)
    pub(crate) fn readable(&self, fd: RawFd) {
        if let Some(w) = self.watcher(fd, Some(WaitMode::Read)) {
            w.on_readable();
        }
    }

    pub(crate) fn writable(&self, fd: RawFd) {
        if let Some(w) = self.watcher(fd, Some(WaitMode::Write)) {
            w.on_writable();
        }
    }

    /// Make `watch` fail for `fd`
    pub(crate) fn reject(&self, fd: RawFd) {
        self.rejected.borrow_mut().insert(fd);
    }

    /// Move the clock forward and fire due timers, earliest first
    pub(crate) fn advance(&self, by: Duration) {
        self.elapsed.set(self.elapsed.get() + by);
        let now = self.now();
        let mark = self.timers.borrow().watermark();
        loop {
            let next = self.timers.borrow_mut().pop_expired(now, mark);
            let Some((_, callback)) = next else { break };
            callback();
        }
    }

    /// Run the ticks queued before this call (one loop pass)
    pub(crate) fn tick(&self) {
        let queued = self.ticks.borrow().len();
        for _ in 0..queued {
            let next = self.ticks.borrow_mut().pop_front();
            match next {
                Some(callback) => callback(),
                None => break,
            }
        }
    }

    /// Tick until no ticks remain
    pub(crate) fn settle(&self) {
        for _ in 0..10_000 {
            if self.ticks.borrow().is_empty() {
                return;
            }
            self.tick();
        }
        panic!("ticks never settled");
    }

    /// Stop: discard ticks, run shutdown hooks once
    pub(crate) fn shutdown(&self) {
        self.running.set(false);
        let discarded = std::mem::take(&mut *self.ticks.borrow_mut());
        drop(discarded);
        let hooks = std::mem::take(&mut *self.hooks.borrow_mut());
        for hook in hooks {
            hook();
        }
        self.running.set(true);
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.set(running);
    }

    pub(crate) fn interest(&self, fd: RawFd) -> Option<Interest> {
        self.watches.borrow().get(&fd).map(|(_, i)| *i)
    }

    pub(crate) fn is_watching(&self, fd: RawFd) -> bool {
        self.watches.borrow().contains_key(&fd)
    }

    pub(crate) fn pending_timers(&self) -> usize {
        self.timers.borrow().len()
    }

    pub(crate) fn pending_ticks(&self) -> usize {
        self.ticks.borrow().len()
    }

    pub(crate) fn failures(&self) -> Vec<TaskFailure> {
        self.failures.borrow().clone()
    }
}

impl Reactor for ManualReactor {
    fn is_running(&self) -> bool {
        self.running.get()
    }

    fn watch(&self, fd: RawFd, watcher: Weak<dyn Watcher>) -> io::Result<()> {
        if self.rejected.borrow().contains(&fd) {
            return Err(io::Error::from_raw_os_error(libc::EPERM));
        }
        let mut watches = self.watches.borrow_mut();
        if watches.contains_key(&fd) {
            return Err(io::Error::from(io::ErrorKind::AlreadyExists));
        }
        watches.insert(fd, (watcher, Interest::NONE));
        Ok(())
    }

    fn set_interest(&self, fd: RawFd, mode: WaitMode, enabled: bool) -> io::Result<()> {
        let mut watches = self.watches.borrow_mut();
        let entry = watches
            .get_mut(&fd)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
        entry.1 = entry.1.with(mode, enabled);
        Ok(())
    }

    fn detach(&self, fd: RawFd) {
        self.watches.borrow_mut().remove(&fd);
    }

    fn unbind(&self, fd: RawFd) {
        let watcher = self.watcher(fd, None);
        self.detach(fd);
        if let Some(w) = watcher {
            w.on_closed();
        }
    }

    fn add_timer(&self, after: Duration, callback: Callback) -> TimerHandle {
        let deadline = self.now() + after;
        self.timers.borrow_mut().insert(deadline, callback)
    }

    fn cancel_timer(&self, handle: TimerHandle) -> bool {
        self.timers.borrow_mut().cancel(handle)
    }

    fn next_tick(&self, callback: Callback) {
        self.ticks.borrow_mut().push_back(callback);
    }

    fn add_shutdown_hook(&self, callback: Callback) {
        self.hooks.borrow_mut().push(callback);
    }

    fn report_error(&self, failure: TaskFailure) {
        self.failures.borrow_mut().push(failure);
    }
}
