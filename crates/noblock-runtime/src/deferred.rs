//! Deferred task queue
//!
//! FIFO of callbacks drained one per loop pass through the reactor's
//! next-tick queue. Every fiber resume caused by readiness, yield or a
//! timeout passes through here, which pins the relative order of "became
//! ready" and "timed out" events and keeps one readiness storm from
//! starving the rest of the loop.
//!
//! Callbacks pushed while a callback runs go to the back of the queue and
//! run on a later pass. When the loop stops, the queue is cleared and the
//! next push starts a fresh drain.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use noblock_core::{kdebug, kwarn};

use crate::reactor::{Callback, Reactor};

pub struct DeferredQueue {
    state: Rc<DeferredState>,
}

struct DeferredState {
    reactor: Weak<dyn Reactor>,
    queue: RefCell<VecDeque<Callback>>,
    /// A pop is scheduled with the reactor
    draining: Cell<bool>,
    hook_installed: Cell<bool>,
    warn_at: usize,
    warned: Cell<bool>,
    total_run: Cell<u64>,
}

impl DeferredQueue {
    pub fn new(reactor: &Rc<dyn Reactor>, warn_at: usize) -> Self {
        Self {
            state: Rc::new(DeferredState {
                reactor: Rc::downgrade(reactor),
                queue: RefCell::new(VecDeque::new()),
                draining: Cell::new(false),
                hook_installed: Cell::new(false),
                warn_at,
                warned: Cell::new(false),
                total_run: Cell::new(0),
            }),
        }
    }

    pub fn push(&self, callback: Callback) {
        self.state.push(callback);
    }

    pub fn len(&self) -> usize {
        self.state.queue.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.queue.borrow().is_empty()
    }

    /// Callbacks run since creation
    pub fn total_run(&self) -> u64 {
        self.state.total_run.get()
    }

    /// Drop queued callbacks without running them. An already scheduled pop
    /// finds the queue empty and ends the drain.
    pub fn clear(&self) {
        let dropped = std::mem::take(&mut *self.state.queue.borrow_mut());
        drop(dropped);
    }
}

impl DeferredState {
    fn push(self: &Rc<Self>, callback: Callback) {
        let len = {
            let mut queue = self.queue.borrow_mut();
            queue.push_back(callback);
            queue.len()
        };
        if len >= self.warn_at && !self.warned.replace(true) {
            kwarn!("deferred queue holds {} callbacks", len);
        }
        self.install_hook();
        if !self.draining.replace(true) {
            self.schedule_pop();
        }
    }

    fn install_hook(self: &Rc<Self>) {
        if self.hook_installed.replace(true) {
            return;
        }
        if let Some(reactor) = self.reactor.upgrade() {
            let weak = Rc::downgrade(self);
            reactor.add_shutdown_hook(Box::new(move || {
                if let Some(state) = weak.upgrade() {
                    state.reset();
                }
            }));
        }
    }

    fn schedule_pop(self: &Rc<Self>) {
        let Some(reactor) = self.reactor.upgrade() else {
            self.draining.set(false);
            return;
        };
        let weak = Rc::downgrade(self);
        reactor.next_tick(Box::new(move || {
            if let Some(state) = weak.upgrade() {
                state.pop_one();
            }
        }));
    }

    fn pop_one(self: &Rc<Self>) {
        // Reschedules on unwind too
        let _next = NextPop(self);
        let next = self.queue.borrow_mut().pop_front();
        if let Some(callback) = next {
            self.total_run.set(self.total_run.get() + 1);
            callback();
        }
    }

    fn reset(&self) {
        let dropped = std::mem::take(&mut *self.queue.borrow_mut());
        if !dropped.is_empty() {
            kdebug!("deferred queue cleared with {} callbacks pending", dropped.len());
        }
        self.draining.set(false);
        self.hook_installed.set(false);
        self.warned.set(false);
        drop(dropped);
    }
}

struct NextPop<'a>(&'a Rc<DeferredState>);

impl Drop for NextPop<'_> {
    fn drop(&mut self) {
        let state = self.0;
        if !state.draining.get() {
            // Reset by a shutdown hook while the callback ran
            return;
        }
        if state.queue.borrow().is_empty() {
            state.draining.set(false);
            if state.queue.borrow().capacity() > 1024 {
                state.queue.borrow_mut().shrink_to(64);
            }
            state.warned.set(false);
        } else {
            state.schedule_pop();
        }
    }
}
