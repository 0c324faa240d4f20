//! Fiber pool: idle set, FIFO backlog and the drive loop
//!
//! A fiber runs its task synchronously until the task suspends or ends.
//! When it ends, the fiber takes the oldest backlog entry (directly, or on
//! the next deferred pass with fair handoff) and only goes idle once the
//! backlog is empty.

use std::any::Any;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

use noblock_core::{kprint, ktrace, kwarn, FiberId, NbResult, TaskFailure};

use crate::fiber::{Fiber, LocalTask};
use crate::primitives::FiberCtx;
use crate::scheduler::SchedulerInner;

/// Unstarted work: builds the task once a fiber is assigned
pub(crate) type Job = Box<dyn FnOnce(FiberCtx) -> LocalTask>;

pub(crate) fn job<F, Fut>(f: F) -> Job
where
    F: FnOnce(FiberCtx) -> Fut + 'static,
    Fut: Future<Output = NbResult<()>> + 'static,
{
    // The closure itself runs on first poll, under the panic boundary
    Box::new(move |ctx| Box::pin(async move { f(ctx).await }))
}

/// Outcome of a spawn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Spawned {
    /// Assigned to this fiber and run up to its first suspension
    Started(FiberId),
    /// Appended to the backlog at this 1-based position
    Queued { position: usize },
    /// The scheduler was shut down; the work was dropped
    Rejected,
}

impl Spawned {
    pub fn fiber(&self) -> Option<FiberId> {
        match self {
            Spawned::Started(id) => Some(*id),
            _ => None,
        }
    }

    pub fn is_queued(&self) -> bool {
        matches!(self, Spawned::Queued { .. })
    }
}

/// Pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub size: usize,
    pub idle: usize,
    pub busy: usize,
    pub backlog: usize,
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    pub queued_total: u64,
}

enum Polled {
    Pending,
    Done(Option<TaskFailure>),
    Empty,
}

const NOOP_VTABLE: RawWakerVTable = RawWakerVTable::new(
    |_| RawWaker::new(std::ptr::null(), &NOOP_VTABLE),
    |_| {},
    |_| {},
    |_| {},
);

/// Fibers are resumed explicitly; wakers carry nothing
fn noop_waker() -> Waker {
    let raw = RawWaker::new(std::ptr::null(), &NOOP_VTABLE);
    // SAFETY: every vtable entry ignores the null data pointer
    unsafe { Waker::from_raw(raw) }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl SchedulerInner {
    pub(crate) fn spawn_job(&self, job: Job) -> Spawned {
        if self.shut_down.get() {
            kwarn!("spawn after shutdown, task dropped");
            return Spawned::Rejected;
        }
        let slot = self.idle.borrow_mut().pop_front();
        match slot {
            Some(index) => {
                let fiber = self.fibers[index].clone();
                self.start(&fiber, job);
                Spawned::Started(fiber.id())
            }
            None => {
                let position = {
                    let mut backlog = self.backlog.borrow_mut();
                    backlog.push_back(job);
                    backlog.len()
                };
                self.stats.borrow_mut().queued_total += 1;
                ktrace!("pool saturated, task queued at {}", position);
                Spawned::Queued { position }
            }
        }
    }

    pub(crate) fn pool_stats(&self) -> PoolStats {
        let mut stats = *self.stats.borrow();
        stats.size = self.fibers.len();
        stats.idle = self.idle.borrow().len();
        stats.busy = stats.size - stats.idle;
        stats.backlog = self.backlog.borrow().len();
        stats
    }

    fn start(&self, fiber: &Rc<Fiber>, job: Job) {
        let ctx = FiberCtx::new(self.me.clone(), fiber.clone());
        fiber.install(job(ctx));
        self.stats.borrow_mut().started += 1;
        self.drive(fiber);
    }

    /// Poll `fiber` until its task suspends, then keep it fed from the
    /// backlog for as long as tasks complete without suspending.
    pub(crate) fn drive(&self, fiber: &Rc<Fiber>) {
        loop {
            let polled = self.poll_fiber(fiber);
            if self.shut_down.get() {
                // Shut down from inside this task; the slot is already reset
                let task = fiber.take_task();
                drop(task);
                fiber.reset(self.config.neverblock);
                return;
            }
            let failure = match polled {
                Polled::Empty => return,
                Polled::Pending => {
                    // Resumed while its own poll was still on the stack
                    if fiber.pending().is_none() && fiber.has_wakeup() {
                        continue;
                    }
                    if fiber.pending().is_none() {
                        kwarn!("fiber {}: task pending outside a scheduler primitive", fiber.id());
                    }
                    return;
                }
                Polled::Done(failure) => failure,
            };

            self.finish_task(fiber, failure.is_some());
            let next = self.next_job_for(fiber);
            if let Some(failure) = failure {
                self.reactor().report_error(failure);
            }
            match next {
                Some(job) => {
                    let ctx = FiberCtx::new(self.me.clone(), fiber.clone());
                    fiber.install(job(ctx));
                    self.stats.borrow_mut().started += 1;
                }
                None => return,
            }
        }
    }

    fn poll_fiber(&self, fiber: &Rc<Fiber>) -> Polled {
        let Some(mut task) = fiber.take_task() else {
            return Polled::Empty;
        };
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        let prev = self.current.replace(fiber.id());
        let result = {
            let _tag = kprint::tag_fiber(fiber.id());
            panic::catch_unwind(AssertUnwindSafe(|| task.as_mut().poll(&mut cx)))
        };
        self.current.set(prev);

        let id = fiber.id();
        match result {
            Ok(Poll::Pending) => {
                fiber.put_task(task);
                Polled::Pending
            }
            Ok(Poll::Ready(Ok(()))) => Polled::Done(None),
            Ok(Poll::Ready(Err(error))) => Polled::Done(Some(TaskFailure::Error { fiber: id, error })),
            Err(payload) => {
                // Drop the unwound task before its fiber is reset
                drop(task);
                Polled::Done(Some(TaskFailure::Panic {
                    fiber: id,
                    message: panic_message(&*payload),
                }))
            }
        }
    }

    fn finish_task(&self, fiber: &Fiber, failed: bool) {
        self.discard_scopes(fiber);
        fiber.reset(self.config.neverblock);
        let mut stats = self.stats.borrow_mut();
        if failed {
            stats.failed += 1;
        } else {
            stats.completed += 1;
        }
    }

    /// Backlog head for a fiber whose task just ended, or None when the
    /// fiber went idle or was reserved for a deferred handoff
    fn next_job_for(&self, fiber: &Rc<Fiber>) -> Option<Job> {
        if self.backlog.borrow().is_empty() {
            self.release(fiber);
            return None;
        }
        if self.config.fair_handoff {
            let (sched, fiber) = (self.me.clone(), fiber.clone());
            self.deferred.push(Box::new(move || {
                if let Some(sched) = sched.upgrade() {
                    sched.handoff(&fiber);
                }
            }));
            return None;
        }
        self.backlog.borrow_mut().pop_front()
    }

    fn handoff(&self, fiber: &Rc<Fiber>) {
        if fiber.has_task() {
            return;
        }
        let next = self.backlog.borrow_mut().pop_front();
        match next {
            Some(job) => self.start(fiber, job),
            None => self.release(fiber),
        }
    }

    fn release(&self, fiber: &Fiber) {
        fiber.set_idle();
        self.idle.borrow_mut().push_back(fiber.id().as_usize());
    }
}
