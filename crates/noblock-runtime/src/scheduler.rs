//! Scheduler: the glue between the fiber pool, the reactor and the
//! timeout scopes.
//!
//! One `Scheduler` owns the descriptor registry, the deferred queue and the
//! pool. It is constructed over an `Rc<dyn Reactor>` at startup and torn
//! down with [`Scheduler::shutdown`]; there is no process-wide instance.
//!
//! Every resume path ends in [`SchedulerInner::resume`], which claims the
//! fiber's suspension token before delivering the wakeup. A callback whose
//! token was already claimed (a readiness resume racing a timeout, a yield
//! disarmed by a timeout) finds nothing to claim and does nothing.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::time::Duration;

use noblock_core::{kdebug, kinfo, ktrace, kwarn};
use noblock_core::{FiberId, NbError, NbResult, ScopeId, Serial, SuspendToken, TimeoutKind};

use crate::config::RuntimeConfig;
use crate::deferred::DeferredQueue;
use crate::fiber::{Fiber, Wakeup};
use crate::io_handle::IoHandle;
use crate::pool::{Job, PoolStats, Spawned};
use crate::primitives::FiberCtx;
use crate::reactor::{Reactor, Watcher};
use crate::timeout::TimeoutScope;

pub(crate) struct SchedulerInner {
    pub(crate) me: Weak<SchedulerInner>,
    reactor: Rc<dyn Reactor>,
    pub(crate) deferred: DeferredQueue,
    handles: RefCell<HashMap<RawFd, Rc<IoHandle>>>,
    pub(crate) fibers: Vec<Rc<Fiber>>,
    pub(crate) idle: RefCell<VecDeque<usize>>,
    pub(crate) backlog: RefCell<VecDeque<Job>>,
    /// Fiber whose task is being polled
    pub(crate) current: Cell<FiberId>,
    pub(crate) serial: Serial,
    pub(crate) config: RuntimeConfig,
    pub(crate) stats: RefCell<PoolStats>,
    pub(crate) shut_down: Cell<bool>,
}

/// Owning handle to a scheduler instance
#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<SchedulerInner>,
}

/// Non-owning handle, safe to keep inside tasks
#[derive(Clone)]
pub struct SchedulerRef {
    inner: Weak<SchedulerInner>,
}

impl Scheduler {
    /// Build a scheduler with `config.pool_size` idle fibers over `reactor`
    pub fn new(reactor: Rc<dyn Reactor>, config: RuntimeConfig) -> NbResult<Self> {
        config.validate()?;

        let inner = Rc::new_cyclic(|me| {
            let fibers: Vec<Rc<Fiber>> = (0..config.pool_size)
                .map(|i| Rc::new(Fiber::new(FiberId::new(i as u32), config.neverblock)))
                .collect();
            SchedulerInner {
                me: me.clone(),
                deferred: DeferredQueue::new(&reactor, config.deferred_warn),
                reactor,
                handles: RefCell::new(HashMap::new()),
                idle: RefCell::new((0..fibers.len()).collect()),
                fibers,
                backlog: RefCell::new(VecDeque::new()),
                current: Cell::new(FiberId::NONE),
                serial: Serial::new(),
                stats: RefCell::new(PoolStats::default()),
                shut_down: Cell::new(false),
                config,
            }
        });
        kinfo!(
            "scheduler ready: {} fibers, fair_handoff={}",
            inner.fibers.len(),
            inner.config.fair_handoff
        );
        Ok(Self { inner })
    }

    /// Run `f` on an idle fiber now, or queue it behind earlier submissions.
    ///
    /// The task runs synchronously until its first suspension point. Errors
    /// and panics go to the reactor's error boundary.
    pub fn spawn<F, Fut>(&self, f: F) -> Spawned
    where
        F: FnOnce(FiberCtx) -> Fut + 'static,
        Fut: Future<Output = NbResult<()>> + 'static,
    {
        self.inner.spawn_job(crate::pool::job(f))
    }

    pub(crate) fn from_inner(inner: Rc<SchedulerInner>) -> Self {
        Self { inner }
    }

    pub fn downgrade(&self) -> SchedulerRef {
        SchedulerRef { inner: Rc::downgrade(&self.inner) }
    }

    pub fn reactor(&self) -> Rc<dyn Reactor> {
        self.inner.reactor.clone()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn pool_size(&self) -> usize {
        self.inner.fibers.len()
    }

    pub fn idle_fibers(&self) -> usize {
        self.inner.idle.borrow().len()
    }

    pub fn busy_fibers(&self) -> usize {
        self.pool_size() - self.idle_fibers()
    }

    pub fn backlog_len(&self) -> usize {
        self.inner.backlog.borrow().len()
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.pool_stats()
    }

    /// Whether a readiness handle exists for `fd`
    pub fn has_io_handle(&self, fd: RawFd) -> bool {
        self.inner.handles.borrow().contains_key(&fd)
    }

    pub fn io_handle_count(&self) -> usize {
        self.inner.handles.borrow().len()
    }

    pub fn deferred_len(&self) -> usize {
        self.inner.deferred.len()
    }

    /// Active timeout scopes of one fiber
    pub fn active_timeouts(&self, fiber: FiberId) -> usize {
        self.inner
            .fibers
            .get(fiber.as_usize())
            .map_or(0, |f| f.scope_depth())
    }

    /// Tell the reactor `fd` is about to be closed; its waiters fail with
    /// `HandleClosed`. Call before closing a descriptor fibers may wait on.
    pub fn close_descriptor(&self, fd: RawFd) {
        self.inner.close_descriptor(fd);
    }

    /// Drop queued and in-flight tasks, detach every descriptor and clear
    /// the deferred queue. Idempotent.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.get()
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("pool_size", &self.pool_size())
            .field("idle", &self.idle_fibers())
            .field("backlog", &self.backlog_len())
            .field("io_handles", &self.io_handle_count())
            .finish()
    }
}

impl SchedulerRef {
    pub(crate) fn from_weak(inner: Weak<SchedulerInner>) -> Self {
        Self { inner }
    }

    pub fn upgrade(&self) -> Option<Scheduler> {
        self.inner.upgrade().map(|inner| Scheduler { inner })
    }

    /// See [`Scheduler::close_descriptor`]; no-op once the scheduler is gone
    pub fn close_descriptor(&self, fd: RawFd) {
        if let Some(inner) = self.inner.upgrade() {
            inner.close_descriptor(fd);
        }
    }
}

impl SchedulerInner {
    pub(crate) fn reactor(&self) -> &dyn Reactor {
        &*self.reactor
    }

    pub(crate) fn reactor_rc(&self) -> Rc<dyn Reactor> {
        self.reactor.clone()
    }

    pub(crate) fn next_token(&self) -> SuspendToken {
        self.serial.next()
    }

    // ---- resume -----------------------------------------------------------

    /// Resume `fiber` if `token` still owns its pending suspension
    pub(crate) fn resume(&self, fiber: &Rc<Fiber>, token: SuspendToken, wake: Wakeup) -> bool {
        if !fiber.claim(token) {
            ktrace!("fiber {}: stale resume {} ignored", fiber.id(), token);
            return false;
        }
        fiber.deliver(wake);
        self.drive(fiber);
        true
    }

    /// Resume through the deferred queue
    pub(crate) fn defer_resume(&self, fiber: Rc<Fiber>, token: SuspendToken, wake: Wakeup) {
        let sched = self.me.clone();
        self.deferred.push(Box::new(move || {
            if let Some(sched) = sched.upgrade() {
                sched.resume(&fiber, token, wake);
            }
        }));
    }

    // ---- descriptor registry ----------------------------------------------

    /// Existing handle for `fd`, or a new one watched by the reactor
    pub(crate) fn io_handle(&self, fd: RawFd) -> NbResult<Rc<IoHandle>> {
        if let Some(handle) = self.handles.borrow().get(&fd) {
            return Ok(handle.clone());
        }
        let handle = Rc::new(IoHandle::new(fd, self.me.clone()));
        let watcher: Rc<dyn Watcher> = handle.clone();
        self.reactor.watch(fd, Rc::downgrade(&watcher))?;
        self.handles.borrow_mut().insert(fd, handle.clone());
        ktrace!("fd {}: readiness handle created", fd);
        Ok(handle)
    }

    /// Drop `handle` from the registry if it is the registered one
    pub(crate) fn forget_handle(&self, handle: &IoHandle, detach: bool) {
        let fd = handle.fd();
        let removed = {
            let mut handles = self.handles.borrow_mut();
            let registered = handles
                .get(&fd)
                .is_some_and(|h| std::ptr::eq(Rc::as_ptr(h), handle));
            if registered {
                handles.remove(&fd)
            } else {
                None
            }
        };
        if removed.is_some() {
            if detach {
                self.reactor.detach(fd);
            }
            ktrace!("fd {}: readiness handle detached", fd);
        }
        drop(removed);
    }

    fn close_descriptor(&self, fd: RawFd) {
        if self.handles.borrow().contains_key(&fd) {
            self.reactor.unbind(fd);
        }
    }

    // ---- timeout scopes ---------------------------------------------------

    /// Push a scope on `fiber` and arm its deadline.
    ///
    /// The timer callback only queues the real fire through the deferred
    /// queue, behind any readiness resumes queued earlier.
    pub(crate) fn enter_timeout(&self, fiber: &Rc<Fiber>, duration: Duration, kind: TimeoutKind) -> ScopeId {
        if let Some(outer) = fiber.innermost_scope() {
            kdebug!(
                "fiber {}: nested timeout ({} {:?} inside {} {:?})",
                fiber.id(),
                kind,
                duration,
                outer.kind(),
                outer.duration()
            );
        }

        let id: ScopeId = self.serial.next();
        let scope = Rc::new(TimeoutScope::new(id, kind, duration));
        let (sched, target) = (self.me.clone(), Rc::downgrade(fiber));
        let timer = self.reactor.add_timer(
            duration,
            Box::new(move || {
                let Some(inner) = sched.upgrade() else { return };
                inner.deferred.push(Box::new(move || {
                    if let (Some(inner), Some(fiber)) = (sched.upgrade(), target.upgrade()) {
                        inner.fire_timeout(&fiber, id);
                    }
                }));
            }),
        );
        scope.set_timer(timer);
        fiber.push_scope(scope);
        id
    }

    /// Block exit: cancel the scope and anything still above it
    pub(crate) fn leave_timeout(&self, fiber: &Fiber, id: ScopeId) {
        self.cancel_scopes_from(fiber, id);
    }

    /// Cancel scope `id` and every later scope. Returns the scope `id` if it
    /// was still on the stack.
    fn cancel_scopes_from(&self, fiber: &Fiber, id: ScopeId) -> Option<Rc<TimeoutScope>> {
        let removed = fiber.split_scopes_from(id);
        for scope in &removed {
            scope.cancel(&*self.reactor);
        }
        removed.into_iter().next()
    }

    fn fire_timeout(&self, fiber: &Rc<Fiber>, id: ScopeId) {
        let Some(scope) = self.cancel_scopes_from(fiber, id) else {
            ktrace!("fiber {}: timeout {} already left", fiber.id(), id);
            return;
        };
        if fiber.claim_any().is_none() {
            kwarn!("fiber {}: timeout {} fired while not suspended", fiber.id(), id);
            return;
        }
        kdebug!("fiber {}: {} after {:?}", fiber.id(), scope.kind(), scope.duration());
        fiber.deliver(Wakeup::Failed(NbError::timeout(scope.kind(), scope.duration())));
        self.drive(fiber);
    }

    /// Cancel every scope left on a fiber whose task ended
    pub(crate) fn discard_scopes(&self, fiber: &Fiber) {
        let leftover = fiber.take_all_scopes();
        if leftover.is_empty() {
            return;
        }
        kwarn!("fiber {}: {} timeout scopes left after task", fiber.id(), leftover.len());
        for scope in leftover {
            scope.cancel(&*self.reactor);
        }
    }

    // ---- teardown ---------------------------------------------------------

    fn shutdown(&self) {
        if self.shut_down.replace(true) {
            return;
        }
        let queued = std::mem::take(&mut *self.backlog.borrow_mut());
        drop(queued);

        for fiber in &self.fibers {
            // Dropping an armed primitive releases its waiter, timer or yield
            let task = fiber.take_task();
            drop(task);
            self.discard_scopes(fiber);
            fiber.reset(self.config.neverblock);
            fiber.set_idle();
        }
        *self.idle.borrow_mut() = (0..self.fibers.len()).collect();

        let handles: Vec<Rc<IoHandle>> = self.handles.borrow_mut().drain().map(|(_, h)| h).collect();
        for handle in &handles {
            self.reactor.detach(handle.fd());
        }
        drop(handles);
        self.deferred.clear();
        kinfo!("scheduler shut down");
    }
}

impl Drop for SchedulerInner {
    fn drop(&mut self) {
        // Tasks only hold weak references back here; drop them explicitly
        // so their fibers are released.
        for fiber in &self.fibers {
            let task = fiber.take_task();
            drop(task);
            for scope in fiber.take_all_scopes() {
                scope.cancel(&*self.reactor);
            }
        }
        for (fd, _) in self.handles.borrow_mut().drain() {
            self.reactor.detach(fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::manual::{scheduler, ManualReactor};
    use noblock_core::{TaskFailure, WaitMode};
    use std::cell::RefCell;

    type Log = Rc<RefCell<Vec<String>>>;

    fn log() -> Log {
        Rc::new(RefCell::new(Vec::new()))
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    /// Task that yields once and records where it ran
    fn yielder(sched: &Scheduler, log: &Log, name: &'static str) -> Spawned {
        let log = log.clone();
        sched.spawn(move |ctx| async move {
            let r = ctx.yield_now().await;
            log.borrow_mut().push(format!("{}@{}", name, ctx.id()));
            r
        })
    }

    #[test]
    fn test_spawn_runs_synchronously_until_suspension() {
        let (reactor, sched) = scheduler(2, false);
        let log = log();

        let l = log.clone();
        let spawned = sched.spawn(move |ctx| async move {
            l.borrow_mut().push("before".into());
            let r = ctx.yield_now().await;
            l.borrow_mut().push("after".into());
            r
        });
        assert_eq!(spawned, Spawned::Started(FiberId::new(0)));
        assert_eq!(*log.borrow(), vec!["before"]);
        assert_eq!(sched.busy_fibers(), 1);

        reactor.settle();
        assert_eq!(*log.borrow(), vec!["before", "after"]);
        assert_eq!(sched.idle_fibers(), 2);
        assert_eq!(sched.stats().completed, 1);
    }

    #[test]
    fn test_backlog_starts_in_submission_order() {
        let (reactor, sched) = scheduler(2, false);
        let log = log();

        assert_eq!(yielder(&sched, &log, "t1"), Spawned::Started(FiberId::new(0)));
        assert_eq!(yielder(&sched, &log, "t2"), Spawned::Started(FiberId::new(1)));
        assert_eq!(yielder(&sched, &log, "t3"), Spawned::Queued { position: 1 });
        assert_eq!(yielder(&sched, &log, "t4"), Spawned::Queued { position: 2 });
        assert_eq!(sched.backlog_len(), 2);

        // t1 finishing hands its fiber to t3 before t2 gets a turn
        reactor.tick();
        assert_eq!(*log.borrow(), vec!["t1@0"]);
        assert_eq!(sched.backlog_len(), 1);

        reactor.settle();
        assert_eq!(*log.borrow(), vec!["t1@0", "t2@1", "t3@0", "t4@1"]);
        let stats = sched.stats();
        assert_eq!(stats.started, 4);
        assert_eq!(stats.queued_total, 2);
        assert_eq!(stats.idle, 2);
        assert_eq!(stats.backlog, 0);
    }

    #[test]
    fn test_fair_handoff_lets_resumed_fibers_finish_first() {
        let (reactor, sched) = scheduler(2, true);
        let log = log();
        yielder(&sched, &log, "task1");
        yielder(&sched, &log, "task2");
        let l = log.clone();
        sched.spawn(move |ctx| async move {
            l.borrow_mut().push(format!("task3@{}", ctx.id()));
            Ok(())
        });

        reactor.tick();
        // fiber 0 is reserved for the backlog head, so new work still queues
        assert_eq!(sched.idle_fibers(), 0);
        assert!(sched.spawn(|_| async { Ok(()) }).is_queued());

        reactor.settle();
        assert_eq!(log.borrow()[..3], ["task1@0", "task2@1", "task3@0"]);
        assert_eq!(sched.idle_fibers(), 2);
        assert_eq!(sched.backlog_len(), 0);
    }

    #[test]
    fn test_without_fair_handoff_backlog_runs_immediately() {
        let (reactor, sched) = scheduler(2, false);
        let log = log();
        yielder(&sched, &log, "task1");
        yielder(&sched, &log, "task2");
        let l = log.clone();
        sched.spawn(move |ctx| async move {
            l.borrow_mut().push(format!("task3@{}", ctx.id()));
            Ok(())
        });

        reactor.settle();
        assert_eq!(*log.borrow(), vec!["task1@0", "task3@0", "task2@1"]);
    }

    #[test]
    fn test_panic_is_reported_and_fiber_reused() {
        let (reactor, sched) = scheduler(1, false);
        let spawned = sched.spawn(|_| async { panic!("boom") });
        assert_eq!(spawned, Spawned::Started(FiberId::new(0)));
        assert_eq!(
            reactor.failures(),
            vec![TaskFailure::Panic {
                fiber: FiberId::new(0),
                message: "boom".into()
            }]
        );

        let ran = Rc::new(Cell::new(false));
        let r = ran.clone();
        let spawned = sched.spawn(move |_| async move {
            r.set(true);
            Ok(())
        });
        assert_eq!(spawned, Spawned::Started(FiberId::new(0)));
        assert!(ran.get());
        assert_eq!(sched.stats().failed, 1);
        assert_eq!(sched.stats().completed, 1);
    }

    #[test]
    fn test_error_reported_after_backlog_pickup() {
        let (reactor, sched) = scheduler(1, false);
        sched.spawn(|ctx| async move {
            ctx.yield_now().await?;
            Err(NbError::task("bad input"))
        });
        let started = Rc::new(Cell::new(false));
        let s = started.clone();
        sched.spawn(move |ctx| async move {
            s.set(true);
            ctx.yield_now().await
        });
        assert!(!started.get());

        reactor.tick();
        assert!(started.get());
        assert_eq!(
            reactor.failures(),
            vec![TaskFailure::Error {
                fiber: FiberId::new(0),
                error: NbError::task("bad input")
            }]
        );
    }

    #[test]
    fn test_inner_timeout_wins() {
        let (reactor, sched) = scheduler(1, false);
        let log = log();
        let l = log.clone();
        sched.spawn(move |ctx| async move {
            let outer = ctx
                .with_timeout(ms(100), TimeoutKind::GENERIC, async {
                    let inner = ctx
                        .with_timeout(ms(10), TimeoutKind::READ, async { ctx.sleep(ms(1000)).await })
                        .await;
                    l.borrow_mut().push(format!("inner {:?}", inner.map_err(|e| e.timeout_kind())));
                    l.borrow_mut().push(format!("depth {}", ctx.active_timeouts()));
                    Ok(())
                })
                .await;
            l.borrow_mut().push(format!("outer {:?}", outer));
            Ok(())
        });
        assert_eq!(sched.active_timeouts(FiberId::new(0)), 2);
        assert_eq!(reactor.pending_timers(), 3);

        reactor.advance(ms(10));
        reactor.settle();
        assert_eq!(
            *log.borrow(),
            vec!["inner Err(Some(TimeoutKind(\"read timeout\")))", "depth 1", "outer Ok(())"]
        );
        assert_eq!(reactor.pending_timers(), 0);
        assert_eq!(sched.active_timeouts(FiberId::new(0)), 0);
    }

    #[test]
    fn test_outer_timeout_wins_and_removes_inner_scope() {
        let (reactor, sched) = scheduler(1, false);
        let result = Rc::new(RefCell::new(None));
        let r = result.clone();
        sched.spawn(move |ctx| async move {
            let outcome = ctx
                .with_timeout(ms(50), TimeoutKind::GENERIC, async {
                    ctx.with_timeout(ms(100), TimeoutKind::READ, async { ctx.sleep(ms(1000)).await })
                        .await
                })
                .await;
            *r.borrow_mut() = Some(outcome);
            Ok(())
        });

        reactor.advance(ms(50));
        reactor.settle();
        assert_eq!(
            *result.borrow(),
            Some(Err(NbError::timeout(TimeoutKind::GENERIC, ms(50))))
        );
        // inner deadline and the sleep were cancelled with the outer scope
        assert_eq!(reactor.pending_timers(), 0);
        reactor.advance(ms(2000));
        reactor.settle();
        assert!(reactor.failures().is_empty());
    }

    #[test]
    fn test_queued_inner_fire_is_noop_after_outer_wins() {
        let (reactor, sched) = scheduler(1, false);
        let result = Rc::new(RefCell::new(None));
        let r = result.clone();
        sched.spawn(move |ctx| async move {
            let outcome = ctx
                .with_timeout(ms(10), TimeoutKind::GENERIC, async {
                    ctx.with_timeout(ms(10), TimeoutKind::READ, async { ctx.sleep(ms(500)).await })
                        .await
                })
                .await;
            *r.borrow_mut() = Some(outcome.map_err(|e| e.timeout_kind()));
            Ok(())
        });

        // Both deadlines fire in one pass; the outer one was created first
        reactor.advance(ms(10));
        assert_eq!(sched.deferred_len(), 2);
        reactor.settle();
        assert_eq!(*result.borrow(), Some(Err(Some(TimeoutKind::GENERIC))));
        assert_eq!(sched.idle_fibers(), 1);
    }

    #[test]
    fn test_absent_or_zero_timeout_runs_untimed() {
        let (reactor, sched) = scheduler(1, false);
        let depths = Rc::new(RefCell::new(Vec::new()));
        let d = depths.clone();
        sched.spawn(move |ctx| async move {
            ctx.with_timeout(None, TimeoutKind::GENERIC, async {
                d.borrow_mut().push(ctx.active_timeouts());
                Ok(())
            })
            .await?;
            ctx.with_timeout(Duration::ZERO, TimeoutKind::GENERIC, async {
                d.borrow_mut().push(ctx.active_timeouts());
                ctx.yield_now().await
            })
            .await
        });
        assert_eq!(reactor.pending_timers(), 0);
        reactor.settle();
        assert_eq!(*depths.borrow(), vec![0, 0]);
        assert!(reactor.failures().is_empty());
    }

    #[test]
    fn test_timeout_disarms_pending_yield() {
        let (reactor, sched) = scheduler(1, false);
        let result = Rc::new(RefCell::new(None));
        let r = result.clone();
        sched.spawn(move |ctx| async move {
            let outcome = ctx
                .with_timeout(ms(10), TimeoutKind::GENERIC, async {
                    ctx.sleep(ms(10)).await?;
                    // Queued behind the timeout's fire
                    ctx.yield_now().await
                })
                .await;
            *r.borrow_mut() = Some(outcome);
            Ok(())
        });

        reactor.advance(ms(10));
        assert_eq!(sched.deferred_len(), 2);
        reactor.settle();
        assert_eq!(
            *result.borrow(),
            Some(Err(NbError::timeout(TimeoutKind::GENERIC, ms(10))))
        );
        assert!(reactor.failures().is_empty());
    }

    #[test]
    fn test_sleep_resumes_on_timer() {
        let (reactor, sched) = scheduler(1, false);
        let woke = Rc::new(Cell::new(false));
        let w = woke.clone();
        sched.spawn(move |ctx| async move {
            ctx.sleep(ms(30)).await?;
            w.set(true);
            Ok(())
        });
        reactor.advance(ms(29));
        assert!(!woke.get());
        reactor.advance(ms(1));
        assert!(woke.get());
        assert_eq!(sched.idle_fibers(), 1);
    }

    #[test]
    fn test_zero_sleep_does_not_suspend() {
        let (reactor, sched) = scheduler(1, false);
        let done = Rc::new(Cell::new(false));
        let d = done.clone();
        sched.spawn(move |ctx| async move {
            ctx.sleep(Duration::ZERO).await?;
            ctx.sleep(None).await?;
            d.set(true);
            Ok(())
        });
        assert!(done.get());
        assert_eq!(reactor.pending_timers(), 0);
    }

    #[test]
    fn test_neverblock_flag_restored() {
        let (reactor, sched) = scheduler(1, false);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = seen.clone();
        sched.spawn(move |ctx| async move {
            s.borrow_mut().push(ctx.neverblocking());
            ctx.with_neverblock(false, || s.borrow_mut().push(ctx.neverblocking()));
            s.borrow_mut().push(ctx.neverblocking());

            let unwound = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                ctx.with_neverblock(false, || panic!("inside"))
            }));
            s.borrow_mut().push(unwound.is_err());
            s.borrow_mut().push(ctx.neverblocking());

            ctx.neverblock_scope(false, async {
                ctx.yield_now().await?;
                s.borrow_mut().push(ctx.neverblocking());
                Ok::<(), NbError>(())
            })
            .await?;
            s.borrow_mut().push(ctx.neverblocking());
            Ok(())
        });
        reactor.settle();
        assert_eq!(*seen.borrow(), vec![true, false, true, true, true, false, true]);

        reactor.set_running(false);
        let s = seen.clone();
        sched.spawn(move |ctx| async move {
            s.borrow_mut().push(ctx.neverblocking());
            Ok(())
        });
        assert_eq!(seen.borrow().last(), Some(&false));
    }

    #[test]
    fn test_primitive_from_foreign_fiber_is_rejected() {
        let (reactor, sched) = scheduler(2, false);
        let stash: Rc<RefCell<Option<FiberCtx>>> = Rc::new(RefCell::new(None));
        let result = Rc::new(RefCell::new(None));

        let s = stash.clone();
        sched.spawn(move |ctx| async move {
            *s.borrow_mut() = Some(ctx.clone());
            ctx.sleep(ms(5)).await
        });
        let (s, r) = (stash.clone(), result.clone());
        sched.spawn(move |_ctx| async move {
            let other = s.borrow_mut().take();
            if let Some(other) = other {
                *r.borrow_mut() = Some(other.yield_now().await);
            }
            Ok(())
        });
        assert_eq!(
            *result.borrow(),
            Some(Err(NbError::InvalidUsage("primitive awaited outside its fiber")))
        );
        reactor.advance(ms(5));
        assert!(reactor.failures().is_empty());
    }

    #[test]
    fn test_shutdown_releases_everything() {
        let (reactor, sched) = scheduler(2, false);
        sched.spawn(|ctx| async move { ctx.sleep(ms(100)).await });
        sched.spawn(|ctx| async move { ctx.wait(WaitMode::Read, 40).await });
        sched.spawn(|_| async { Ok(()) });
        assert_eq!(sched.backlog_len(), 1);
        assert_eq!(reactor.pending_timers(), 1);
        assert!(reactor.is_watching(40));

        sched.shutdown();
        assert!(sched.is_shut_down());
        assert_eq!(sched.backlog_len(), 0);
        assert_eq!(sched.idle_fibers(), 2);
        assert_eq!(reactor.pending_timers(), 0);
        assert!(!reactor.is_watching(40));
        assert_eq!(sched.io_handle_count(), 0);
        assert_eq!(sched.spawn(|_| async { Ok(()) }), Spawned::Rejected);

        // idempotent
        sched.shutdown();
        reactor.settle();
        assert!(reactor.failures().is_empty());
    }

    #[test]
    fn test_dropping_scheduler_releases_fibers() {
        let reactor = ManualReactor::new();
        let dyn_reactor: Rc<dyn Reactor> = reactor.clone();
        let sched = Scheduler::new(dyn_reactor, RuntimeConfig::new().pool_size(1)).unwrap();
        sched.spawn(|ctx| async move { ctx.sleep(ms(10)).await });
        let weak = Rc::downgrade(&sched.inner);
        drop(sched);
        assert!(weak.upgrade().is_none());
        assert_eq!(reactor.pending_timers(), 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let reactor: Rc<dyn Reactor> = ManualReactor::new();
        let err = Scheduler::new(reactor, RuntimeConfig::new().pool_size(0)).unwrap_err();
        assert_eq!(err, NbError::InvalidConfig("pool_size must be > 0"));
    }
}
