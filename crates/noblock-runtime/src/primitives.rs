//! Suspension points: `wait`, `sleep`, `yield_now` and `with_timeout`
//!
//! Every primitive is a future that arms on its first poll (registering a
//! waiter, a timer or a deferred resume, plus a registration with the
//! innermost timeout scope) and returns `Pending`. The fiber is then driven
//! again only by an explicit, token-checked resume, whose value the second
//! poll picks up.
//!
//! ```text
//!   idle ──poll──> armed ──resume(Ready)────> resumed
//!                    └────resume(Failed)────> canceled
//! ```
//!
//! Dropping an armed primitive releases what it registered.

use std::cell::Cell;
use std::future::Future;
use std::os::unix::io::RawFd;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use noblock_core::{
    kwarn, FiberId, NbError, NbResult, ScopeId, SuspendState, SuspendToken, TimeoutKind, WaitMode,
    WaiterId,
};

use crate::fiber::{Fiber, Wakeup};
use crate::io_handle::{IoHandle, Waiter};
use crate::pool::Spawned;
use crate::reactor::{Reactor, TimerHandle};
use crate::scheduler::{Scheduler, SchedulerInner, SchedulerRef};
use crate::timeout::{Registration, RegistrationId, TimeoutScope};

/// A task's handle on its own fiber
#[derive(Clone)]
pub struct FiberCtx {
    sched: Weak<SchedulerInner>,
    fiber: Rc<Fiber>,
}

impl FiberCtx {
    pub(crate) fn new(sched: Weak<SchedulerInner>, fiber: Rc<Fiber>) -> Self {
        Self { sched, fiber }
    }

    #[inline]
    pub fn id(&self) -> FiberId {
        self.fiber.id()
    }

    /// The scheduler, while it is alive
    pub fn scheduler(&self) -> Option<Scheduler> {
        self.sched.upgrade().map(Scheduler::from_inner)
    }

    pub fn scheduler_ref(&self) -> SchedulerRef {
        SchedulerRef::from_weak(self.sched.clone())
    }

    /// Submit another task to the same pool
    pub fn spawn<F, Fut>(&self, f: F) -> Spawned
    where
        F: FnOnce(FiberCtx) -> Fut + 'static,
        Fut: Future<Output = NbResult<()>> + 'static,
    {
        match self.sched.upgrade() {
            Some(sched) => sched.spawn_job(crate::pool::job(f)),
            None => Spawned::Rejected,
        }
    }

    /// Whether blocking calls on this fiber should suspend instead of block:
    /// the fiber's flag is on and the reactor is running
    pub fn neverblocking(&self) -> bool {
        self.fiber.neverblock()
            && self
                .sched
                .upgrade()
                .is_some_and(|sched| sched.reactor().is_running())
    }

    /// Run `f` with the non-blocking flag set to `enabled`, restoring the
    /// previous value afterwards (also on panic)
    pub fn with_neverblock<R>(&self, enabled: bool, f: impl FnOnce() -> R) -> R {
        let _restore = NeverblockGuard::set(&self.fiber, enabled);
        f()
    }

    /// Async form of [`with_neverblock`](Self::with_neverblock): the flag
    /// holds across the suspensions of `fut`
    pub async fn neverblock_scope<F: Future>(&self, enabled: bool, fut: F) -> F::Output {
        let _restore = NeverblockGuard::set(&self.fiber, enabled);
        fut.await
    }

    /// Timeout scopes currently active on this fiber
    pub fn active_timeouts(&self) -> usize {
        self.fiber.scope_depth()
    }

    /// See [`Scheduler::close_descriptor`]
    pub fn close_descriptor(&self, fd: RawFd) {
        self.scheduler_ref().close_descriptor(fd);
    }

    /// Suspend until `fd` is ready for `mode`
    pub fn wait(&self, mode: WaitMode, fd: RawFd) -> Wait<'_> {
        Wait {
            ctx: self,
            mode,
            fd,
            state: SuspendState::Idle,
            armed: None,
        }
    }

    /// Suspend for `duration`. Absent or zero completes immediately.
    pub fn sleep(&self, duration: impl Into<Option<Duration>>) -> Sleep<'_> {
        let duration = duration.into().filter(|d| !d.is_zero());
        Sleep {
            ctx: self,
            duration,
            state: SuspendState::Idle,
            armed: None,
        }
    }

    /// Give every other runnable fiber a turn
    pub fn yield_now(&self) -> YieldNow<'_> {
        YieldNow {
            ctx: self,
            state: SuspendState::Idle,
            armed: None,
        }
    }

    /// Run `block` under a deadline of `duration`.
    ///
    /// When the deadline passes while the fiber is suspended inside `block`,
    /// that suspension fails with `NbError::Timeout` of `kind`. The scope is
    /// left when `block` finishes or is dropped. Absent or zero durations
    /// run `block` without a deadline.
    pub async fn with_timeout<T, F>(
        &self,
        duration: impl Into<Option<Duration>>,
        kind: TimeoutKind,
        block: F,
    ) -> NbResult<T>
    where
        F: Future<Output = NbResult<T>>,
    {
        let Some(duration) = duration.into().filter(|d| !d.is_zero()) else {
            return block.await;
        };
        let id = {
            let sched = self.live()?;
            sched.enter_timeout(&self.fiber, duration, kind)
        };
        let _scope = ScopeGuard {
            sched: self.sched.clone(),
            fiber: &self.fiber,
            id,
        };
        block.await
    }

    fn live(&self) -> NbResult<Rc<SchedulerInner>> {
        self.sched
            .upgrade()
            .ok_or(NbError::InvalidUsage("scheduler dropped"))
    }

    /// Scheduler, if this fiber may suspend right now
    fn suspend_point(&self) -> NbResult<Rc<SchedulerInner>> {
        let sched = self.live()?;
        if sched.current.get() != self.fiber.id() {
            return Err(NbError::InvalidUsage("primitive awaited outside its fiber"));
        }
        if self.fiber.pending().is_some() {
            return Err(NbError::InvalidUsage("fiber already suspended"));
        }
        Ok(sched)
    }
}

impl std::fmt::Debug for FiberCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FiberCtx")
            .field("fiber", &self.fiber.id())
            .field("scopes", &self.fiber.scope_depth())
            .finish()
    }
}

struct NeverblockGuard<'a> {
    fiber: &'a Fiber,
    prev: bool,
}

impl<'a> NeverblockGuard<'a> {
    fn set(fiber: &'a Fiber, enabled: bool) -> Self {
        let prev = fiber.set_neverblock(enabled);
        Self { fiber, prev }
    }
}

impl Drop for NeverblockGuard<'_> {
    fn drop(&mut self) {
        self.fiber.set_neverblock(self.prev);
    }
}

struct ScopeGuard<'a> {
    sched: Weak<SchedulerInner>,
    fiber: &'a Fiber,
    id: ScopeId,
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        if let Some(sched) = self.sched.upgrade() {
            sched.leave_timeout(self.fiber, self.id);
        }
    }
}

/// Registration with the innermost scope, removed on completion
struct ScopeEntry {
    scope: Rc<TimeoutScope>,
    id: RegistrationId,
}

impl ScopeEntry {
    fn register(fiber: &Fiber, registration: Registration) -> Option<Self> {
        let scope = fiber.innermost_scope()?;
        let id = scope.register(registration);
        Some(Self { scope, id })
    }

    fn release(self) {
        self.scope.deregister(self.id);
    }
}

fn transition(state: &mut SuspendState, next: SuspendState) {
    debug_assert!(state.can_transition_to(next), "{:?} -> {:?}", state, next);
    *state = next;
}

/// Second poll of an armed primitive: the delivered wakeup, if any
fn settle(state: &mut SuspendState, fiber: &Fiber, token: SuspendToken) -> Poll<NbResult<()>> {
    match fiber.take_wakeup() {
        Some(wake) => {
            let next = match &wake {
                Wakeup::Ready => SuspendState::Resumed,
                Wakeup::Failed(_) => SuspendState::Canceled,
            };
            transition(state, next);
            Poll::Ready(wake.into_result())
        }
        None => {
            if fiber.pending() != Some(token) {
                kwarn!("fiber {}: armed primitive lost its resume", fiber.id());
            }
            Poll::Pending
        }
    }
}

fn polled_after_completion() -> Poll<NbResult<()>> {
    Poll::Ready(Err(NbError::InvalidUsage("primitive polled after completion")))
}

// ---- wait -----------------------------------------------------------------

struct ArmedWait {
    token: SuspendToken,
    handle: Rc<IoHandle>,
    waiter: WaiterId,
    scope: Option<ScopeEntry>,
}

/// Future returned by [`FiberCtx::wait`]
#[must_use = "primitives do nothing unless awaited"]
pub struct Wait<'a> {
    ctx: &'a FiberCtx,
    mode: WaitMode,
    fd: RawFd,
    state: SuspendState,
    armed: Option<ArmedWait>,
}

impl Wait<'_> {
    fn arm(&mut self) -> NbResult<()> {
        let sched = self.ctx.suspend_point()?;
        let fiber = &self.ctx.fiber;
        let handle = sched.io_handle(self.fd)?;
        let token = sched.next_token();
        let waiter: WaiterId = sched.serial.next();
        handle.add_waiter(
            &sched,
            self.mode,
            Waiter {
                id: waiter,
                fiber: fiber.clone(),
                token,
            },
        )?;
        fiber.arm(token);
        let scope = ScopeEntry::register(
            fiber,
            Registration::IoWait {
                handle: Rc::downgrade(&handle),
                mode: self.mode,
                waiter,
            },
        );
        self.armed = Some(ArmedWait { token, handle, waiter, scope });
        Ok(())
    }
}

impl Future for Wait<'_> {
    type Output = NbResult<()>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match this.state {
            SuspendState::Idle => match this.arm() {
                Ok(()) => {
                    transition(&mut this.state, SuspendState::Armed);
                    Poll::Pending
                }
                Err(e) => {
                    this.state = SuspendState::Canceled;
                    Poll::Ready(Err(e))
                }
            },
            SuspendState::Armed => {
                let Some(token) = this.armed.as_ref().map(|a| a.token) else {
                    return polled_after_completion();
                };
                let done = settle(&mut this.state, &this.ctx.fiber, token);
                if done.is_ready() {
                    if let Some(scope) = this.armed.take().and_then(|a| a.scope) {
                        scope.release();
                    }
                }
                done
            }
            _ => polled_after_completion(),
        }
    }
}

impl Drop for Wait<'_> {
    fn drop(&mut self) {
        let Some(armed) = self.armed.take() else { return };
        armed.handle.remove_waiter(self.mode, armed.waiter);
        if let Some(scope) = armed.scope {
            scope.release();
        }
        self.ctx.fiber.disarm(armed.token);
    }
}

// ---- sleep ----------------------------------------------------------------

struct ArmedSleep {
    token: SuspendToken,
    timer: TimerHandle,
    reactor: Rc<dyn Reactor>,
    scope: Option<ScopeEntry>,
}

/// Future returned by [`FiberCtx::sleep`]
#[must_use = "primitives do nothing unless awaited"]
pub struct Sleep<'a> {
    ctx: &'a FiberCtx,
    duration: Option<Duration>,
    state: SuspendState,
    armed: Option<ArmedSleep>,
}

impl Sleep<'_> {
    fn arm(&mut self, duration: Duration) -> NbResult<()> {
        let sched = self.ctx.suspend_point()?;
        let fiber = &self.ctx.fiber;
        let token = sched.next_token();
        let (weak_sched, weak_fiber) = (self.ctx.sched.clone(), Rc::downgrade(fiber));
        // Sleep timers resume directly; the token check makes a
        // timeout-claimed sleep a no-op
        let timer = sched.reactor().add_timer(
            duration,
            Box::new(move || {
                if let (Some(sched), Some(fiber)) = (weak_sched.upgrade(), weak_fiber.upgrade()) {
                    sched.resume(&fiber, token, Wakeup::Ready);
                }
            }),
        );
        fiber.arm(token);
        let scope = ScopeEntry::register(fiber, Registration::SleepTimer(timer));
        self.armed = Some(ArmedSleep {
            token,
            timer,
            reactor: sched.reactor_rc(),
            scope,
        });
        Ok(())
    }
}

impl Future for Sleep<'_> {
    type Output = NbResult<()>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match this.state {
            SuspendState::Idle => {
                let Some(duration) = this.duration else {
                    this.state = SuspendState::Resumed;
                    return Poll::Ready(Ok(()));
                };
                match this.arm(duration) {
                    Ok(()) => {
                        transition(&mut this.state, SuspendState::Armed);
                        Poll::Pending
                    }
                    Err(e) => {
                        this.state = SuspendState::Canceled;
                        Poll::Ready(Err(e))
                    }
                }
            }
            SuspendState::Armed => {
                let Some(token) = this.armed.as_ref().map(|a| a.token) else {
                    return polled_after_completion();
                };
                let done = settle(&mut this.state, &this.ctx.fiber, token);
                if done.is_ready() {
                    if let Some(scope) = this.armed.take().and_then(|a| a.scope) {
                        scope.release();
                    }
                }
                done
            }
            _ => polled_after_completion(),
        }
    }
}

impl Drop for Sleep<'_> {
    fn drop(&mut self) {
        let Some(armed) = self.armed.take() else { return };
        armed.reactor.cancel_timer(armed.timer);
        if let Some(scope) = armed.scope {
            scope.release();
        }
        self.ctx.fiber.disarm(armed.token);
    }
}

// ---- yield ----------------------------------------------------------------

struct ArmedYield {
    token: SuspendToken,
    pending: Rc<Cell<bool>>,
    scope: Option<ScopeEntry>,
}

/// Future returned by [`FiberCtx::yield_now`]
#[must_use = "primitives do nothing unless awaited"]
pub struct YieldNow<'a> {
    ctx: &'a FiberCtx,
    state: SuspendState,
    armed: Option<ArmedYield>,
}

impl YieldNow<'_> {
    fn arm(&mut self) -> NbResult<()> {
        let sched = self.ctx.suspend_point()?;
        let fiber = &self.ctx.fiber;
        let token = sched.next_token();
        let pending = Rc::new(Cell::new(true));

        let (flag, weak_sched, weak_fiber) = (pending.clone(), self.ctx.sched.clone(), Rc::downgrade(fiber));
        sched.deferred.push(Box::new(move || {
            if !flag.replace(false) {
                return;
            }
            if let (Some(sched), Some(fiber)) = (weak_sched.upgrade(), weak_fiber.upgrade()) {
                sched.resume(&fiber, token, Wakeup::Ready);
            }
        }));
        fiber.arm(token);
        let scope = ScopeEntry::register(fiber, Registration::Yield(pending.clone()));
        self.armed = Some(ArmedYield { token, pending, scope });
        Ok(())
    }
}

impl Future for YieldNow<'_> {
    type Output = NbResult<()>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match this.state {
            SuspendState::Idle => match this.arm() {
                Ok(()) => {
                    transition(&mut this.state, SuspendState::Armed);
                    Poll::Pending
                }
                Err(e) => {
                    this.state = SuspendState::Canceled;
                    Poll::Ready(Err(e))
                }
            },
            SuspendState::Armed => {
                let Some(token) = this.armed.as_ref().map(|a| a.token) else {
                    return polled_after_completion();
                };
                let done = settle(&mut this.state, &this.ctx.fiber, token);
                if done.is_ready() {
                    if let Some(scope) = this.armed.take().and_then(|a| a.scope) {
                        scope.release();
                    }
                }
                done
            }
            _ => polled_after_completion(),
        }
    }
}

impl Drop for YieldNow<'_> {
    fn drop(&mut self) {
        let Some(armed) = self.armed.take() else { return };
        armed.pending.set(false);
        if let Some(scope) = armed.scope {
            scope.release();
        }
        self.ctx.fiber.disarm(armed.token);
    }
}
