//! # noblock - cooperative fibers over a single-threaded reactor
//!
//! A fixed pool of fibers runs tasks on one thread. Tasks suspend only at
//! explicit points (`wait`, `sleep`, `yield_now`) and any suspension can be
//! interrupted by an enclosing timeout scope.
//!
//! ## Features
//!
//! - **Bounded concurrency**: N pooled fibers, excess work queued FIFO
//! - **Readiness multiplexing**: one handle per descriptor, FIFO waiters per mode
//! - **Nested timeouts**: cancel from the firing scope upward, with typed kinds
//! - **Single resume**: every suspension is resumed at most once
//! - **Adapters**: non-blocking streams, TCP connect/accept, buffered reads
//!
//! ## Quick Start
//!
//! ```ignore
//! use noblock::{Runtime, RuntimeConfig, TimeoutKind};
//! use std::time::Duration;
//!
//! fn main() -> noblock::NbResult<()> {
//!     let rt = Runtime::new(RuntimeConfig::from_env())?;
//!     rt.block_on(|ctx| async move {
//!         ctx.spawn(|ctx| async move {
//!             ctx.sleep(Duration::from_millis(10)).await?;
//!             println!("hello from fiber {}", ctx.id());
//!             Ok(())
//!         });
//!         let slow = ctx.with_timeout(Duration::from_millis(5), TimeoutKind::GENERIC, async {
//!             ctx.sleep(Duration::from_secs(1)).await
//!         });
//!         assert!(slow.await.is_err());
//!         Ok(())
//!     })
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 User Code / noblock::io                     │
//! │        spawn(), wait(), sleep(), yield_now(), timeouts      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Scheduler                              │
//! │   fiber pool + backlog, readiness handles, timeout scopes   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//!    ┌───────────┐      ┌───────────┐      ┌───────────┐
//!    │ Deferred  │      │  Timers   │      │ Readiness │
//!    │  Queue    │      │  (heap)   │      │ (epoll)   │
//!    └───────────┘      └───────────┘      └───────────┘
//!          │                   │                   │
//!          └───────────────────┼───────────────────┘
//!                              ▼
//!    ┌─────────────────────────────────────────────────────────┐
//!    │                     EventLoop                           │
//!    │   poll -> remote -> I/O -> timers -> next-tick queue    │
//!    └─────────────────────────────────────────────────────────┘
//! ```

pub mod io;

use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;

// Re-export core types
pub use noblock_core::{
    FiberId,
    Interest,
    NbError,
    NbResult,
    SuspendState,
    TaskFailure,
    TimeoutKind,
    WaitMode,
};

// Re-export kprint macros for debug logging
pub use noblock_core::{kprint, kprintln, kerror, kwarn, kinfo, kdebug, ktrace};
pub use noblock_core::kprint::{LogLevel, init as init_logging, set_log_level, set_flush_enabled};

// Re-export env utilities
pub use noblock_core::{env_get, env_get_bool, env_get_opt, env_get_str, env_is_set};

// Re-export runtime types
pub use noblock_runtime::{
    EventLoop,
    FiberCtx,
    LoopStats,
    PoolStats,
    Reactor,
    RemoteHandle,
    RuntimeConfig,
    Scheduler,
    SchedulerRef,
    Spawned,
};

/// An event loop plus the scheduler running on it.
///
/// Everything lives on the creating thread; other threads reach the loop
/// through [`remote`](Self::remote).
pub struct Runtime {
    event_loop: Rc<EventLoop>,
    scheduler: Scheduler,
}

impl Runtime {
    /// Build the loop and the fiber pool. Initializes logging from the
    /// environment.
    pub fn new(config: RuntimeConfig) -> NbResult<Self> {
        noblock_core::kprint::init();
        let event_loop = EventLoop::new(&config)?;
        let reactor: Rc<dyn Reactor> = event_loop.clone();
        let scheduler = Scheduler::new(reactor, config)?;
        kdebug!("runtime ready (backend={})", event_loop.backend_name());
        Ok(Self { event_loop, scheduler })
    }

    /// Run `f` as a task once the loop is running, drive the loop until it
    /// goes idle or is stopped, and return the task's result.
    ///
    /// Fails with `InvalidUsage` if the loop returned before the task
    /// finished.
    pub fn block_on<F, Fut, T>(&self, f: F) -> NbResult<T>
    where
        F: FnOnce(FiberCtx) -> Fut + 'static,
        Fut: Future<Output = NbResult<T>> + 'static,
        T: 'static,
    {
        let slot: Rc<RefCell<Option<NbResult<T>>>> = Rc::new(RefCell::new(None));
        let (out, sched) = (slot.clone(), self.scheduler.downgrade());
        self.event_loop.next_tick(Box::new(move || {
            let Some(sched) = sched.upgrade() else { return };
            sched.spawn(move |ctx| async move {
                let result = f(ctx).await;
                *out.borrow_mut() = Some(result);
                Ok(())
            });
        }));

        self.event_loop.run()?;
        let result = slot.borrow_mut().take();
        result.unwrap_or(Err(NbError::InvalidUsage("event loop returned before the task finished")))
    }

    /// Submit a task; it starts immediately if a fiber is idle
    pub fn spawn<F, Fut>(&self, f: F) -> Spawned
    where
        F: FnOnce(FiberCtx) -> Fut + 'static,
        Fut: Future<Output = NbResult<()>> + 'static,
    {
        self.scheduler.spawn(f)
    }

    /// Drive the loop until it goes idle or is stopped
    pub fn run(&self) -> NbResult<()> {
        self.event_loop.run()?;
        Ok(())
    }

    /// Stop the loop after the current pass
    pub fn stop(&self) {
        self.event_loop.stop();
    }

    /// Route task failures somewhere other than the log
    pub fn on_task_failure<H>(&self, handler: H)
    where
        H: FnMut(TaskFailure) + 'static,
    {
        self.event_loop.set_error_handler(handler);
    }

    pub fn remote(&self) -> RemoteHandle {
        self.event_loop.remote()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn event_loop(&self) -> &Rc<EventLoop> {
        &self.event_loop
    }

    pub fn stats(&self) -> PoolStats {
        self.scheduler.stats()
    }

    /// Drop queued and suspended tasks and release every descriptor
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}
