//! # noblock-runtime
//!
//! Scheduler and event loop for the noblock fiber runtime.
//!
//! This crate provides:
//! - The `Reactor` contract and `EventLoop` (epoll on Linux, poll(2) elsewhere)
//! - The deferred task queue (one callback per loop pass)
//! - The fiber pool with its FIFO backlog
//! - Per-descriptor readiness handles
//! - Nested timeout scopes
//! - The `wait` / `sleep` / `yield_now` suspension points

pub mod config;
pub mod reactor;
pub mod deferred;
pub mod fiber;
pub mod io_handle;
pub mod timeout;
pub mod scheduler;
pub mod pool;
pub mod primitives;

// Re-exports
pub use config::RuntimeConfig;
pub use deferred::DeferredQueue;
pub use fiber::LocalTask;
pub use pool::{PoolStats, Spawned};
pub use primitives::{FiberCtx, Sleep, Wait, YieldNow};
pub use reactor::{Callback, EventLoop, LoopStats, Reactor, RemoteHandle, TimerHandle, Watcher};
pub use scheduler::{Scheduler, SchedulerRef};
pub use timeout::ScopeStatus;
