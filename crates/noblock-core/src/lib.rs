//! # noblock-core
//!
//! Core types for the noblock fiber scheduler.
//!
//! This crate is platform-agnostic: no reactor, no syscalls. The event loop
//! and the scheduler live in `noblock-runtime`.
//!
//! ## Modules
//!
//! - `id` - fiber ids, suspension tokens, scope and waiter ids
//! - `state` - wait modes, reactor interest, suspension state machine
//! - `error` - error types and timeout kinds
//! - `kprint` - kernel-style debug printing macros
//! - `env` - environment variable utilities

pub mod id;
pub mod state;
pub mod error;
pub mod kprint;
pub mod env;

// Re-exports for convenience
pub use id::{FiberId, ScopeId, Serial, SuspendToken, WaiterId};
pub use state::{Interest, SuspendState, WaitMode};
pub use error::{NbError, NbResult, TaskFailure, TimeoutKind};
pub use env::{env_get, env_get_bool, env_get_millis, env_get_opt, env_get_str, env_is_set};

/// Scheduler-wide constants
pub mod constants {
    /// Default number of pooled fibers
    pub const DEFAULT_POOL_SIZE: usize = 50;

    /// Upper bound on the pool size accepted by config validation
    pub const MAX_POOL_SIZE: usize = 1 << 20;

    /// Readiness events fetched per poll
    pub const DEFAULT_MAX_EVENTS: usize = 256;

    /// Deferred queue length that triggers a backlog warning
    pub const DEFAULT_DEFERRED_WARN: usize = 10_000;
}
