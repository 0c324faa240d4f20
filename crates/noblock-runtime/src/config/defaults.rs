//! Compile-time defaults for `RuntimeConfig`

use noblock_core::constants;

/// Fibers in the pool
pub const POOL_SIZE: usize = constants::DEFAULT_POOL_SIZE;

/// Freed fibers pick up backlog work on the next deferred pass
pub const FAIR_HANDOFF: bool = false;

/// Non-blocking flag of a fiber at the start of each task
pub const NEVERBLOCK: bool = true;

/// Readiness events fetched per poll
pub const MAX_EVENTS: usize = constants::DEFAULT_MAX_EVENTS;

/// Longest single wait for readiness, in milliseconds
pub const MAX_POLL_MS: u64 = 500;

/// Initial timer heap capacity
pub const TIMER_CAPACITY: usize = 1024;

/// Deferred queue length that triggers a warning
pub const DEFERRED_WARN: usize = constants::DEFAULT_DEFERRED_WARN;
