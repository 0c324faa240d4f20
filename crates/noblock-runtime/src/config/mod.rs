//! Runtime configuration
//!
//! Compile-time defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder calls
//! 2. Environment variables (`from_env`)
//! 3. Library defaults (`defaults` module)
//!
//! # Example
//!
//! ```rust,ignore
//! use noblock_runtime::config::RuntimeConfig;
//!
//! let config = RuntimeConfig::from_env()
//!     .pool_size(8)
//!     .fair_handoff(true);
//! config.validate()?;
//! ```

pub mod defaults;

use std::time::Duration;

use noblock_core::constants::MAX_POOL_SIZE;
use noblock_core::env::{env_get, env_get_bool, env_get_millis};
use noblock_core::NbError;

/// Scheduler and event loop configuration with builder pattern.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Number of pooled fibers (max concurrently running tasks)
    pub pool_size: usize,
    /// Defer backlog pickup by one pass after a task completes
    pub fair_handoff: bool,
    /// Initial non-blocking flag for each task
    pub neverblock: bool,
    /// Readiness events fetched per poll
    pub max_events: usize,
    /// Cap on a single blocking wait for readiness
    pub max_poll_interval: Duration,
    /// Initial timer heap capacity
    pub timer_capacity: usize,
    /// Deferred queue length that triggers a warning
    pub deferred_warn: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl RuntimeConfig {
    /// Library defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `NB_POOL_SIZE` - fibers in the pool
    /// - `NB_FAIR_HANDOFF` - defer backlog pickup (0/1)
    /// - `NB_NEVERBLOCK` - initial non-blocking flag (0/1)
    /// - `NB_MAX_EVENTS` - readiness events per poll
    /// - `NB_MAX_POLL_MS` - longest single readiness wait
    /// - `NB_TIMER_CAPACITY` - initial timer heap capacity
    /// - `NB_DEFERRED_WARN` - deferred queue warning threshold
    pub fn from_env() -> Self {
        Self {
            pool_size: env_get("NB_POOL_SIZE", defaults::POOL_SIZE),
            fair_handoff: env_get_bool("NB_FAIR_HANDOFF", defaults::FAIR_HANDOFF),
            neverblock: env_get_bool("NB_NEVERBLOCK", defaults::NEVERBLOCK),
            max_events: env_get("NB_MAX_EVENTS", defaults::MAX_EVENTS),
            max_poll_interval: env_get_millis(
                "NB_MAX_POLL_MS",
                Duration::from_millis(defaults::MAX_POLL_MS),
            ),
            timer_capacity: env_get("NB_TIMER_CAPACITY", defaults::TIMER_CAPACITY),
            deferred_warn: env_get("NB_DEFERRED_WARN", defaults::DEFERRED_WARN),
        }
    }

    /// Library defaults only, no environment lookups. Used by tests.
    pub fn new() -> Self {
        Self {
            pool_size: defaults::POOL_SIZE,
            fair_handoff: defaults::FAIR_HANDOFF,
            neverblock: defaults::NEVERBLOCK,
            max_events: defaults::MAX_EVENTS,
            max_poll_interval: Duration::from_millis(defaults::MAX_POLL_MS),
            timer_capacity: defaults::TIMER_CAPACITY,
            deferred_warn: defaults::DEFERRED_WARN,
        }
    }

    // Builder methods

    pub fn pool_size(mut self, n: usize) -> Self {
        self.pool_size = n;
        self
    }

    pub fn fair_handoff(mut self, enable: bool) -> Self {
        self.fair_handoff = enable;
        self
    }

    pub fn neverblock(mut self, enable: bool) -> Self {
        self.neverblock = enable;
        self
    }

    pub fn max_events(mut self, n: usize) -> Self {
        self.max_events = n;
        self
    }

    pub fn max_poll_interval(mut self, d: Duration) -> Self {
        self.max_poll_interval = d;
        self
    }

    pub fn timer_capacity(mut self, cap: usize) -> Self {
        self.timer_capacity = cap;
        self
    }

    pub fn deferred_warn(mut self, len: usize) -> Self {
        self.deferred_warn = len;
        self
    }

    /// Validate configuration and return errors if invalid.
    pub fn validate(&self) -> Result<(), NbError> {
        if self.pool_size == 0 {
            return Err(NbError::InvalidConfig("pool_size must be > 0"));
        }
        if self.pool_size > MAX_POOL_SIZE {
            return Err(NbError::InvalidConfig("pool_size must be <= 1048576"));
        }
        if self.max_events == 0 {
            return Err(NbError::InvalidConfig("max_events must be > 0"));
        }
        if self.max_poll_interval.is_zero() {
            return Err(NbError::InvalidConfig("max_poll_interval must be > 0"));
        }
        Ok(())
    }

    /// Print configuration (for debugging)
    pub fn print(&self) {
        eprintln!("noblock configuration:");
        eprintln!("  pool_size:          {}", self.pool_size);
        eprintln!("  fair_handoff:       {}", self.fair_handoff);
        eprintln!("  neverblock:         {}", self.neverblock);
        eprintln!("  max_events:         {}", self.max_events);
        eprintln!("  max_poll_interval:  {:?}", self.max_poll_interval);
        eprintln!("  timer_capacity:     {}", self.timer_capacity);
        eprintln!("  deferred_warn:      {}", self.deferred_warn);
    }
}
