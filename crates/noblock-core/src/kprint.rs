//! Leveled stderr logging for the scheduler
//!
//! Every leveled line carries the fiber that was running when it was
//! written, so interleaved fibers can be told apart:
//!
//! ```text
//! [nb DEBUG f3] suspended on fd 7 (read)
//! [nb WARN  --] deferred queue at 10000 callbacks
//! ```
//!
//! Lines are written through one locked stderr handle, so output from
//! remote threads never splits a line.
//!
//! # Environment Variables
//!
//! - `NB_LOG_LEVEL=<level>` - off, error, warn, info, debug, trace (or 0-5)
//! - `NB_FLUSH_EPRINT=1` - flush after every line
//! - `NB_LOG_TIME=1` - prefix lines with milliseconds since logging started

use std::cell::Cell;
use std::fmt;
use std::io::Write;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

use crate::env::{env_get_bool, env_get_opt};
use crate::id::FiberId;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    const ALL: [LogLevel; 6] = [
        LogLevel::Off,
        LogLevel::Error,
        LogLevel::Warn,
        LogLevel::Info,
        LogLevel::Debug,
        LogLevel::Trace,
    ];

    /// Saturates at `Trace`
    pub fn from_u8(v: u8) -> Self {
        Self::ALL[usize::from(v).min(Self::ALL.len() - 1)]
    }

    pub fn label(self) -> &'static str {
        match self {
            LogLevel::Off => "OFF",
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.label())
    }
}

impl FromStr for LogLevel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(n) = s.parse::<u8>() {
            return if n <= 5 { Ok(Self::from_u8(n)) } else { Err(()) };
        }
        if s.eq_ignore_ascii_case("warning") {
            return Ok(LogLevel::Warn);
        }
        Self::ALL
            .into_iter()
            .find(|l| l.label().eq_ignore_ascii_case(s))
            .ok_or(())
    }
}

struct Settings {
    level: AtomicU8,
    flush: AtomicBool,
    timed: AtomicBool,
    epoch: Instant,
}

static SETTINGS: OnceLock<Settings> = OnceLock::new();

thread_local! {
    static RUNNING: Cell<FiberId> = const { Cell::new(FiberId::NONE) };
}

fn settings() -> &'static Settings {
    SETTINGS.get_or_init(|| Settings {
        level: AtomicU8::new(
            env_get_opt::<LogLevel>("NB_LOG_LEVEL").unwrap_or(LogLevel::Info) as u8,
        ),
        flush: AtomicBool::new(env_get_bool("NB_FLUSH_EPRINT", false)),
        timed: AtomicBool::new(env_get_bool("NB_LOG_TIME", false)),
        epoch: Instant::now(),
    })
}

/// Read the logging environment now instead of on the first line
pub fn init() {
    settings();
}

#[inline]
pub fn log_level() -> LogLevel {
    LogLevel::from_u8(settings().level.load(Ordering::Relaxed))
}

/// Overrides `NB_LOG_LEVEL`
pub fn set_log_level(level: LogLevel) {
    settings().level.store(level as u8, Ordering::Relaxed);
}

pub fn set_flush_enabled(enabled: bool) {
    settings().flush.store(enabled, Ordering::Relaxed);
}

#[inline]
pub fn level_enabled(level: LogLevel) -> bool {
    level != LogLevel::Off && level <= log_level()
}

/// Tag log lines on this thread with `fiber` until the guard drops.
///
/// Nested tags restore the outer fiber.
pub fn tag_fiber(fiber: FiberId) -> FiberTag {
    FiberTag { prev: RUNNING.with(|r| r.replace(fiber)) }
}

pub fn tagged_fiber() -> FiberId {
    RUNNING.with(Cell::get)
}

#[must_use = "the tag is removed when the guard drops"]
pub struct FiberTag {
    prev: FiberId,
}

impl Drop for FiberTag {
    fn drop(&mut self) {
        RUNNING.with(|r| r.set(self.prev));
    }
}

#[doc(hidden)]
pub fn _emit(level: Option<LogLevel>, newline: bool, args: fmt::Arguments<'_>) {
    let s = settings();
    let mut out = std::io::stderr().lock();
    if s.timed.load(Ordering::Relaxed) {
        let _ = write!(out, "{:>8.3} ", s.epoch.elapsed().as_secs_f64() * 1e3);
    }
    if let Some(level) = level {
        let _ = match tagged_fiber() {
            f if f.is_none() => write!(out, "[nb {:<5} --] ", level),
            f => write!(out, "[nb {:<5} f{}] ", level, f),
        };
    }
    let _ = out.write_fmt(args);
    if newline {
        let _ = out.write_all(b"\n");
    }
    if s.flush.load(Ordering::Relaxed) {
        let _ = out.flush();
    }
}

#[doc(hidden)]
#[macro_export]
macro_rules! __klog {
    ($level:ident, $($arg:tt)*) => {{
        let level = $crate::kprint::LogLevel::$level;
        if $crate::kprint::level_enabled(level) {
            $crate::kprint::_emit(Some(level), true, format_args!($($arg)*));
        }
    }};
}

/// Raw stderr print, no level or tag
#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => {
        $crate::kprint::_emit(None, false, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! kprintln {
    () => {
        $crate::kprint::_emit(None, true, format_args!(""))
    };
    ($($arg:tt)*) => {
        $crate::kprint::_emit(None, true, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! kerror { ($($arg:tt)*) => { $crate::__klog!(Error, $($arg)*) }; }

#[macro_export]
macro_rules! kwarn { ($($arg:tt)*) => { $crate::__klog!(Warn, $($arg)*) }; }

#[macro_export]
macro_rules! kinfo { ($($arg:tt)*) => { $crate::__klog!(Info, $($arg)*) }; }

#[macro_export]
macro_rules! kdebug { ($($arg:tt)*) => { $crate::__klog!(Debug, $($arg)*) }; }

/// Resume hot path; compiled in but filtered unless `NB_LOG_LEVEL=trace`
#[macro_export]
macro_rules! ktrace { ($($arg:tt)*) => { $crate::__klog!(Trace, $($arg)*) }; }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_parse() {
        assert_eq!("debug".parse::<LogLevel>(), Ok(LogLevel::Debug));
        assert_eq!(" WARNING ".parse::<LogLevel>(), Ok(LogLevel::Warn));
        assert_eq!("Trace".parse::<LogLevel>(), Ok(LogLevel::Trace));
        assert_eq!("0".parse::<LogLevel>(), Ok(LogLevel::Off));
        assert!("9".parse::<LogLevel>().is_err());
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_from_u8_saturates() {
        assert_eq!(LogLevel::from_u8(1), LogLevel::Error);
        assert_eq!(LogLevel::from_u8(99), LogLevel::Trace);
    }

    #[test]
    fn test_fiber_tags_nest() {
        assert!(tagged_fiber().is_none());
        {
            let _outer = tag_fiber(FiberId::new(2));
            {
                let _inner = tag_fiber(FiberId::new(5));
                assert_eq!(tagged_fiber(), FiberId::new(5));
            }
            assert_eq!(tagged_fiber(), FiberId::new(2));
        }
        assert!(tagged_fiber().is_none());
    }

    #[test]
    fn test_macros_expand() {
        set_log_level(LogLevel::Off);
        assert!(!level_enabled(LogLevel::Error));

        kprint!("raw");
        kprintln!("raw {}", 42);
        kerror!("error {}", "msg");
        kwarn!("warn");
        kinfo!("info");
        kdebug!("debug");
        ktrace!("trace");
    }
}
