//! Leveled stderr logging for the runtime.
//!
//! Thread-safe, context-aware diagnostics in the style of a kernel log.
//! Each line carries the current runtime id so interleaved output from
//! multiple event loops stays attributable.
//!
//! # Environment variables
//!
//! - `OURO_LOG_LEVEL=<level>` - 0=off, 1=error, 2=warn, 3=info, 4=debug,
//!   5=trace (names also accepted)
//! - `OURO_LOG_FLUSH=1` - flush stderr after each line (crash debugging)
//! - `OURO_LOG_TIME=1` - prefix lines with nanoseconds since startup
//!
//! # Output format
//!
//! `[LEVEL] [r<runtime>] message`, e.g. `[DEBUG] [r0] reaped 12 completions`
//! or `[WARN]  [r-] notify failed` when no runtime is current.

use crate::env::env_get_bool;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Instant;

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
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Off,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            LogLevel::Off => "",
            LogLevel::Error => "[ERROR]",
            LogLevel::Warn => "[WARN] ",
            LogLevel::Info => "[INFO] ",
            LogLevel::Debug => "[DEBUG]",
            LogLevel::Trace => "[TRACE]",
        }
    }
}

static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Warn as u8);
static FLUSH_ENABLED: AtomicBool = AtomicBool::new(false);
static TIME_ENABLED: AtomicBool = AtomicBool::new(false);
static INITIALIZED: AtomicBool = AtomicBool::new(false);

static START_TIME: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();

thread_local! {
    static RUNTIME_ID: std::cell::Cell<Option<u32>> = const { std::cell::Cell::new(None) };
}

/// Initialize from the environment. Happens automatically on first use; an
/// explicit call makes initialization deterministic.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }
    START_TIME.get_or_init(Instant::now);
    FLUSH_ENABLED.store(env_get_bool("OURO_LOG_FLUSH", false), Ordering::Relaxed);
    TIME_ENABLED.store(env_get_bool("OURO_LOG_TIME", false), Ordering::Relaxed);
    if let Ok(val) = std::env::var("OURO_LOG_LEVEL") {
        let level = match val.to_lowercase().as_str() {
            "off" | "0" => LogLevel::Off,
            "error" | "1" => LogLevel::Error,
            "warn" | "2" => LogLevel::Warn,
            "info" | "3" => LogLevel::Info,
            "debug" | "4" => LogLevel::Debug,
            "trace" | "5" => LogLevel::Trace,
            _ => LogLevel::Warn,
        };
        LOG_LEVEL.store(level as u8, Ordering::Relaxed);
    }
}

#[inline]
pub fn log_level() -> LogLevel {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

pub fn set_log_level(level: LogLevel) {
    INITIALIZED.store(true, Ordering::SeqCst);
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

#[inline]
pub fn level_enabled(level: LogLevel) -> bool {
    level as u8 <= log_level() as u8
}

/// Elapsed nanoseconds since logging startup.
#[inline]
pub fn elapsed_ns() -> u64 {
    START_TIME.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

/// Install the runtime id context tag for this thread. Called by
/// `Runtime::run` on entry.
pub fn set_runtime_id(id: u32) {
    RUNTIME_ID.with(|c| c.set(Some(id)));
}

/// Clear the runtime id context tag. Called by `Runtime::run` on exit.
pub fn clear_runtime_id() {
    RUNTIME_ID.with(|c| c.set(None));
}

pub fn runtime_id() -> Option<u32> {
    RUNTIME_ID.with(|c| c.get())
}

#[doc(hidden)]
pub fn _olog_impl(level: LogLevel, args: std::fmt::Arguments<'_>) {
    if !level_enabled(level) {
        return;
    }
    let stderr = std::io::stderr();
    let mut handle = stderr.lock();
    let _ = write!(handle, "{} ", level.prefix());
    if TIME_ENABLED.load(Ordering::Relaxed) {
        let _ = write!(handle, "[{}] ", elapsed_ns());
    }
    match runtime_id() {
        Some(id) => {
            let _ = write!(handle, "[r{}] ", id);
        }
        None => {
            let _ = write!(handle, "[r-] ");
        }
    }
    let _ = handle.write_fmt(args);
    let _ = handle.write_all(b"\n");
    if FLUSH_ENABLED.load(Ordering::Relaxed) {
        let _ = handle.flush();
    }
}

/// Error level log with runtime context.
#[macro_export]
macro_rules! oerror {
    ($($arg:tt)*) => {{
        $crate::olog::_olog_impl($crate::olog::LogLevel::Error, format_args!($($arg)*));
    }};
}

/// Warning level log with runtime context.
#[macro_export]
macro_rules! owarn {
    ($($arg:tt)*) => {{
        $crate::olog::_olog_impl($crate::olog::LogLevel::Warn, format_args!($($arg)*));
    }};
}

/// Info level log with runtime context.
#[macro_export]
macro_rules! oinfo {
    ($($arg:tt)*) => {{
        $crate::olog::_olog_impl($crate::olog::LogLevel::Info, format_args!($($arg)*));
    }};
}

/// Debug level log with runtime context.
#[macro_export]
macro_rules! odebug {
    ($($arg:tt)*) => {{
        $crate::olog::_olog_impl($crate::olog::LogLevel::Debug, format_args!($($arg)*));
    }};
}

/// Trace level log with runtime context.
#[macro_export]
macro_rules! otrace {
    ($($arg:tt)*) => {{
        $crate::olog::_olog_impl($crate::olog::LogLevel::Trace, format_args!($($arg)*));
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(LogLevel::Error < LogLevel::Warn);
        assert!(LogLevel::Warn < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Debug);
        assert!(LogLevel::Debug < LogLevel::Trace);
    }

    #[test]
    fn test_level_from_u8_saturates() {
        assert_eq!(LogLevel::from_u8(0), LogLevel::Off);
        assert_eq!(LogLevel::from_u8(3), LogLevel::Info);
        assert_eq!(LogLevel::from_u8(200), LogLevel::Trace);
    }

    #[test]
    fn test_runtime_context() {
        assert_eq!(runtime_id(), None);
        set_runtime_id(4);
        assert_eq!(runtime_id(), Some(4));
        clear_runtime_id();
        assert_eq!(runtime_id(), None);
    }

    #[test]
    fn test_macros_compile() {
        set_log_level(LogLevel::Off);
        oerror!("error {}", 1);
        owarn!("warn");
        oinfo!("info");
        odebug!("debug {:?}", "x");
        otrace!("trace");
    }
}
