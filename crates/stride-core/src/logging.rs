//! Tagged diagnostic log.
//!
//! `tlog!` lines go to `tracing` and, once `set_log_path` has been called,
//! are appended to a plain-text file the host app can ship with bug reports.

use std::io::Write;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Instant;

use parking_lot::Mutex;

static START_TIME: OnceLock<Instant> = OnceLock::new();
static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();
static LOG_LOCK: Mutex<()> = parking_lot::const_mutex(());

/// Set the log file path. Only the first call has an effect.
pub fn set_log_path(path: PathBuf) {
    let _ = LOG_PATH.set(path);
}

pub fn elapsed_ms() -> u64 {
    START_TIME.get_or_init(Instant::now).elapsed().as_millis() as u64
}

pub fn log_line(tag: &str, msg: &str) {
    if tag == "ERROR" {
        tracing::warn!(tag, "{}", msg);
    } else {
        tracing::debug!(tag, "{}", msg);
    }

    let Some(path) = LOG_PATH.get() else {
        return;
    };
    let _guard = LOG_LOCK.lock();
    if let Ok(mut file) = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
    {
        let _ = writeln!(file, "[{:>8}ms] [{}] {}", elapsed_ms(), tag, msg);
    }
}

#[macro_export]
macro_rules! tlog {
    ($tag:expr, $($arg:tt)*) => {
        $crate::logging::log_line($tag, &format!($($arg)*))
    };
}
