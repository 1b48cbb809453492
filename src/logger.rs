//! Pluggable line logger.
//!
//! Grounded on the original loader's `Common/Logger.h`: a single backend
//! pointer, installed once at firmware entry through [`set_backend`], with
//! `log!`/`logln!`/`warnln!`/`errorln!` macros formatting into a small
//! on-stack buffer before handing the text to the backend. Calling the
//! macros before a backend is installed is a no-op, matching the design
//! note that the core must tolerate `set_backend(None)`.

use core::fmt::Write;

use conquer_once::spin::OnceCell;
use spin::Mutex;

/// Severity of a logged line. Purely advisory — a backend may use it to
/// pick a color or a prefix, or ignore it entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Warn,
    Error,
}

/// A sink capable of displaying/forwarding log text.
///
/// Implemented by whatever the firmware entry point wires up (VGA text
/// mode, a VESA framebuffer, a serial console, ...). The core never
/// constructs a backend itself.
pub trait LoggerBackend: Send + Sync {
    fn write_line(&self, level: Level, text: &str);
}

static BACKEND: OnceCell<Mutex<Option<&'static dyn LoggerBackend>>> = OnceCell::uninit();

fn backend_cell() -> &'static Mutex<Option<&'static dyn LoggerBackend>> {
    BACKEND.get_or_init(|| Mutex::new(None))
}

/// Installs the logger backend. Passing `None` reverts to no-op logging.
///
/// This is the single designated writer for the logger's global state; it
/// may be called again later (e.g. once graphics mode is set up, replacing
/// an early serial-only backend) but only ever from a single thread of
/// control, since the loader runs with interrupts disabled and no
/// concurrency.
pub fn set_backend(backend: Option<&'static dyn LoggerBackend>) {
    *backend_cell().lock() = backend;
}

/// Fixed-size formatting buffer; boot-time log lines are always short.
const LINE_BUF_SIZE: usize = 512;

struct LineBuf {
    buf: [u8; LINE_BUF_SIZE],
    len: usize,
}

impl LineBuf {
    const fn new() -> Self {
        Self {
            buf: [0; LINE_BUF_SIZE],
            len: 0,
        }
    }

    fn as_str(&self) -> &str {
        core::str::from_utf8(&self.buf[..self.len]).unwrap_or("<non-utf8 log line>")
    }
}

impl Write for LineBuf {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let remaining = LINE_BUF_SIZE - self.len;
        let to_copy = remaining.min(s.len());
        self.buf[self.len..self.len + to_copy].copy_from_slice(&s.as_bytes()[..to_copy]);
        self.len += to_copy;
        Ok(())
    }
}

#[doc(hidden)]
pub fn log_args(level: Level, args: core::fmt::Arguments<'_>) {
    let Some(backend) = *backend_cell().lock() else {
        return;
    };

    let mut line = LineBuf::new();
    let _ = line.write_fmt(args);
    backend.write_line(level, line.as_str());
}

#[doc(hidden)]
pub fn errorln_args(args: core::fmt::Arguments<'_>) {
    log_args(Level::Error, args);
}

/// Logs an informational line, without a trailing newline being implied.
#[macro_export]
macro_rules! log {
    ($($arg:tt)*) => {
        $crate::logger::log_args($crate::logger::Level::Info, format_args!($($arg)*))
    };
}

/// Logs an informational line.
#[macro_export]
macro_rules! logln {
    ($($arg:tt)*) => {
        $crate::logger::log_args($crate::logger::Level::Info, format_args!($($arg)*))
    };
}

/// Logs a warning line.
#[macro_export]
macro_rules! warnln {
    ($($arg:tt)*) => {
        $crate::logger::log_args($crate::logger::Level::Warn, format_args!($($arg)*))
    };
}

/// Logs an error line.
#[macro_export]
macro_rules! errorln {
    ($($arg:tt)*) => {
        $crate::logger::log_args($crate::logger::Level::Error, format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;
    use alloc::string::String;
    use alloc::sync::Arc;
    use spin::Mutex as SpinMutex;

    struct CapturingBackend {
        lines: Arc<SpinMutex<alloc::vec::Vec<String>>>,
    }

    impl LoggerBackend for CapturingBackend {
        fn write_line(&self, _level: Level, text: &str) {
            self.lines.lock().push(String::from(text));
        }
    }

    #[test]
    fn logging_without_backend_is_a_noop() {
        set_backend(None);
        log_args(Level::Info, format_args!("hello {}", 1));
    }

    #[test]
    fn backend_receives_formatted_line() {
        let lines = Arc::new(SpinMutex::new(alloc::vec::Vec::new()));
        let backend = Box::leak(Box::new(CapturingBackend {
            lines: lines.clone(),
        }));
        set_backend(Some(backend));

        log_args(Level::Warn, format_args!("disk {} missing", 2));

        assert_eq!(lines.lock()[0], "disk 2 missing");
        set_backend(None);
    }

    #[test]
    fn line_buffer_truncates_overlong_messages() {
        let mut line = LineBuf::new();
        let long = "a".repeat(LINE_BUF_SIZE * 2);
        let _ = line.write_str(&long);
        assert_eq!(line.len, LINE_BUF_SIZE);
    }
}
