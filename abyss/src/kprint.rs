//! Kernel print utilities.
//!
//! The console is the host's standard error. [`KernelLogger`] routes the `log`
//! facade onto it with the kernel's `[LEVEL] message` format.

use core::fmt::Write;
use log::{Level, LevelFilter, Log, Metadata, Record};
use spin_lock::SpinLock;

struct Console;

impl Write for Console {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        use std::io::Write as _;
        std::io::stderr()
            .write_all(s.as_bytes())
            .map_err(|_| core::fmt::Error)
    }
}

static CONSOLE: SpinLock<Console> = SpinLock::new(Console);

#[doc(hidden)]
pub fn _print(fmt: core::fmt::Arguments<'_>) {
    let _ = write!(&mut *CONSOLE.lock(), "{}", fmt);
}

/// Prints out the message.
///
/// Use the format! syntax to write data to the console.
/// This first holds the lock for console device.
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::kprint::_print(format_args!($($arg)*)));
}

/// Prints out the message with a newline.
///
/// Use the format! syntax to write data to the console.
/// This first holds the lock for console device.
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

/// Backend of the `log` facade.
pub struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

fn tag(level: Level) -> &'static str {
    match level {
        Level::Error => "ERROR",
        Level::Warn => "WARNING",
        Level::Info => "INFO",
        Level::Debug => "DEBUG",
        Level::Trace => "TRACE",
    }
}

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if self.enabled(record.metadata()) {
            _print(format_args!(
                "[{}] {}\n",
                tag(record.level()),
                record.args()
            ));
        }
    }

    fn flush(&self) {}
}

/// Install [`KernelLogger`] and set the maximum level.
///
/// A logger can only be installed once per process; later calls only adjust
/// the level.
pub fn init(level: LevelFilter) {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}
