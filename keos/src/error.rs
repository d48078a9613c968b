//! Recoverable kernel errors.
//!
//! Broken contracts (blocking inside an interrupt handler, releasing a lock
//! the caller does not hold, ...) are not errors: they panic, and a panic on a
//! kernel thread halts the machine.
use alloc::string::String;
use core::fmt;

/// Possible error kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    /// No room for another thread control block.
    OutOfMemory,
    /// The kernel command line carries an option the kernel does not know.
    InvalidOption(String),
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::InvalidOption(opt) => write!(f, "unknown option `{}`", opt),
        }
    }
}

impl std::error::Error for KernelError {}
