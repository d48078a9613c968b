//! Boot-time configuration of the kernel.
use crate::KernelError;
use alloc::string::String;
use log::LevelFilter;

/// Kernel configuration, fixed at [`boot`].
///
/// [`boot`]: crate::boot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Use the multi-level feedback queue scheduler instead of priority
    /// donation.
    pub mlfqs: bool,
    /// Number of timer ticks a thread may run before it is preempted.
    pub time_slice: u32,
    /// Timer interrupts per second.
    pub timer_freq: u32,
    /// Maximum number of live threads, the initial and idle threads included.
    pub max_threads: usize,
    /// Most verbose log level printed on the console.
    pub log_level: LevelFilter,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mlfqs: false,
            time_slice: 4,
            timer_freq: 100,
            max_threads: 512,
            log_level: LevelFilter::Warn,
        }
    }
}

impl Config {
    /// Turn the feedback queue scheduler on or off.
    pub fn mlfqs(mut self, on: bool) -> Self {
        self.mlfqs = on;
        self
    }

    /// Set the time slice in ticks.
    pub fn time_slice(mut self, ticks: u32) -> Self {
        assert!(ticks > 0, "time slice must be at least one tick");
        self.time_slice = ticks;
        self
    }

    /// Set the timer frequency in Hz.
    pub fn timer_freq(mut self, hz: u32) -> Self {
        assert!(
            (19..=1000).contains(&hz),
            "timer frequency must be within 19..=1000 Hz"
        );
        self.timer_freq = hz;
        self
    }

    /// Bound the number of live threads.
    pub fn max_threads(mut self, n: usize) -> Self {
        self.max_threads = n;
        self
    }

    /// Set the console log level.
    pub fn log_level(mut self, level: LevelFilter) -> Self {
        self.log_level = level;
        self
    }

    /// Parse the kernel command line on top of the defaults.
    ///
    /// `-o mlfqs` selects the feedback queue scheduler. `-q` (power off when
    /// done) is accepted and ignored; there is nothing to power off.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::InvalidOption`] for anything else.
    pub fn from_cmdline(cmdline: &str) -> Result<Self, KernelError> {
        let mut config = Self::default();
        let mut args = cmdline.split_whitespace();
        while let Some(arg) = args.next() {
            match arg {
                "-o" => match args.next() {
                    Some("mlfqs") => config.mlfqs = true,
                    Some(other) => {
                        log::warn!("unknown option `-o {}`", other);
                        return Err(KernelError::InvalidOption(alloc::format!("-o {}", other)));
                    }
                    None => return Err(KernelError::InvalidOption(String::from("-o"))),
                },
                "-q" => (),
                other => {
                    log::warn!("unknown option `{}`", other);
                    return Err(KernelError::InvalidOption(String::from(other)));
                }
            }
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cmdline() {
        assert_eq!(Config::from_cmdline("").unwrap(), Config::default());
        assert!(Config::from_cmdline("-q -o mlfqs").unwrap().mlfqs);
        assert_eq!(
            Config::from_cmdline("-o fifo"),
            Err(KernelError::InvalidOption(String::from("-o fifo")))
        );
        assert_eq!(
            Config::from_cmdline("-o"),
            Err(KernelError::InvalidOption(String::from("-o")))
        );
        assert_eq!(
            Config::from_cmdline("-ul=4"),
            Err(KernelError::InvalidOption(String::from("-ul=4")))
        );
    }

    #[test]
    fn builder() {
        let config = Config::default().mlfqs(true).time_slice(2).max_threads(8);
        assert!(config.mlfqs);
        assert_eq!(config.time_slice, 2);
        assert_eq!(config.max_threads, 8);
        assert_eq!(config.timer_freq, 100);
    }
}
