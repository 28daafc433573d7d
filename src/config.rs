//! Runtime configuration.
//!
//! A [`RuntimeConfig`] is fixed when the runtime of an OS thread is
//! initialized. Lazy initialization reads it from the environment with
//! [`RuntimeConfig::from_env`].

use crate::errors::{SpawnError, ThreadResult, TimerError};
use core::time::Duration;

/// Smallest accepted stack size in bytes.
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// Default stack size in bytes.
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;

/// Default scheduling quantum.
pub const DEFAULT_QUANTUM: Duration = Duration::from_millis(10);

/// Default number of released stacks kept for reuse.
pub const DEFAULT_STACK_CACHE: usize = 8;

/// How quantum expiry is detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerMode {
    /// A process-wide `ITIMER_PROF` interval timer raises SIGPROF, whose
    /// handler sets a flag consumed at preemption points.
    Signal,
    /// Preemption points compare the monotonic clock against the deadline
    /// of the current quantum.
    Deadline,
    /// No preemption; threads switch only when they yield or block.
    Cooperative,
}

impl TimerMode {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "signal" => Some(TimerMode::Signal),
            "deadline" => Some(TimerMode::Deadline),
            "cooperative" | "off" => Some(TimerMode::Cooperative),
            _ => None,
        }
    }
}

/// Configuration of one runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Size in bytes of every spawned thread's stack
    pub stack_size: usize,
    /// Length of one time slice
    pub quantum: Duration,
    /// Preemption source
    pub timer: TimerMode,
    /// Released stacks kept for reuse instead of being freed
    pub stack_cache: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            quantum: DEFAULT_QUANTUM,
            timer: TimerMode::Signal,
            stack_cache: DEFAULT_STACK_CACHE,
        }
    }
}

impl RuntimeConfig {
    /// Default configuration without preemption.
    pub fn cooperative() -> Self {
        Self::default().with_timer(TimerMode::Cooperative)
    }

    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    pub fn with_quantum(mut self, quantum: Duration) -> Self {
        self.quantum = quantum;
        self
    }

    pub fn with_timer(mut self, timer: TimerMode) -> Self {
        self.timer = timer;
        self
    }

    pub fn with_stack_cache(mut self, stack_cache: usize) -> Self {
        self.stack_cache = stack_cache;
        self
    }

    /// Check that the configuration can be used to start a runtime.
    pub fn validate(&self) -> ThreadResult<()> {
        if self.stack_size < MIN_STACK_SIZE {
            return Err(SpawnError::InvalidStackSize(self.stack_size).into());
        }
        if self.timer != TimerMode::Cooperative && self.quantum.is_zero() {
            return Err(TimerError::InvalidQuantum.into());
        }
        Ok(())
    }

    /// Build a configuration from the defaults overridden by environment
    /// variables.
    ///
    /// | variable | meaning |
    /// | --- | --- |
    /// | `GREEN_STACK_SIZE` | stack size in bytes |
    /// | `GREEN_QUANTUM_US` | quantum in microseconds |
    /// | `GREEN_TIMER` | `signal`, `deadline` or `cooperative` |
    /// | `GREEN_STACK_CACHE` | number of cached stacks |
    ///
    /// Values that fail to parse are ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(size) = parse_var(&lookup, "GREEN_STACK_SIZE", |v| v.parse::<usize>().ok()) {
            config.stack_size = size;
        }
        if let Some(us) = parse_var(&lookup, "GREEN_QUANTUM_US", |v| v.parse::<u64>().ok()) {
            config.quantum = Duration::from_micros(us);
        }
        if let Some(timer) = parse_var(&lookup, "GREEN_TIMER", TimerMode::parse) {
            config.timer = timer;
        }
        if let Some(cache) = parse_var(&lookup, "GREEN_STACK_CACHE", |v| v.parse::<usize>().ok()) {
            config.stack_cache = cache;
        }

        config
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Option<T> {
    let raw = lookup(key)?;
    let parsed = parse(raw.trim());
    if parsed.is_none() {
        log::warn!("ignoring {}={:?}: not a valid value", key, raw);
    }
    parsed
}
