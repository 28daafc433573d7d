//! Platform-specific timer implementations for preemptive scheduling
//!
//! Quantum expiry never switches threads from signal context. In
//! [`TimerMode::Signal`] a process-wide `ITIMER_PROF` interval timer raises
//! SIGPROF, whose handler only sets a flag; in [`TimerMode::Deadline`] the
//! runtime compares the monotonic clock against the end of the quantum.
//! Either way the switch happens at the next preemption point, from normal
//! control flow.
//!
//! Each runtime compares the process-wide tick count against the count it
//! saw when its quantum started, so a tick raised before [`PreemptionTimer::arm`]
//! never cuts the next thread's quantum short.

use crate::config::TimerMode;
use crate::errors::TimerError;
use core::sync::atomic::{AtomicU64, Ordering};
use core::time::Duration;
use std::time::Instant;

static PREEMPTION_COUNT: AtomicU64 = AtomicU64::new(0);

/// Signal handler that just counts the tick - actual scheduling happens outside signal context
///
/// # Safety
/// This function is called from signal context and only uses async-signal-safe operations.
/// It only modifies atomic variables and performs no memory allocation or complex operations.
pub unsafe extern "C" fn signal_safe_handler(_sig: libc::c_int) {
    PREEMPTION_COUNT.fetch_add(1, Ordering::AcqRel);
}

/// Get total number of timer ticks received by the process
pub fn get_preemption_count() -> u64 {
    PREEMPTION_COUNT.load(Ordering::Acquire)
}

/// SIGPROF interval timer shared by every runtime of the process.
mod signal_timer {
    use super::signal_safe_handler;
    use crate::errors::TimerError;
    use core::ptr;
    use core::time::Duration;

    const ZERO: libc::timeval = libc::timeval {
        tv_sec: 0,
        tv_usec: 0,
    };

    struct TimerState {
        /// Number of live runtimes using the signal timer
        users: usize,
        interval: libc::timeval,
    }

    static STATE: spin::Mutex<TimerState> = spin::Mutex::new(TimerState {
        users: 0,
        interval: ZERO,
    });

    fn last_errno() -> i32 {
        std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
    }

    fn interval(quantum: Duration) -> Result<libc::timeval, TimerError> {
        let tv = libc::timeval {
            tv_sec: libc::time_t::try_from(quantum.as_secs())
                .map_err(|_| TimerError::InvalidQuantum)?,
            tv_usec: quantum.subsec_micros() as libc::suseconds_t,
        };
        if tv.tv_sec == 0 && tv.tv_usec == 0 {
            return Err(TimerError::InvalidQuantum);
        }
        Ok(tv)
    }

    fn set_interval(tv: libc::timeval) -> Result<(), TimerError> {
        let value = libc::itimerval {
            it_interval: tv,
            it_value: tv,
        };
        // SAFETY: `value` is a valid itimerval and the old value is not requested.
        if unsafe { libc::setitimer(libc::ITIMER_PROF, &value, ptr::null_mut()) } != 0 {
            return Err(TimerError::InstallFailed(last_errno()));
        }
        Ok(())
    }

    fn set_disposition(handler: libc::sighandler_t) -> Result<(), TimerError> {
        // SAFETY: a zeroed sigaction is a valid starting point; every field
        // the kernel reads is set below.
        let mut action: libc::sigaction = unsafe { core::mem::zeroed() };
        action.sa_sigaction = handler;
        action.sa_flags = libc::SA_RESTART;
        // SAFETY: `action` is a valid, exclusively borrowed sigaction.
        unsafe { libc::sigemptyset(&mut action.sa_mask) };
        // SAFETY: `action` is fully initialized.
        if unsafe { libc::sigaction(libc::SIGPROF, &action, ptr::null_mut()) } != 0 {
            return Err(TimerError::InstallFailed(last_errno()));
        }
        Ok(())
    }

    /// Register one more user, starting the timer for the first one.
    ///
    /// The interval of the first user stays in effect for the others.
    pub(super) fn acquire(quantum: Duration) -> Result<(), TimerError> {
        let tv = interval(quantum)?;
        let mut state = STATE.lock();
        if state.users == 0 {
            let handler = signal_safe_handler as unsafe extern "C" fn(libc::c_int);
            set_disposition(handler as libc::sighandler_t)?;
            if let Err(e) = set_interval(tv) {
                let _ = set_disposition(libc::SIG_IGN);
                return Err(e);
            }
            state.interval = tv;
            log::debug!("SIGPROF timer started with a {:?} interval", quantum);
        }
        state.users += 1;
        Ok(())
    }

    /// Reload the interval so the next tick is a full interval away.
    pub(super) fn restart() -> Result<(), TimerError> {
        let state = STATE.lock();
        if state.users == 0 {
            return Ok(());
        }
        set_interval(state.interval)
    }

    /// Drop one user, stopping the timer after the last one.
    pub(super) fn release() {
        let mut state = STATE.lock();
        state.users = state.users.saturating_sub(1);
        if state.users == 0 {
            let value = libc::itimerval {
                it_interval: ZERO,
                it_value: ZERO,
            };
            // SAFETY: a zero itimerval disarms the timer.
            unsafe { libc::setitimer(libc::ITIMER_PROF, &value, ptr::null_mut()) };
            // A signal already in flight must not take the default action,
            // which terminates the process.
            let _ = set_disposition(libc::SIG_IGN);
            state.interval = ZERO;
            log::debug!("SIGPROF timer stopped");
        }
    }
}

/// Keeps the process-wide signal timer running while alive.
#[derive(Debug)]
struct SignalTimerGuard(());

impl SignalTimerGuard {
    fn acquire(quantum: Duration) -> Result<Self, TimerError> {
        signal_timer::acquire(quantum).map(|()| SignalTimerGuard(()))
    }

    fn restart(&self) {
        if let Err(e) = signal_timer::restart() {
            log::warn!("could not restart the SIGPROF timer: {}", e);
        }
    }
}

impl Drop for SignalTimerGuard {
    fn drop(&mut self) {
        signal_timer::release();
    }
}

/// Quantum bookkeeping of one runtime.
///
/// The timer is disarmed while the scheduler makes a decision and armed
/// again for the thread it selects; preemption is only reported while
/// armed.
#[derive(Debug)]
pub struct PreemptionTimer {
    mode: TimerMode,
    quantum: Duration,
    armed: bool,
    deadline: Option<Instant>,
    /// Tick count seen when the quantum started
    tick_mark: u64,
    signal: Option<SignalTimerGuard>,
}

impl PreemptionTimer {
    /// Create the timer for a runtime.
    ///
    /// If the signal timer cannot be installed the runtime falls back to
    /// [`TimerMode::Deadline`].
    pub fn new(mode: TimerMode, quantum: Duration) -> Self {
        let (mode, signal) = match mode {
            TimerMode::Signal => match SignalTimerGuard::acquire(quantum) {
                Ok(guard) => (TimerMode::Signal, Some(guard)),
                Err(e) => {
                    log::warn!("{}; falling back to deadline preemption", e);
                    (TimerMode::Deadline, None)
                }
            },
            other => (other, None),
        };

        Self {
            mode,
            quantum,
            armed: false,
            deadline: None,
            tick_mark: get_preemption_count(),
            signal,
        }
    }

    /// Preemption source actually in use.
    pub fn mode(&self) -> TimerMode {
        self.mode
    }

    pub fn quantum(&self) -> Duration {
        self.quantum
    }

    /// Start a new quantum.
    ///
    /// Ticks raised before this call are not counted against it.
    pub fn arm(&mut self) {
        self.armed = true;
        match self.mode {
            TimerMode::Signal => {
                if let Some(signal) = &self.signal {
                    signal.restart();
                }
                self.tick_mark = get_preemption_count();
            }
            TimerMode::Deadline => self.deadline = Instant::now().checked_add(self.quantum),
            TimerMode::Cooperative => {}
        }
    }

    /// Stop reporting preemption until the next [`arm`](Self::arm).
    pub fn disarm(&mut self) {
        self.armed = false;
    }

    /// Whether the current quantum has expired.
    ///
    /// In signal mode a tick is reported once.
    pub fn should_preempt(&mut self) -> bool {
        if !self.armed {
            return false;
        }
        match self.mode {
            TimerMode::Signal => {
                let ticks = get_preemption_count();
                if ticks == self.tick_mark {
                    return false;
                }
                self.tick_mark = ticks;
                true
            }
            TimerMode::Deadline => self.deadline.map_or(false, |d| Instant::now() >= d),
            TimerMode::Cooperative => false,
        }
    }
}

/// Preemption checkpoint - should be called regularly from long-running code
///
/// Switches to the next thread if the current quantum has expired. Does
/// nothing on an OS thread without a runtime.
pub fn preemption_checkpoint() {
    crate::kernel::preempt_if_due();
}

/// Cooperative preemption points - insert these in long-running code
#[macro_export]
macro_rules! preemption_point {
    () => {
        $crate::platform_timer::preemption_checkpoint();
    };
}
