//! Runtime that owns and schedules the green threads of one OS thread.
//!
//! Every OS thread gets its own [`Runtime`], created on the first runtime
//! operation (or by [`init`]) and reached through a thread-local pointer.
//! The runtime is only ever borrowed for the duration of a short closure;
//! the actual context switch happens after the borrow ends, using the raw
//! context pointers computed while it was held.

use crate::arch::{Arch, DefaultArch, SavedContext};
use crate::config::RuntimeConfig;
use crate::errors::{InvalidOperationError, JoinError, ThreadError, ThreadResult};
use crate::mem::{StackCounters, StackPool, StackStats};
use crate::platform_timer::PreemptionTimer;
use crate::sched::{DefaultScheduler, Registry, Scheduler, Slot};
use crate::thread::{Entry, ExitValue, Outcome, Tcb, ThreadId, ThreadInfo, ThreadState};
use core::any::Any;
use core::cell::Cell;
use core::fmt;
use core::ptr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Result of a scheduling pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchOutcome {
    /// Another thread ran; the caller has been resumed since
    Switched,
    /// No other thread was Ready and the caller kept running
    Stayed,
}

/// Context pointers of one pending switch.
struct SwitchPlan {
    prev: *mut SavedContext,
    next: *const SavedContext,
}

enum JoinStart {
    /// Target had already finished
    Done(Outcome),
    /// Caller is registered as the joiner and marked Scheduled
    Blocked,
}

/// Runtime counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    /// Threads spawned, not counting the main thread
    pub threads_created: u64,
    pub context_switches: u64,
    /// Switches caused by quantum expiry at a preemption point
    pub preemptions: u64,
    /// Terminated threads removed by the scheduler
    pub threads_reclaimed: u64,
    /// Registered threads, including the main thread
    pub live_threads: usize,
    pub stacks: StackStats,
}

/// Green thread runtime of one OS thread.
///
/// The thread that created the runtime is registered as
/// [`ThreadId::MAIN`] and keeps running on its own OS stack; every spawned
/// thread runs on a stack from the runtime's [`StackPool`].
pub struct Runtime {
    registry: Registry,
    scheduler: DefaultScheduler,
    /// Slot of the running thread; never part of the scheduler's rotation
    current: Slot,
    stacks: StackPool,
    stack_counters: Arc<StackCounters>,
    timer: PreemptionTimer,
    next_thread_id: ThreadId,
    stats: RuntimeStats,
}

impl Runtime {
    /// Wrap the calling OS thread as the main thread and start the
    /// preemption timer.
    fn bootstrap(config: RuntimeConfig) -> Self {
        let mut registry = Registry::new();
        let current = registry.insert(Tcb::main());
        let stacks = StackPool::new(config.stack_size, config.stack_cache);
        let stack_counters = stacks.counters();
        let mut timer = PreemptionTimer::new(config.timer, config.quantum);
        timer.arm();

        log::debug!(
            "runtime initialized: {} byte stacks, {:?} quantum, {:?} preemption",
            config.stack_size,
            timer.quantum(),
            timer.mode()
        );

        Self {
            registry,
            scheduler: DefaultScheduler::new(),
            current,
            stacks,
            stack_counters,
            timer,
            next_thread_id: ThreadId::MAIN.successor(),
            stats: RuntimeStats::default(),
        }
    }

    /// Register a new Ready thread at the back of the rotation.
    pub(crate) fn spawn(&mut self, name: Option<String>, entry: Entry) -> ThreadResult<ThreadId> {
        let stack = self.stacks.allocate()?;
        let id = self.next_thread_id;
        self.next_thread_id = id.successor();

        let stack_top = stack.stack_top();
        let mut tcb = Tcb::spawned(id, name, stack, entry);
        // SAFETY: `stack_top` is 16-byte aligned and lies at the top of the
        // stack now owned by `tcb`.
        unsafe { DefaultArch::init_context(&mut tcb.context, stack_top, thread_trampoline) };

        log::debug!("spawned thread {} ({})", id, tcb.name().unwrap_or("unnamed"));
        let slot = self.registry.insert(tcb);
        self.scheduler.enqueue(slot);
        self.stats.threads_created += 1;
        Ok(id)
    }

    fn current_tcb(&self) -> &Tcb {
        match self.registry.get(self.current) {
            Some(tcb) => tcb,
            None => fatal(format_args!("running thread is missing from the registry")),
        }
    }

    fn current_tcb_mut(&mut self) -> &mut Tcb {
        match self.registry.get_mut(self.current) {
            Some(tcb) => tcb,
            None => fatal(format_args!("running thread is missing from the registry")),
        }
    }

    pub(crate) fn current_id(&self) -> ThreadId {
        self.current_tcb().id
    }

    /// One scheduling pass.
    ///
    /// Returns the switch to perform, or `None` if no other thread is
    /// Ready, in which case the caller keeps running with its status
    /// unchanged.
    fn prepare_switch(&mut self) -> Option<SwitchPlan> {
        self.timer.disarm();

        let pick = self.scheduler.pick_next(&mut self.registry);
        self.reclaim(pick.reclaimed);

        let Some(next) = pick.next else {
            self.timer.arm();
            return None;
        };

        let prev = self.current;
        let prev_tcb = self.current_tcb_mut();
        if prev_tcb.status == ThreadState::Running {
            prev_tcb.status = ThreadState::Ready;
        }
        self.scheduler.enqueue(prev);
        self.current = next;

        let Some((prev_tcb, next_tcb)) = self.registry.pair_mut(prev, next) else {
            fatal(format_args!("scheduler picked the running thread"));
        };
        next_tcb.status = ThreadState::Running;
        log::trace!("switch {} -> {}", prev_tcb.id, next_tcb.id);
        let plan = SwitchPlan {
            prev: &mut prev_tcb.context,
            next: &next_tcb.context,
        };

        self.stats.context_switches += 1;
        self.timer.arm();
        Some(plan)
    }

    /// Return the stacks of reclaimed threads to the pool.
    fn reclaim(&mut self, tcbs: Vec<Tcb>) {
        for mut tcb in tcbs {
            log::debug!("reclaiming thread {}", tcb.id);
            if let Some(stack) = tcb.stack.take() {
                self.stacks.release(stack);
            }
            self.stats.threads_reclaimed += 1;
        }
    }

    /// Record the running thread's outcome, release its joiner and pick
    /// the next thread.
    fn retire_current(&mut self, outcome: Outcome) -> Option<SwitchPlan> {
        let tcb = self.current_tcb_mut();
        tcb.entry = None;
        tcb.status = ThreadState::Finished;
        let id = tcb.id;
        let joiner = tcb.joiner;
        let panicked = outcome.is_err();

        let mut outcome = Some(outcome);
        if let Some(joiner) = joiner.and_then(|j| self.registry.tcb_mut(j).ok()) {
            joiner.received = outcome.take();
        }
        let tcb = self.current_tcb_mut();
        match outcome {
            Some(outcome) => tcb.result = Some(outcome),
            None => tcb.status = ThreadState::Terminated,
        }

        for waiter in self.registry.iter_mut() {
            if waiter.is_joining(id) {
                waiter.status = ThreadState::Ready;
                waiter.waiting_on = None;
            }
        }

        if panicked {
            log::debug!("thread {} exited by panicking", id);
        } else {
            log::debug!("thread {} exited", id);
        }
        self.prepare_switch()
    }

    fn blocked_threads(&self) -> usize {
        self.registry
            .iter()
            .filter(|tcb| tcb.status == ThreadState::Scheduled)
            .count()
    }

    fn begin_join(&mut self, id: ThreadId) -> ThreadResult<JoinStart> {
        let me = self.current_id();
        if id == me {
            return Err(ThreadError::would_deadlock());
        }

        let target = self.registry.tcb_mut(id)?;
        match target.status {
            ThreadState::Finished => {
                let outcome = target.result.take().ok_or(JoinError::AlreadyJoined)?;
                target.status = ThreadState::Terminated;
                log::debug!("thread {} joined finished thread {}", me, id);
                return Ok(JoinStart::Done(outcome));
            }
            ThreadState::Terminated => return Err(JoinError::AlreadyJoined.into()),
            _ if target.joiner.is_some() => return Err(JoinError::AlreadyJoined.into()),
            _ => target.joiner = Some(me),
        }

        let tcb = self.current_tcb_mut();
        tcb.status = ThreadState::Scheduled;
        tcb.waiting_on = Some(id);
        log::debug!("thread {} waiting for thread {}", me, id);
        Ok(JoinStart::Blocked)
    }

    /// Take the outcome delivered by the joined thread, or block again if
    /// it has not arrived.
    fn resume_join(&mut self, id: ThreadId) -> Option<Outcome> {
        let tcb = self.current_tcb_mut();
        let received = tcb.received.take();
        if received.is_none() {
            tcb.status = ThreadState::Scheduled;
            tcb.waiting_on = Some(id);
        }
        received
    }

    /// Undo a join registration that would never complete.
    fn cancel_join(&mut self, id: ThreadId) -> ThreadError {
        let me = self.current_id();
        if let Ok(target) = self.registry.tcb_mut(id) {
            if target.joiner == Some(me) {
                target.joiner = None;
            }
        }
        let tcb = self.current_tcb_mut();
        tcb.status = ThreadState::Running;
        tcb.waiting_on = None;
        log::debug!("join of thread {} by {} would deadlock", id, me);
        ThreadError::would_deadlock()
    }

    /// Mark the running thread as blocked; the next scheduling pass will
    /// not pick it until [`Runtime::wake`] releases it.
    pub(crate) fn block_current(&mut self) -> ThreadId {
        let tcb = self.current_tcb_mut();
        tcb.status = ThreadState::Scheduled;
        tcb.id
    }

    /// Restore the running thread after a block that did not happen.
    pub(crate) fn unblock_current(&mut self) {
        let tcb = self.current_tcb_mut();
        if tcb.status == ThreadState::Scheduled {
            tcb.status = ThreadState::Running;
        }
    }

    /// Make a thread blocked by [`Runtime::block_current`] Ready again.
    ///
    /// Unknown ids and threads blocked in a join are left alone.
    pub(crate) fn wake(&mut self, id: ThreadId) -> bool {
        match self.registry.tcb_mut(id) {
            Ok(tcb) if tcb.status == ThreadState::Scheduled && tcb.waiting_on.is_none() => {
                tcb.status = ThreadState::Ready;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn thread_info(&self, id: ThreadId) -> ThreadResult<ThreadInfo> {
        self.registry.tcb(id).map(Tcb::info)
    }

    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            live_threads: self.registry.len(),
            stacks: self.stack_counters.snapshot(),
            ..self.stats
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.scheduler.clear();
        let remaining = self.registry.drain();
        log::debug!("runtime torn down with {} live threads", remaining.len());
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("current", &self.current_tcb().id)
            .field("threads", &self.registry.len())
            .field("timer", &self.timer)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

/// Owner of the thread-local runtime pointer.
struct RuntimeCell(Cell<*mut Runtime>);

impl Drop for RuntimeCell {
    fn drop(&mut self) {
        let runtime = self.0.replace(ptr::null_mut());
        if !runtime.is_null() {
            // SAFETY: the pointer came from `Box::into_raw` and is cleared
            // before being freed.
            drop(unsafe { Box::from_raw(runtime) });
        }
    }
}

thread_local! {
    static RUNTIME: RuntimeCell = const { RuntimeCell(Cell::new(ptr::null_mut())) };
}

fn fatal(args: fmt::Arguments<'_>) -> ! {
    log::error!("{}", args);
    std::process::abort()
}

fn lazy_config() -> RuntimeConfig {
    let config = RuntimeConfig::from_env();
    match config.validate() {
        Ok(()) => config,
        Err(e) => {
            log::warn!("{}; using the default runtime configuration", e);
            RuntimeConfig::default()
        }
    }
}

/// Run `f` on this OS thread's runtime, creating it on first use.
///
/// `f` must not call back into the runtime.
pub(crate) fn with_runtime<R>(f: impl FnOnce(&mut Runtime) -> R) -> R {
    RUNTIME.with(|cell| {
        let mut runtime = cell.0.get();
        if runtime.is_null() {
            runtime = Box::into_raw(Box::new(Runtime::bootstrap(lazy_config())));
            cell.0.set(runtime);
        }
        // SAFETY: the runtime is only reachable from this OS thread and no
        // other borrow is live; callers never nest.
        f(unsafe { &mut *runtime })
    })
}

/// Like [`with_runtime`], but returns `None` instead of creating a runtime.
pub(crate) fn try_with_runtime<R>(f: impl FnOnce(&mut Runtime) -> R) -> Option<R> {
    RUNTIME
        .try_with(|cell| {
            let runtime = cell.0.get();
            // SAFETY: see `with_runtime`.
            (!runtime.is_null()).then(|| f(unsafe { &mut *runtime }))
        })
        .ok()
        .flatten()
}

/// Perform a switch computed by [`Runtime::prepare_switch`].
///
/// # Safety
///
/// No borrow of the runtime may be live, and the plan must be used
/// immediately after it was computed.
unsafe fn switch(plan: SwitchPlan) {
    unsafe { DefaultArch::context_switch(plan.prev, plan.next) }
}

/// Give the CPU to the next Ready thread.
///
/// The caller's status is left as it is, so a caller that marked itself
/// Scheduled stays blocked until released.
pub(crate) fn schedule() -> SwitchOutcome {
    match with_runtime(Runtime::prepare_switch) {
        Some(plan) => {
            // SAFETY: the runtime borrow ended with the closure.
            unsafe { switch(plan) };
            SwitchOutcome::Switched
        }
        None => SwitchOutcome::Stayed,
    }
}

/// Switch away if the running thread's quantum has expired.
pub(crate) fn preempt_if_due() {
    let plan = try_with_runtime(|rt| {
        if !rt.timer.should_preempt() {
            return None;
        }
        let plan = rt.prepare_switch()?;
        rt.stats.preemptions += 1;
        log::trace!("quantum expired, preempted");
        Some(plan)
    })
    .flatten();

    if let Some(plan) = plan {
        // SAFETY: the runtime borrow ended with the closure.
        unsafe { switch(plan) };
    }
}

/// End the running thread with `outcome`.
fn finish(outcome: Outcome) -> ! {
    if let Some(plan) = with_runtime(|rt| rt.retire_current(outcome)) {
        // SAFETY: the runtime borrow ended with the closure.
        unsafe { switch(plan) };
        fatal(format_args!("an exited thread was resumed"));
    }

    let blocked = with_runtime(|rt| rt.blocked_threads());
    if blocked == 0 {
        log::debug!("last thread exited");
        std::process::exit(0);
    }
    fatal(format_args!(
        "deadlock: thread exited with {} threads blocked and none runnable",
        blocked
    ))
}

/// First frame of every spawned thread.
extern "C" fn thread_trampoline() -> ! {
    let entry = with_runtime(|rt| rt.current_tcb_mut().entry.take());
    let outcome = match entry {
        Some(entry) => panic::catch_unwind(AssertUnwindSafe(entry)),
        None => Ok(Box::new(()) as ExitValue),
    };
    finish(outcome)
}

/// Initialize the runtime of the calling OS thread with `config`.
///
/// Without an explicit call the runtime is created on first use from
/// [`RuntimeConfig::from_env`].
pub fn init(config: RuntimeConfig) -> ThreadResult<()> {
    config.validate()?;
    RUNTIME.with(|cell| {
        if !cell.0.get().is_null() {
            return Err(InvalidOperationError::AlreadyInitialized.into());
        }
        cell.0.set(Box::into_raw(Box::new(Runtime::bootstrap(config))));
        Ok(())
    })
}

/// Tear down the calling OS thread's runtime.
///
/// Every remaining thread is discarded without being resumed and every
/// stack is freed. Must be called from the main thread. The returned stats
/// count stacks after teardown.
pub fn shutdown() -> ThreadResult<RuntimeStats> {
    let runtime = RUNTIME.with(|cell| {
        let runtime = cell.0.get();
        if runtime.is_null() {
            return Ok(None);
        }
        // SAFETY: see `with_runtime`.
        if unsafe { (*runtime).current_id() } != ThreadId::MAIN {
            return Err(ThreadError::from(InvalidOperationError::WrongThread));
        }
        cell.0.set(ptr::null_mut());
        // SAFETY: the pointer came from `Box::into_raw` and is no longer
        // reachable through the thread-local.
        Ok(Some(unsafe { Box::from_raw(runtime) }))
    })?;

    let Some(runtime) = runtime else {
        return Ok(RuntimeStats::default());
    };
    let counters = Arc::clone(&runtime.stack_counters);
    let mut stats = runtime.stats();
    drop(runtime);
    stats.stacks = counters.snapshot();
    Ok(stats)
}

/// Voluntarily give the CPU to the next Ready thread.
///
/// Returns immediately if no other thread is Ready.
pub fn yield_now() {
    schedule();
}

/// End the running thread with `value`, handed to its joiner.
///
/// Locals on the exiting thread's stack are not dropped. If no thread is
/// left to run the process exits with status 0.
pub fn exit<T: Any>(value: T) -> ! {
    finish(Ok(Box::new(value)))
}

/// Wait for thread `id` to exit and take its exit value.
///
/// # Errors
///
/// - [`ThreadError::NotFound`] if no live thread has this id
/// - [`JoinError::AlreadyJoined`] if another thread joined it first
/// - [`JoinError::ThreadPanicked`] if the thread panicked
/// - [`InvalidOperationError::WouldDeadlock`] when joining oneself, or when
///   no thread could ever run to release the caller
pub fn join(id: ThreadId) -> ThreadResult<ExitValue> {
    if let JoinStart::Done(outcome) = with_runtime(|rt| rt.begin_join(id))? {
        return unpack(outcome);
    }

    loop {
        if schedule() == SwitchOutcome::Stayed {
            return Err(with_runtime(|rt| rt.cancel_join(id)));
        }
        if let Some(outcome) = with_runtime(|rt| rt.resume_join(id)) {
            return unpack(outcome);
        }
    }
}

fn unpack(outcome: Outcome) -> ThreadResult<ExitValue> {
    outcome.map_err(|_| JoinError::ThreadPanicked.into())
}

/// Identifier of the running thread.
pub fn current() -> ThreadId {
    with_runtime(|rt| rt.current_id())
}

/// Snapshot of a live thread's state.
pub fn thread_info(id: ThreadId) -> ThreadResult<ThreadInfo> {
    with_runtime(|rt| rt.thread_info(id))
}

/// Counters of the calling OS thread's runtime.
pub fn stats() -> RuntimeStats {
    with_runtime(|rt| rt.stats())
}
