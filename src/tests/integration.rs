//! Integration tests for complete thread lifecycle and system interactions.

#[cfg(test)]
mod lifecycle_tests {
    use crate::errors::{InvalidOperationError, JoinError, ThreadError};
    use crate::kernel::{current, exit, join, stats, thread_info, yield_now};
    use crate::tests::helpers::{value, TestEnvironment};
    use crate::thread::{ThreadBuilder, ThreadId, ThreadInfo, ThreadState};
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    #[test]
    fn test_complete_thread_lifecycle() {
        let _env = TestEnvironment::new();
        let executed = Rc::new(Cell::new(false));
        let executed_clone = executed.clone();

        let id = ThreadBuilder::new()
            .name("lifecycle_test")
            .spawn(move || {
                executed_clone.set(true);
                "completed"
            })
            .expect("Failed to spawn thread");

        // Spawned threads start Ready and do not run until the caller yields
        let info = thread_info(id).unwrap();
        assert_eq!(info.state, ThreadState::Ready);
        assert_eq!(info.name.as_deref(), Some("lifecycle_test"));
        assert!(!executed.get());

        let result = join(id).expect("Failed to join thread");
        assert_eq!(value::<&str>(result), "completed");
        assert!(executed.get());

        // Joined but not yet reclaimed
        assert_eq!(thread_info(id).unwrap().state, ThreadState::Terminated);

        // The next scheduling pass reclaims it
        yield_now();
        assert!(thread_info(id).unwrap_err().is_not_found());
        assert_eq!(stats().threads_reclaimed, 1);
    }

    #[test]
    fn test_lazy_initialization() {
        assert_eq!(current(), ThreadId::MAIN);
        let id = crate::spawn(|| ()).unwrap();
        assert_eq!(id.get(), 2);
        join(id).unwrap();
        crate::kernel::shutdown().unwrap();
    }

    #[test]
    fn test_thread_ids_are_sequential() {
        let _env = TestEnvironment::new();
        let ids: Vec<u64> = (0..5)
            .map(|_| crate::spawn(current).unwrap().get())
            .collect();
        assert_eq!(ids, vec![2, 3, 4, 5, 6]);

        for id in ids {
            let id = ThreadId::from_raw(id).unwrap();
            assert_eq!(value::<ThreadId>(join(id).unwrap()), id);
        }
    }

    #[test]
    fn test_join_after_finish_does_not_switch() {
        let _env = TestEnvironment::new();
        let id = crate::spawn(|| 42u32).unwrap();

        while thread_info(id).unwrap().state != ThreadState::Finished {
            yield_now();
        }

        let switches = stats().context_switches;
        let result = join(id).unwrap();
        assert_eq!(value::<u32>(result), 42);
        assert_eq!(stats().context_switches, switches);
    }

    #[test]
    fn test_join_before_finish_blocks() {
        let _env = TestEnvironment::new();
        let observed: Rc<RefCell<Option<ThreadInfo>>> = Rc::new(RefCell::new(None));
        let observed_clone = observed.clone();

        let id = crate::spawn(move || {
            *observed_clone.borrow_mut() = Some(thread_info(ThreadId::MAIN).unwrap());
            7u64
        })
        .unwrap();

        assert_eq!(value::<u64>(join(id).unwrap()), 7);

        let main = observed.borrow_mut().take().unwrap();
        assert_eq!(main.state, ThreadState::Scheduled);
        assert_eq!(main.waiting_on, Some(id));
        assert_eq!(thread_info(ThreadId::MAIN).unwrap().state, ThreadState::Running);
    }

    #[test]
    fn test_join_unknown_thread() {
        let _env = TestEnvironment::new();
        let unknown = ThreadId::from_raw(9999).unwrap();
        assert_eq!(join(unknown).unwrap_err(), ThreadError::NotFound(unknown));
    }

    #[test]
    fn test_self_join() {
        let _env = TestEnvironment::new();
        assert_eq!(join(ThreadId::MAIN).unwrap_err(), ThreadError::would_deadlock());

        let id = crate::spawn(|| join(current()).unwrap_err()).unwrap();
        assert_eq!(value::<ThreadError>(join(id).unwrap()), ThreadError::would_deadlock());
    }

    #[test]
    fn test_second_joiner_is_rejected() {
        let _env = TestEnvironment::new();
        let release = Rc::new(Cell::new(false));
        let release_clone = release.clone();

        let target = crate::spawn(move || {
            while !release_clone.get() {
                yield_now();
            }
            5i32
        })
        .unwrap();
        let first = crate::spawn(move || value::<i32>(join(target).unwrap())).unwrap();

        while thread_info(first).unwrap().state != ThreadState::Scheduled {
            yield_now();
        }
        assert_eq!(thread_info(first).unwrap().waiting_on, Some(target));
        assert_eq!(join(target).unwrap_err(), JoinError::AlreadyJoined.into());

        release.set(true);
        assert_eq!(value::<i32>(join(first).unwrap()), 5);

        // Value already retrieved by the first joiner
        match join(target) {
            Err(ThreadError::Join(JoinError::AlreadyJoined)) | Err(ThreadError::NotFound(_)) => {}
            other => panic!("unexpected join result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_mutual_join_would_deadlock() {
        let _env = TestEnvironment::new();
        // The spawned thread joins main while main is blocked joining it.
        let id = crate::spawn(|| join(ThreadId::MAIN).unwrap_err()).unwrap();
        assert_eq!(value::<ThreadError>(join(id).unwrap()), ThreadError::would_deadlock());
        assert_eq!(thread_info(ThreadId::MAIN).unwrap().waiting_on, None);
    }

    #[test]
    fn test_panicking_thread() {
        let _env = TestEnvironment::new();
        let id = crate::spawn(|| -> u32 { panic!("thread failure") }).unwrap();
        assert_eq!(join(id).unwrap_err(), JoinError::ThreadPanicked.into());

        // The runtime keeps working afterwards
        let id = crate::spawn(|| 1u8).unwrap();
        assert_eq!(value::<u8>(join(id).unwrap()), 1);
    }

    #[test]
    fn test_explicit_exit() {
        let _env = TestEnvironment::new();
        let reached = Rc::new(Cell::new(false));
        let reached_clone = reached.clone();

        let id = crate::spawn(move || -> u8 {
            yield_now();
            if !reached_clone.get() {
                exit(11u8);
            }
            reached_clone.set(true);
            0
        })
        .unwrap();

        assert_eq!(value::<u8>(join(id).unwrap()), 11);
        assert!(!reached.get());
    }

    #[test]
    fn test_nested_spawn() {
        let _env = TestEnvironment::new();
        let parent = crate::spawn(|| {
            let children: Vec<ThreadId> = (1..=4u32)
                .map(|i| crate::spawn(move || i * 10).unwrap())
                .collect();
            children
                .into_iter()
                .map(|c| value::<u32>(join(c).unwrap()))
                .sum::<u32>()
        })
        .unwrap();

        assert_eq!(value::<u32>(join(parent).unwrap()), 100);
    }

    #[test]
    fn test_shutdown_from_spawned_thread_is_rejected() {
        let _env = TestEnvironment::new();
        let id = crate::spawn(|| crate::kernel::shutdown().unwrap_err()).unwrap();
        assert_eq!(
            value::<ThreadError>(join(id).unwrap()),
            InvalidOperationError::WrongThread.into()
        );
    }
}

#[cfg(test)]
mod mutex_tests {
    use crate::errors::{MutexError, ThreadError, ThreadResult};
    use crate::kernel::{join, yield_now};
    use crate::sync::Mutex;
    use crate::tests::helpers::{value, TestEnvironment};
    use crate::thread::{ThreadId, ThreadState};
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn test_mutual_exclusion() {
        let _env = TestEnvironment::new();
        let mutex = Rc::new(Mutex::new());
        let counter = Rc::new(Cell::new(0u64));
        let inside = Rc::new(Cell::new(false));
        const THREADS: u64 = 8;
        const ITERATIONS: u64 = 25;

        let ids: Vec<ThreadId> = (0..THREADS)
            .map(|_| {
                let mutex = mutex.clone();
                let counter = counter.clone();
                let inside = inside.clone();
                crate::spawn(move || {
                    for _ in 0..ITERATIONS {
                        mutex.lock().unwrap();
                        assert!(!inside.replace(true));
                        let v = counter.get();
                        yield_now();
                        counter.set(v + 1);
                        inside.set(false);
                        mutex.unlock().unwrap();
                        yield_now();
                    }
                })
                .unwrap()
            })
            .collect();

        for id in ids {
            join(id).unwrap();
        }
        assert_eq!(counter.get(), THREADS * ITERATIONS);
        assert_eq!(mutex.waiting(), 0);
        assert!(!mutex.is_locked());
    }

    #[test]
    fn test_unlock_wakes_all_waiters() {
        let _env = TestEnvironment::new();
        let mutex = Rc::new(Mutex::new());
        mutex.lock().unwrap();

        let ids: Vec<ThreadId> = (0..3)
            .map(|_| {
                let mutex = mutex.clone();
                crate::spawn(move || {
                    mutex.lock().unwrap();
                    mutex.unlock().unwrap();
                })
                .unwrap()
            })
            .collect();

        yield_now();
        assert_eq!(mutex.waiting(), 3);
        for id in &ids {
            assert_eq!(crate::thread_info(*id).unwrap().state, ThreadState::Scheduled);
        }
        assert_eq!(mutex.destroy(), Err(MutexError::HasWaiters.into()));

        mutex.unlock().unwrap();
        assert_eq!(mutex.waiting(), 0);
        for id in &ids {
            assert_eq!(crate::thread_info(*id).unwrap().state, ThreadState::Ready);
        }
        // Released threads have not retried yet
        assert_eq!(mutex.destroy(), Err(MutexError::HasWaiters.into()));

        for id in ids {
            join(id).unwrap();
        }
        mutex.destroy().unwrap();
    }

    #[test]
    fn test_released_waiter_acquires_before_destroy() {
        let _env = TestEnvironment::new();
        let mutex = Rc::new(Mutex::new());
        mutex.lock().unwrap();

        let mutex_clone = mutex.clone();
        let waiter = crate::spawn(move || {
            let locked = mutex_clone.lock();
            if locked.is_ok() {
                mutex_clone.unlock().unwrap();
            }
            locked
        })
        .unwrap();

        yield_now();
        assert_eq!(mutex.waiting(), 1);
        mutex.unlock().unwrap();
        assert_eq!(mutex.destroy(), Err(MutexError::HasWaiters.into()));

        let locked = value::<ThreadResult<()>>(join(waiter).unwrap());
        assert_eq!(locked, Ok(()));
        mutex.destroy().unwrap();
        assert_eq!(mutex.lock(), Err(MutexError::Destroyed.into()));
    }

    #[test]
    fn test_unlock_by_non_owner() {
        let _env = TestEnvironment::new();
        let mutex = Rc::new(Mutex::new());
        mutex.lock().unwrap();

        let mutex_clone = mutex.clone();
        let id = crate::spawn(move || mutex_clone.unlock().unwrap_err()).unwrap();
        assert_eq!(
            value::<ThreadError>(join(id).unwrap()),
            MutexError::NotOwner.into()
        );
        assert!(mutex.is_locked());
        mutex.unlock().unwrap();
    }

    #[test]
    fn test_lock_with_no_runnable_owner_would_deadlock() {
        let _env = TestEnvironment::new();
        let mutex = Rc::new(Mutex::new());
        mutex.lock().unwrap();

        // Main holds the lock and is blocked joining the contender.
        let mutex_clone = mutex.clone();
        let id = crate::spawn(move || mutex_clone.lock().unwrap_err()).unwrap();
        assert_eq!(
            value::<ThreadError>(join(id).unwrap()),
            ThreadError::would_deadlock()
        );
        assert_eq!(mutex.waiting(), 0);
        mutex.unlock().unwrap();
    }

    #[test]
    fn test_guard_serializes_sections() {
        let _env = TestEnvironment::new();
        let mutex = Rc::new(Mutex::new());
        let log = Rc::new(std::cell::RefCell::new(Vec::new()));

        let ids: Vec<ThreadId> = (0..3u32)
            .map(|i| {
                let mutex = mutex.clone();
                let log = log.clone();
                crate::spawn(move || {
                    let _guard = mutex.guard().unwrap();
                    log.borrow_mut().push((i, "enter"));
                    yield_now();
                    log.borrow_mut().push((i, "leave"));
                })
                .unwrap()
            })
            .collect();

        for id in ids {
            join(id).unwrap();
        }

        let log = log.borrow();
        assert_eq!(log.len(), 6);
        for pair in log.chunks(2) {
            assert_eq!(pair[0].0, pair[1].0);
            assert_eq!(pair[0].1, "enter");
            assert_eq!(pair[1].1, "leave");
        }
    }
}

#[cfg(test)]
mod preemption_tests {
    use crate::config::{RuntimeConfig, TimerMode};
    use crate::kernel::{join, stats};
    use crate::platform_timer::signal_safe_handler;
    use crate::tests::helpers::{value, TestEnvironment};
    use core::time::Duration;
    use std::cell::Cell;
    use std::rc::Rc;

    /// A thread spinning at a preemption point only stops once another
    /// thread runs and raises the flag, which requires preemption.
    fn spinner_is_preempted(timer: TimerMode) {
        let _env = TestEnvironment::with_config(
            RuntimeConfig::default()
                .with_timer(timer)
                .with_quantum(Duration::from_millis(1)),
        );
        let flag = Rc::new(Cell::new(false));
        let spin_flag = flag.clone();

        let spinner = crate::spawn(move || {
            let mut spins = 0u64;
            while !spin_flag.get() {
                crate::preemption_point!();
                spins += 1;
            }
            spins
        })
        .unwrap();
        let setter = crate::spawn(move || flag.set(true)).unwrap();

        assert!(value::<u64>(join(spinner).unwrap()) > 0);
        join(setter).unwrap();
        assert!(stats().preemptions >= 1);
    }

    #[test]
    fn test_deadline_preemption() {
        spinner_is_preempted(TimerMode::Deadline);
    }

    #[test]
    fn test_signal_preemption() {
        spinner_is_preempted(TimerMode::Signal);
    }

    #[test]
    fn test_stale_tick_does_not_preempt_next_thread() {
        let _env = TestEnvironment::with_config(
            RuntimeConfig::default()
                .with_timer(TimerMode::Signal)
                .with_quantum(Duration::from_millis(1)),
        );

        let target = crate::spawn(|| {
            let before = stats().preemptions;
            crate::preemption_point!();
            stats().preemptions - before
        })
        .unwrap();
        let bystander = crate::spawn(|| {}).unwrap();

        // A tick left over from main's quantum
        // SAFETY: the handler only touches atomics.
        unsafe { signal_safe_handler(libc::SIGPROF) };

        assert_eq!(value::<u64>(join(target).unwrap()), 0);
        join(bystander).unwrap();
    }

    #[test]
    fn test_cooperative_mode_never_preempts() {
        let _env = TestEnvironment::new();
        let id = crate::spawn(|| {
            for _ in 0..10_000 {
                crate::preemption_point!();
            }
        })
        .unwrap();
        join(id).unwrap();
        assert_eq!(stats().preemptions, 0);
    }
}
