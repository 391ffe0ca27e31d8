// ========================================================================================
//
//                     THE HANDSHAKE BETWEEN GRIDDER AND CF SERVER
//
// ========================================================================================
//
// The gridding thread and the CF staging thread share exactly two things: a handful of
// readiness latches and the currently published kernel set. Everything they say to each
// other goes through this module.
//
// Each latch is a boolean behind its own mutex with its own condition variable. A latch
// is set by `signal_*` and cleared only by the waiter that observes it, inside the
// predicate check of the wait. A signal that arrives before the wait is therefore never
// lost, and a single signal is never observed twice. Every latch has at most one waiter.
//
// End-of-data is a sticky flag. Raising it wakes every latch so that no role can stay
// blocked on a signal that will never come.

use log::{debug, trace};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

/// A shared, immutable handle to a staged kernel set.
pub type StagedKernel<K> = Arc<K>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wake {
    Signalled,
    EndOfData,
}

#[derive(Default)]
struct LatchState {
    set: bool,
    waiting: bool,
}

/// A single-producer, single-consumer readiness latch.
struct Latch {
    name: &'static str,
    state: Mutex<LatchState>,
    cv: Condvar,
}

impl Latch {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(LatchState::default()),
            cv: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn signal(&self) {
        let mut state = self.lock();
        state.set = true;
        trace!("latch {}: set", self.name);
        self.cv.notify_one();
    }

    fn wait(&self, end_of_data: &AtomicBool) -> Wake {
        let mut state = self.lock();
        debug_assert!(
            !state.waiting,
            "latch '{}' already has a waiter; each latch supports exactly one",
            self.name
        );
        state.waiting = true;

        let mut state = self
            .cv
            .wait_while(state, |s| !s.set && !end_of_data.load(Ordering::Acquire))
            .unwrap_or_else(PoisonError::into_inner);
        state.waiting = false;

        if end_of_data.load(Ordering::Acquire) {
            return Wake::EndOfData;
        }
        // The predicate guarantees the latch is set here. This is the only place it is cleared.
        state.set = false;
        trace!("latch {}: consumed", self.name);
        Wake::Signalled
    }

    /// Wakes the waiter, if any, so it re-evaluates its predicate.
    fn wake(&self) {
        let _state = self.lock();
        self.cv.notify_all();
    }

    fn is_set(&self) -> bool {
        self.lock().set
    }
}

struct KernelSlot<K> {
    current: Option<StagedKernel<K>>,
    fresh: bool,
}

/// Coordinates the gridding role and the CF staging role for one gridding pass.
///
/// The coordinator is shared between the two roles behind an `Arc`. None of its
/// operations take a global lock: each latch, the end-of-data flag, and the kernel
/// slot are independently synchronized.
pub struct HandshakeCoordinator<K> {
    kernel_ready: Latch,
    kernel_consumed: Latch,
    downstream_ready: Latch,
    end_of_data: AtomicBool,
    staged: Mutex<KernelSlot<K>>,
}

impl<K> Default for HandshakeCoordinator<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> HandshakeCoordinator<K> {
    pub fn new() -> Self {
        Self {
            kernel_ready: Latch::new("kernel-ready"),
            kernel_consumed: Latch::new("kernel-consumed"),
            downstream_ready: Latch::new("downstream-ready"),
            end_of_data: AtomicBool::new(false),
            staged: Mutex::new(KernelSlot {
                current: None,
                fresh: false,
            }),
        }
    }

    /// Blocks until a kernel set is ready or end-of-data is raised.
    ///
    /// Returns `true` for end-of-data, in which case the ready latch is left untouched.
    /// Returns immediately when end-of-data was raised before the call. On a ready wake
    /// the latch is consumed and `false` is returned.
    pub fn wait_for_kernel_ready_or_end_of_data(&self) -> bool {
        self.kernel_ready.wait(&self.end_of_data) == Wake::EndOfData
    }

    /// Blocks until the current kernel set has been consumed, then clears the latch.
    ///
    /// Also returns, without clearing anything, once end-of-data is raised. Callers that
    /// need to tell the two apart check [`Self::is_end_of_data`] afterwards.
    pub fn wait_for_kernel_consumed(&self) {
        self.kernel_consumed.wait(&self.end_of_data);
    }

    /// Blocks until the downstream consumer is ready, then clears the latch.
    pub fn wait_for_downstream_ready(&self) {
        self.downstream_ready.wait(&self.end_of_data);
    }

    pub fn signal_kernel_ready(&self) {
        self.kernel_ready.signal();
    }

    pub fn signal_kernel_consumed(&self) {
        self.kernel_consumed.signal();
    }

    pub fn signal_downstream_ready(&self) {
        self.downstream_ready.signal();
    }

    /// Raises (or attempts to lower) the end-of-data flag.
    ///
    /// The flag is one-way: once raised it stays raised and a request to lower it is
    /// ignored. Raising it wakes every blocked waiter.
    pub fn set_end_of_data(&self, value: bool) {
        if !value {
            if self.end_of_data.load(Ordering::Acquire) {
                debug!("Ignoring request to clear end-of-data; the flag is sticky.");
            }
            return;
        }
        if self.end_of_data.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("End-of-data raised; waking all handshake waiters.");
        self.kernel_ready.wake();
        self.kernel_consumed.wake();
        self.downstream_ready.wake();
    }

    pub fn is_end_of_data(&self) -> bool {
        self.end_of_data.load(Ordering::Acquire)
    }

    /// Publishes a new kernel set. Must precede the matching `signal_kernel_ready`.
    pub fn install_staged_kernel(&self, kernel: StagedKernel<K>) {
        let mut slot = self.staged.lock().unwrap_or_else(PoisonError::into_inner);
        slot.current = Some(kernel);
        slot.fresh = true;
    }

    /// The most recently published kernel set, if any.
    pub fn staged_kernel(&self) -> Option<StagedKernel<K>> {
        self.staged
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .current
            .clone()
    }

    /// Returns the published kernel set only if it has not been taken since it was
    /// installed. The set itself stays published.
    pub fn take_fresh_kernel(&self) -> Option<StagedKernel<K>> {
        let mut slot = self.staged.lock().unwrap_or_else(PoisonError::into_inner);
        if std::mem::take(&mut slot.fresh) {
            slot.current.clone()
        } else {
            None
        }
    }

    /// Non-blocking view of the ready latch, for diagnostics and tests.
    pub fn is_kernel_ready(&self) -> bool {
        self.kernel_ready.is_set()
    }
}
