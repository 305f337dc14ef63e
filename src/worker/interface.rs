use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::Duration;

/// Exclusive access to an actor's state, shared between its worker thread
/// and external callers.
///
/// External callers (parameter calls, topology commit) bump an
/// external-acquired counter and take the mutex; their release raises the
/// change flag and notifies the wait condition. The worker claims the
/// actor non-blockingly when no external holder is pending, consuming the
/// change flag; if the flag is re-raised while the worker holds the lock,
/// the next acquire succeeds immediately, which is what makes the
/// handoff ABA-safe.
pub(crate) struct ActorInterface<T> {
    wait_mode: AtomicBool,
    change_pending: AtomicBool,
    external_acquired: AtomicUsize,
    state: Mutex<T>,
    cond: Condvar,
}

impl<T> ActorInterface<T> {
    pub fn new(value: T) -> ActorInterface<T> {
        ActorInterface {
            wait_mode: AtomicBool::new(true),
            change_pending: AtomicBool::new(false),
            external_acquired: AtomicUsize::new(0),
            state: Mutex::new(value),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, T> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enable or disable condition-variable waiting (disabled for the
    /// spinning thread-pool modes).
    pub fn set_wait_mode(&self, enabled: bool) {
        self.wait_mode.store(enabled, Ordering::Relaxed);
    }

    /// Exclusive access for a caller outside the worker thread context.
    pub fn external_acquire(&self) -> ExternalGuard<'_, T> {
        self.external_acquired.fetch_add(1, Ordering::AcqRel);
        ExternalGuard {
            iface: self,
            guard: Some(self.lock()),
        }
    }

    /// Claim the actor from a worker thread. Returns `None` when an
    /// external caller holds or is waiting for the actor, or when no
    /// change is flagged. With `wait`, parks on the condition variable up
    /// to the given duration before giving up.
    pub fn worker_acquire(&self, wait: Option<Duration>) -> Option<WorkerGuard<'_, T>> {
        // external context requested or in progress: block on the lock so
        // the external call finishes, then bail out
        if self.external_acquired.load(Ordering::Acquire) != 0 {
            drop(self.lock());
            return None;
        }

        // fast path for the already-flagged case
        if self.change_pending.swap(false, Ordering::AcqRel) {
            return Some(WorkerGuard {
                guard: Some(self.lock()),
            });
        }

        let wait = wait?;
        if !self.wait_mode.load(Ordering::Relaxed) {
            return None;
        }

        let mut guard = self.lock();
        if !self.change_pending.swap(false, Ordering::AcqRel) {
            let (next, _) = self
                .cond
                .wait_timeout(guard, wait)
                .unwrap_or_else(PoisonError::into_inner);
            guard = next;
            if !self.change_pending.swap(false, Ordering::AcqRel) {
                return None;
            }
        }
        Some(WorkerGuard { guard: Some(guard) })
    }

    /// Mark a state change from outside the worker context and wake a
    /// sleeping thread to process it.
    pub fn flag_external_change(&self) {
        self.change_pending.store(true, Ordering::Release);
        if self.wait_mode.load(Ordering::Relaxed) {
            self.wake_no_change();
        }
    }

    /// Mark a state change from within the worker context. The worker is
    /// running, so no wakeup is needed.
    pub fn flag_internal_change(&self) {
        self.change_pending.store(true, Ordering::Release);
    }

    /// Wake a potentially sleeping thread without flagging a change.
    pub fn wake_no_change(&self) {
        // if the lock is taken, the worker context is already busy
        match self.state.try_lock() {
            Ok(guard) => {
                self.cond.notify_one();
                drop(guard);
            }
            Err(TryLockError::Poisoned(guard)) => {
                self.cond.notify_one();
                drop(guard);
            }
            Err(TryLockError::WouldBlock) => {}
        }
    }
}

impl<T> std::fmt::Debug for ActorInterface<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorInterface")
            .field("external_acquired", &self.external_acquired.load(Ordering::Relaxed))
            .finish()
    }
}

/// External caller's hold on the actor.
pub(crate) struct ExternalGuard<'a, T> {
    iface: &'a ActorInterface<T>,
    guard: Option<MutexGuard<'a, T>>,
}

impl<T> Deref for ExternalGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.as_ref().expect("guard present until drop")
    }
}

impl<T> DerefMut for ExternalGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_mut().expect("guard present until drop")
    }
}

impl<T> Drop for ExternalGuard<'_, T> {
    fn drop(&mut self) {
        self.iface.external_acquired.fetch_sub(1, Ordering::AcqRel);
        self.iface.change_pending.store(true, Ordering::Release);
        self.iface.cond.notify_one();
        drop(self.guard.take());
    }
}

/// Worker thread's hold on the actor.
pub(crate) struct WorkerGuard<'a, T> {
    guard: Option<MutexGuard<'a, T>>,
}

impl<T> Deref for WorkerGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.as_ref().expect("guard present until drop")
    }
}

impl<T> DerefMut for WorkerGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_mut().expect("guard present until drop")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::ActorInterface;

    #[test]
    fn worker_needs_a_flagged_change() {
        let iface = ActorInterface::new(0u32);
        assert!(iface.worker_acquire(None).is_none());
        iface.flag_external_change();
        let guard = iface.worker_acquire(None).expect("change was flagged");
        drop(guard);
        // the flag was consumed
        assert!(iface.worker_acquire(None).is_none());
    }

    #[test]
    fn external_release_reflags() {
        let iface = ActorInterface::new(0u32);
        {
            let mut guard = iface.external_acquire();
            *guard = 7;
        }
        let guard = iface.worker_acquire(None).expect("external release flags a change");
        assert_eq!(*guard, 7);
    }

    #[test]
    fn external_pending_blocks_worker() {
        let iface = Arc::new(ActorInterface::new(0u32));
        iface.flag_external_change();

        let held = iface.external_acquire();
        let iface2 = Arc::clone(&iface);
        let worker = thread::spawn(move || iface2.worker_acquire(None).is_none());
        thread::sleep(Duration::from_millis(20));
        drop(held);
        assert!(worker.join().unwrap());
    }

    #[test]
    fn waiting_worker_wakes_on_external_change() {
        let iface = Arc::new(ActorInterface::new(0u32));
        let iface2 = Arc::clone(&iface);
        let worker = thread::spawn(move || {
            iface2
                .worker_acquire(Some(Duration::from_secs(5)))
                .is_some()
        });
        thread::sleep(Duration::from_millis(20));
        iface.flag_external_change();
        assert!(worker.join().unwrap());
    }
}
