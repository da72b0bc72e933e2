//! A robust, priority-inheriting, error-checking, process-shared mutex and
//! its paired condition variable.
//!
//! Both types are suitable for shared memory:
//!
//! * Fixed `repr(C)` layout, valid when zero-initialized.
//! * Self-contained; no process-local state, no heap.
//! * Work across processes (no `FUTEX_PRIVATE_FLAG`).
//!
//! The mutex word is maintained by the kernel's PI futex protocol: `0` is
//! unlocked, otherwise it holds the owner's tid, possibly tagged with
//! `FUTEX_WAITERS` and/or `FUTEX_OWNER_DIED`. Acquisition reports owner
//! death as [`Acquired::OwnerDied`], a success with a caveat rather than an
//! error; the caller is expected to repair the protected state and then
//! call [`Mtx::consistent`].

use core::cell::Cell;
use core::sync::atomic::Ordering;

use nix::errno::Errno;

use crate::clock::TimeMono;
use crate::ftx::{self, Ftx};
use crate::robust;
use crate::Result;

/// How a lock acquisition succeeded.
///
/// `OwnerDied` means the previous holder terminated inside its critical
/// section. The lock *is* held by the caller; the protected state may be
/// mid-transaction and must be reconciled before use.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquired {
    Fresh,
    OwnerDied,
}

impl Acquired {
    pub fn owner_died(self) -> bool {
        matches!(self, Acquired::OwnerDied)
    }
}

/// Process-shared robust PI mutex.
///
/// The first two fields are the robust-list linkage and must stay first:
/// the kernel's registry protocol addresses entries by their next-pointer,
/// with the futex word found at a fixed offset from it (see
/// [`robust`](crate::robust)). The linkage is only touched by the holding
/// thread between `op_start`/`op_end` brackets.
#[derive(Debug)]
#[repr(C)]
pub struct Mtx {
    pub(crate) robust_next: Cell<*mut Mtx>,
    pub(crate) robust_prev: Cell<*mut Mtx>,
    pub(crate) ftx: Ftx,
}

// SAFETY: the linkage cells are private to whichever thread currently owns
// (or is acquiring) the mutex, serialized by the futex word itself; the
// word is atomic.
unsafe impl Send for Mtx {}
unsafe impl Sync for Mtx {}

static_assertions::const_assert_eq!(core::mem::offset_of!(Mtx, robust_next), 0);

impl Mtx {
    /// A fresh unlocked mutex. Equivalent to zeroed memory.
    pub const fn new() -> Mtx {
        Mtx {
            robust_next: Cell::new(core::ptr::null_mut()),
            robust_prev: Cell::new(core::ptr::null_mut()),
            ftx: Ftx::new(0),
        }
    }

    /// Lock, waiting as long as it takes.
    pub fn lock(&self) -> Result<Acquired> {
        self.lock_opt(None)
    }

    /// Lock, waiting no later than `deadline`. `ETIMEDOUT` on expiry.
    pub fn timed_lock(&self, deadline: TimeMono) -> Result<Acquired> {
        self.lock_opt(Some(deadline))
    }

    fn lock_opt(&self, deadline: Option<TimeMono>) -> Result<Acquired> {
        robust::op_start(self);
        let res = self.lock_robust(deadline);
        if res.is_ok() {
            robust::op_add(self);
        }
        robust::op_end(self);
        res
    }

    /// The acquisition loop proper, without the robust-list bracket. Also
    /// used by [`Cnd`] to relock after a timed-out or raced wait.
    pub(crate) fn lock_robust(&self, deadline: Option<TimeMono>) -> Result<Acquired> {
        let tid = robust::tid();
        loop {
            // Try to lock without kernel involvement.
            if self
                .ftx
                .compare_exchange(0, tid, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(Acquired::Fresh);
            }

            // Ask the kernel to lock.
            match ftx::lock_pi(&self.ftx, deadline) {
                Ok(()) => break,
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(err),
            }
        }

        if ftx::owner_died(self.ftx.load(Ordering::Relaxed)) {
            Ok(Acquired::OwnerDied)
        } else {
            Ok(Acquired::Fresh)
        }
    }

    /// Lock only if that cannot block.
    ///
    /// `EBUSY` if another thread holds the mutex, `EDEADLK` if the caller
    /// already does.
    pub fn try_lock(&self) -> Result<Acquired> {
        robust::op_start(self);
        let res = self.try_lock_impl();
        if res.is_ok() {
            robust::op_add(self);
        }
        robust::op_end(self);
        res
    }

    fn try_lock_impl(&self) -> Result<Acquired> {
        let tid = robust::tid();

        let old = match self
            .ftx
            .compare_exchange(0, tid, Ordering::Acquire, Ordering::Relaxed)
        {
            Ok(_) => return Ok(Acquired::Fresh),
            Err(old) => old,
        };

        if ftx::tid_of(old) == tid {
            return Err(Errno::EDEADLK);
        }

        // Is the owner still alive?
        if !ftx::owner_died(old) {
            return Err(Errno::EBUSY);
        }

        // The owner died. Let the kernel sort out the inheritance race.
        match ftx::trylock_pi(&self.ftx) {
            Ok(()) => {
                if ftx::owner_died(self.ftx.load(Ordering::Relaxed)) {
                    Ok(Acquired::OwnerDied)
                } else {
                    Ok(Acquired::Fresh)
                }
            }
            // Somebody else beat us to the recovery.
            Err(Errno::EAGAIN) => Err(Errno::EBUSY),
            Err(err) => Err(err),
        }
    }

    /// Declare the protected state repaired after an owner-died
    /// acquisition, clearing the died bit.
    ///
    /// `EINVAL` if the mutex is not marked owner-died, `EPERM` if the
    /// caller does not hold it.
    pub fn consistent(&self) -> Result<()> {
        let val = self.ftx.load(Ordering::Relaxed);
        if !ftx::owner_died(val) {
            return Err(Errno::EINVAL);
        }
        if ftx::tid_of(val) != robust::tid() {
            return Err(Errno::EPERM);
        }
        self.ftx.fetch_and(!ftx::FTX_OWNER_DIED, Ordering::AcqRel);
        Ok(())
    }

    /// Unlock. `EPERM` unless the calling thread is the owner.
    pub fn unlock(&self) -> Result<()> {
        let tid = robust::tid();
        let val = self.ftx.load(Ordering::Relaxed);

        // Only the owner can unlock.
        if ftx::tid_of(val) != tid {
            return Err(Errno::EPERM);
        }

        robust::op_start(self);
        robust::op_del(self);

        self.ftx.fetch_and(!ftx::FTX_OWNER_DIED, Ordering::AcqRel);

        // If the word is exactly our tid there are no waiters and the
        // kernel doesn't need to get involved.
        if self
            .ftx
            .compare_exchange(tid, 0, Ordering::Release, Ordering::Relaxed)
            .is_err()
        {
            // Hand off to a waiter.
            let _ = ftx::unlock_pi(&self.ftx);
        }

        robust::op_end(self);
        Ok(())
    }

    /// The raw futex word. For composite primitives (e.g. the deadman)
    /// that park on lock-state transitions of a mutex they do not hold.
    pub fn word(&self) -> &Ftx {
        &self.ftx
    }
}

impl Default for Mtx {
    fn default() -> Mtx {
        Mtx::new()
    }
}

/// Process-shared condition variable, paired with [`Mtx`].
///
/// A single counter word. Waiters are moved onto the mutex's kernel queue
/// with the requeue-PI operations, so a broadcast does not stampede: one
/// waiter wakes owning the mutex and the rest queue behind it.
#[repr(transparent)]
pub struct Cnd(Ftx);

impl Cnd {
    pub const fn new() -> Cnd {
        Cnd(Ftx::new(0))
    }

    /// Atomically release `mtx`, wait for a signal, and reacquire `mtx`.
    ///
    /// The caller must hold `mtx`; `EPERM` otherwise. Reports
    /// [`Acquired::OwnerDied`] if the reacquisition observed owner death.
    pub fn wait(&self, mtx: &Mtx) -> Result<Acquired> {
        self.wait_opt(mtx, None)
    }

    /// As [`Cnd::wait`], but gives up (relocking `mtx` first) at
    /// `deadline` with `ETIMEDOUT`.
    pub fn timed_wait(&self, mtx: &Mtx, deadline: TimeMono) -> Result<Acquired> {
        self.wait_opt(mtx, Some(deadline))
    }

    fn wait_opt(&self, mtx: &Mtx, deadline: Option<TimeMono>) -> Result<Acquired> {
        let snapshot = self.0.load(Ordering::Relaxed);

        // Unblock the threads that will eventually signal this wait.
        mtx.unlock()?;

        robust::op_start(mtx);
        let mut timed_out = false;
        loop {
            match ftx::wait_requeue_pi(&self.0, snapshot, deadline, &mtx.ftx) {
                // Woken through the requeue: we already own the mutex.
                Ok(()) => break,
                Err(Errno::EINTR) => continue,
                Err(Errno::ETIMEDOUT) => {
                    // Manually relock. The timeout outranks the lock result.
                    timed_out = true;
                    let _ = mtx.lock_robust(None);
                    break;
                }
                Err(Errno::EAGAIN) => {
                    // A signal raced the park; the counter already moved.
                    if let Err(err) = mtx.lock_robust(None) {
                        robust::op_end(mtx);
                        return Err(err);
                    }
                    break;
                }
                Err(err) => {
                    robust::op_end(mtx);
                    return Err(err);
                }
            }
        }
        robust::op_add(mtx);

        let acquired = if ftx::owner_died(mtx.ftx.load(Ordering::Relaxed)) {
            Acquired::OwnerDied
        } else {
            Acquired::Fresh
        };
        robust::op_end(mtx);

        if timed_out {
            Err(Errno::ETIMEDOUT)
        } else {
            Ok(acquired)
        }
    }

    /// Wake one waiter.
    pub fn signal(&self, mtx: &Mtx) -> Result<()> {
        self.wake(mtx, 0)
    }

    /// Wake one waiter and requeue the rest onto the mutex.
    pub fn broadcast(&self, mtx: &Mtx) -> Result<()> {
        self.wake(mtx, i32::MAX)
    }

    fn wake(&self, mtx: &Mtx, n_requeue: i32) -> Result<()> {
        let mut val = self.0.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        loop {
            match ftx::cmp_requeue_pi(&self.0, val, &mtx.ftx, n_requeue) {
                Err(Errno::EAGAIN) => {
                    // Another thread is also waking this condition variable.
                    val = self.0.load(Ordering::Relaxed);
                }
                other => return other,
            }
        }
    }
}

impl Default for Cnd {
    fn default() -> Cnd {
        Cnd::new()
    }
}

// SAFETY: a bare atomic counter.
unsafe impl Send for Cnd {}
unsafe impl Sync for Cnd {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relock_is_deadlock() {
        let mtx = Mtx::new();
        assert_eq!(mtx.lock(), Ok(Acquired::Fresh));
        assert_eq!(mtx.try_lock(), Err(Errno::EDEADLK));
        assert_eq!(mtx.unlock(), Ok(()));
    }

    #[test]
    fn unlock_unheld_is_eperm() {
        let mtx = Mtx::new();
        assert_eq!(mtx.unlock(), Err(Errno::EPERM));

        assert_eq!(mtx.lock(), Ok(Acquired::Fresh));
        assert_eq!(mtx.unlock(), Ok(()));
        assert_eq!(mtx.unlock(), Err(Errno::EPERM));
    }

    #[test]
    fn lock_unlock_cycles() {
        let mtx = Mtx::new();
        for _ in 0..3 {
            assert_eq!(mtx.lock(), Ok(Acquired::Fresh));
            assert_eq!(mtx.unlock(), Ok(()));
        }
    }

    #[test]
    fn trylock_cross_thread_is_busy() {
        let mtx = Mtx::new();
        assert_eq!(mtx.lock(), Ok(Acquired::Fresh));
        std::thread::scope(|s| {
            s.spawn(|| {
                assert_eq!(mtx.try_lock(), Err(Errno::EBUSY));
            });
        });
        assert_eq!(mtx.unlock(), Ok(()));
    }

    #[test]
    fn timed_lock_expires() {
        let mtx = Mtx::new();
        assert_eq!(mtx.lock(), Ok(Acquired::Fresh));
        std::thread::scope(|s| {
            s.spawn(|| {
                let deadline = TimeMono::after(core::time::Duration::from_millis(20));
                assert_eq!(mtx.timed_lock(deadline), Err(Errno::ETIMEDOUT));
            });
        });
        assert_eq!(mtx.unlock(), Ok(()));
    }

    #[test]
    fn contended_counter() {
        struct Counter {
            mtx: Mtx,
            count: core::cell::Cell<u64>,
        }
        // Cell is only touched under the mutex.
        unsafe impl Sync for Counter {}

        let counter = Counter {
            mtx: Mtx::new(),
            count: core::cell::Cell::new(0),
        };

        const THREADS: u64 = 8;
        const ITERS: u64 = 500;
        std::thread::scope(|s| {
            for _ in 0..THREADS {
                s.spawn(|| {
                    let counter = &counter;
                    for _ in 0..ITERS {
                        let _ = counter.mtx.lock().unwrap();
                        counter.count.set(counter.count.get() + 1);
                        counter.mtx.unlock().unwrap();
                    }
                });
            }
        });
        assert_eq!(counter.count.get(), THREADS * ITERS);
    }

    #[test]
    fn cnd_wait_requires_mutex() {
        let mtx = Mtx::new();
        let cnd = Cnd::new();
        assert_eq!(cnd.wait(&mtx), Err(Errno::EPERM));
    }

    #[test]
    fn cnd_timed_wait_expires_holding_mutex() {
        let mtx = Mtx::new();
        let cnd = Cnd::new();
        let _ = mtx.lock().unwrap();
        let deadline = TimeMono::after(core::time::Duration::from_millis(20));
        assert_eq!(cnd.timed_wait(&mtx, deadline), Err(Errno::ETIMEDOUT));
        // The mutex was reacquired on the timeout path.
        assert_eq!(mtx.unlock(), Ok(()));
    }

    #[test]
    fn cnd_signal_wakes_waiter() {
        struct Event {
            mtx: Mtx,
            cnd: Cnd,
            set: core::cell::Cell<bool>,
        }
        unsafe impl Sync for Event {}

        let ev = Event {
            mtx: Mtx::new(),
            cnd: Cnd::new(),
            set: core::cell::Cell::new(false),
        };

        std::thread::scope(|s| {
            s.spawn(|| {
                let ev = &ev;
                let _ = ev.mtx.lock().unwrap();
                while !ev.set.get() {
                    let _ = ev.cnd.wait(&ev.mtx).unwrap();
                }
                ev.mtx.unlock().unwrap();
            });

            std::thread::sleep(core::time::Duration::from_millis(10));
            let _ = ev.mtx.lock().unwrap();
            ev.set.set(true);
            ev.cnd.broadcast(&ev.mtx).unwrap();
            ev.mtx.unlock().unwrap();
        });
    }

    #[test]
    fn cnd_broadcast_wakes_all() {
        struct Latch {
            mtx: Mtx,
            cnd: Cnd,
            val: core::cell::Cell<i32>,
        }
        unsafe impl Sync for Latch {}

        const N: i32 = 4;
        let latch = Latch {
            mtx: Mtx::new(),
            cnd: Cnd::new(),
            val: core::cell::Cell::new(N),
        };

        std::thread::scope(|s| {
            for _ in 0..N {
                s.spawn(|| {
                    let latch = &latch;
                    let _ = latch.mtx.lock().unwrap();
                    latch.val.set(latch.val.get() - 1);
                    if latch.val.get() <= 0 {
                        latch.cnd.broadcast(&latch.mtx).unwrap();
                    }
                    while latch.val.get() > 0 {
                        let _ = latch.cnd.wait(&latch.mtx).unwrap();
                    }
                    latch.mtx.unlock().unwrap();
                });
            }
        });
        assert_eq!(latch.val.get(), 0);
    }
}
