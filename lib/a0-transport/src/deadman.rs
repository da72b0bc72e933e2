//! A single-owner liveness token in shared memory.
//!
//! One process at a time *takes* the deadman; while it holds it, the kernel
//! itself vouches for the owner's liveness through the robust mutex. Other
//! processes can ask whether it is taken, block until it is taken, or block
//! until the incumbent releases it or dies.
//!
//! Shared state is a robust mutex plus a monotonic take-counter. Every
//! ownership transition broadcasts the mutex's futex word, which is also
//! what the waiters park on. The counter lets `wait_released` detect that
//! the ownership it was watching has been superseded, even if it slept
//! through an entire release/take cycle.

use core::cell::Cell;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use a0_sync::clock::TimeMono;
use a0_sync::ftx;
use a0_sync::mtx::{Acquired, Mtx};
use a0_sync::robust;
use a0_sync::{Errno, Result};

/// The in-shared-memory part: valid when zero-initialized.
#[repr(C)]
#[derive(Default)]
pub struct DeadmanShared {
    mtx: Mtx,
    tkn: AtomicU64,
}

impl DeadmanShared {
    pub const fn new() -> DeadmanShared {
        DeadmanShared {
            mtx: Mtx::new(),
            tkn: AtomicU64::new(0),
        }
    }
}

/// Non-blocking snapshot of a deadman.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadmanState {
    pub is_taken: bool,
    /// Whether *this handle* is the owner.
    pub is_owner: bool,
    /// Take-counter value of the current ownership; zero if not taken.
    pub tkn: u64,
}

/// A per-process handle onto a [`DeadmanShared`].
pub struct Deadman<'a> {
    shared: &'a DeadmanShared,
    is_owner: Cell<bool>,
    // True while a thread is blocked inside this handle; `shutdown` spins
    // on it.
    inop: AtomicBool,
    shutdown: AtomicBool,
}

// SAFETY: `is_owner` is only written by take/release on the owning thread;
// racing readers (`state`) tolerate staleness.
unsafe impl Send for Deadman<'_> {}
unsafe impl Sync for Deadman<'_> {}

impl<'a> Deadman<'a> {
    pub fn new(shared: &'a DeadmanShared) -> Deadman<'a> {
        Deadman {
            shared,
            is_owner: Cell::new(false),
            inop: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        }
    }

    fn word(&self) -> &ftx::Ftx {
        self.shared.mtx.word()
    }

    /// Take ownership, waiting for the incumbent to release or die.
    /// Re-taking while already the owner is a no-op. Taking over from a
    /// dead owner reports [`Acquired::OwnerDied`].
    pub fn take(&self) -> Result<Acquired> {
        self.take_opt(None)
    }

    pub fn timed_take(&self, deadline: TimeMono) -> Result<Acquired> {
        self.take_opt(Some(deadline))
    }

    /// Take ownership only if that cannot block. `EBUSY` if a live owner
    /// exists, `EDEADLK` if another thread of this process owns it.
    pub fn try_take(&self) -> Result<Acquired> {
        if self.is_owner.get() {
            return Ok(Acquired::Fresh);
        }

        robust::op_start(&self.shared.mtx);
        let res = self.try_take_impl();
        if res.is_ok() {
            robust::op_add(&self.shared.mtx);
        }
        robust::op_end(&self.shared.mtx);
        res
    }

    fn take_opt(&self, deadline: Option<TimeMono>) -> Result<Acquired> {
        if self.is_owner.get() {
            return Ok(Acquired::Fresh);
        }

        self.inop.store(true, Ordering::SeqCst);

        robust::op_start(&self.shared.mtx);
        let res = self.take_loop(deadline);
        if res.is_ok() {
            robust::op_add(&self.shared.mtx);
        }
        robust::op_end(&self.shared.mtx);

        self.inop.store(false, Ordering::SeqCst);
        res
    }

    fn take_loop(&self, deadline: Option<TimeMono>) -> Result<Acquired> {
        loop {
            let old = self.word().load(Ordering::Relaxed);
            match self.try_take_impl() {
                Err(Errno::EBUSY) => {}
                other => return other,
            }
            match ftx::wait(self.word(), old, deadline) {
                Ok(()) | Err(Errno::EAGAIN) | Err(Errno::EINTR) => continue,
                Err(err) => return Err(err),
            }
        }
    }

    fn try_take_impl(&self) -> Result<Acquired> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(Errno::ESHUTDOWN);
        }

        let tid = robust::tid();
        let word = self.word();

        let res = match word.compare_exchange(0, tid, Ordering::Acquire, Ordering::Relaxed) {
            Ok(_) => Ok(Acquired::Fresh),
            Err(old) if ftx::tid_of(old) == tid => Err(Errno::EDEADLK),
            Err(old)
                if ftx::owner_died(old)
                    && word
                        .compare_exchange(old, tid, Ordering::Acquire, Ordering::Relaxed)
                        .is_ok() =>
            {
                Ok(Acquired::OwnerDied)
            }
            Err(_) => Err(Errno::EBUSY),
        };

        if res.is_ok() {
            self.is_owner.set(true);
            self.shared.tkn.fetch_add(1, Ordering::Relaxed);
            let _ = ftx::broadcast(word);
        }
        res
    }

    /// Release ownership. `EPERM` unless this handle is the owner.
    pub fn release(&self) -> Result<()> {
        if !self.is_owner.get() {
            return Err(Errno::EPERM);
        }

        robust::op_start(&self.shared.mtx);
        robust::op_del(&self.shared.mtx);
        self.word().store(0, Ordering::Release);
        robust::op_end(&self.shared.mtx);

        self.is_owner.set(false);
        let _ = ftx::broadcast(self.word());
        Ok(())
    }

    /// Block until someone owns the deadman; returns the ownership's
    /// take-counter token (for use with [`Deadman::wait_released`]).
    pub fn wait_taken(&self) -> Result<u64> {
        self.wait_taken_opt(None)
    }

    pub fn timed_wait_taken(&self, deadline: TimeMono) -> Result<u64> {
        self.wait_taken_opt(Some(deadline))
    }

    fn wait_taken_opt(&self, deadline: Option<TimeMono>) -> Result<u64> {
        self.inop.store(true, Ordering::SeqCst);
        let res = self.wait_taken_impl(deadline);
        self.inop.store(false, Ordering::SeqCst);
        res
    }

    fn wait_taken_impl(&self, deadline: Option<TimeMono>) -> Result<u64> {
        loop {
            let val = self.word().load(Ordering::Relaxed);
            if val != 0 && !ftx::owner_died(val) {
                return Ok(self.shared.tkn.load(Ordering::Relaxed));
            }
            if self.shutdown.load(Ordering::SeqCst) {
                return Err(Errno::ESHUTDOWN);
            }
            match ftx::wait(self.word(), val, deadline) {
                Ok(()) | Err(Errno::EAGAIN) | Err(Errno::EINTR) => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Block until the ownership identified by `tkn` is over: released,
    /// owner dead, or superseded by a later take.
    pub fn wait_released(&self, tkn: u64) -> Result<()> {
        self.wait_released_opt(tkn, None)
    }

    pub fn timed_wait_released(&self, tkn: u64, deadline: TimeMono) -> Result<()> {
        self.wait_released_opt(tkn, Some(deadline))
    }

    fn wait_released_opt(&self, tkn: u64, deadline: Option<TimeMono>) -> Result<()> {
        self.inop.store(true, Ordering::SeqCst);
        let res = self.wait_released_impl(tkn, deadline);
        self.inop.store(false, Ordering::SeqCst);
        res
    }

    fn wait_released_impl(&self, tkn: u64, deadline: Option<TimeMono>) -> Result<()> {
        loop {
            let val = self.word().load(Ordering::Relaxed);
            if val == 0 || ftx::owner_died(val) || self.shared.tkn.load(Ordering::Relaxed) != tkn {
                return Ok(());
            }
            if self.shutdown.load(Ordering::SeqCst) {
                return Err(Errno::ESHUTDOWN);
            }
            match ftx::wait(self.word(), val, deadline) {
                Ok(()) | Err(Errno::EAGAIN) | Err(Errno::EINTR) => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Non-blocking ownership query.
    pub fn state(&self) -> DeadmanState {
        let mut owner_tid = self.word().load(Ordering::Relaxed);
        if ftx::owner_died(owner_tid) {
            owner_tid = 0;
        }
        let is_taken = owner_tid != 0;
        DeadmanState {
            is_taken,
            is_owner: self.is_owner.get(),
            tkn: if is_taken {
                self.shared.tkn.load(Ordering::Relaxed)
            } else {
                0
            },
        }
    }

    /// Error out this handle's current and future blocking calls with
    /// `ESHUTDOWN`; returns once none is still parked.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        while self.inop.load(Ordering::SeqCst) {
            let _ = ftx::broadcast(self.word());
            core::hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::time::Duration;

    #[test]
    fn take_release_state() {
        let shared = DeadmanShared::new();
        let d = Deadman::new(&shared);

        let st = d.state();
        assert!(!st.is_taken);
        assert!(!st.is_owner);
        assert_eq!(st.tkn, 0);

        assert_eq!(d.take(), Ok(Acquired::Fresh));
        let st = d.state();
        assert!(st.is_taken);
        assert!(st.is_owner);
        assert_eq!(st.tkn, 1);

        // Re-take by the owner is a no-op.
        assert_eq!(d.take(), Ok(Acquired::Fresh));
        assert_eq!(d.state().tkn, 1);

        d.release().unwrap();
        assert!(!d.state().is_taken);
    }

    #[test]
    fn release_requires_ownership() {
        let shared = DeadmanShared::new();
        let d = Deadman::new(&shared);
        assert_eq!(d.release(), Err(Errno::EPERM));
    }

    #[test]
    fn second_handle_sees_busy() {
        let shared = DeadmanShared::new();
        let d1 = Deadman::new(&shared);
        let d2 = Deadman::new(&shared);

        let _ = d1.take().unwrap();
        std::thread::scope(|s| {
            s.spawn(|| {
                assert_eq!(d2.try_take().map(drop), Err(Errno::EBUSY));
                let deadline = TimeMono::after(Duration::from_millis(20));
                assert_eq!(d2.timed_take(deadline).map(drop), Err(Errno::ETIMEDOUT));
            });
        });
        d1.release().unwrap();
    }

    #[test]
    fn same_thread_second_handle_is_deadlock() {
        let shared = DeadmanShared::new();
        let d1 = Deadman::new(&shared);
        let d2 = Deadman::new(&shared);

        let _ = d1.take().unwrap();
        assert_eq!(d2.try_take().map(drop), Err(Errno::EDEADLK));
        d1.release().unwrap();
    }

    #[test]
    fn wait_taken_then_released() {
        let shared = DeadmanShared::new();
        let owner = Deadman::new(&shared);
        let watcher = Deadman::new(&shared);

        std::thread::scope(|s| {
            s.spawn(|| {
                let tkn = watcher.wait_taken().unwrap();
                assert_eq!(tkn, 1);
                watcher.wait_released(tkn).unwrap();
            });

            std::thread::sleep(Duration::from_millis(10));
            let _ = owner.take().unwrap();
            std::thread::sleep(Duration::from_millis(10));
            owner.release().unwrap();
        });
    }

    #[test]
    fn wait_released_observes_supersession() {
        let shared = DeadmanShared::new();
        let owner = Deadman::new(&shared);

        let _ = owner.take().unwrap();
        let tkn = owner.state().tkn;
        owner.release().unwrap();
        let _ = owner.take().unwrap();

        // The watched ownership is long over, even though the deadman is
        // currently taken.
        let watcher = Deadman::new(&shared);
        watcher.wait_released(tkn).unwrap();

        owner.release().unwrap();
    }

    #[test]
    fn timed_wait_taken_expires() {
        let shared = DeadmanShared::new();
        let d = Deadman::new(&shared);
        let deadline = TimeMono::after(Duration::from_millis(20));
        assert_eq!(d.timed_wait_taken(deadline), Err(Errno::ETIMEDOUT));
    }

    #[test]
    fn shutdown_unparks_waiters() {
        let shared = DeadmanShared::new();
        let d = Deadman::new(&shared);

        std::thread::scope(|s| {
            let handle = s.spawn(|| d.wait_taken());
            std::thread::sleep(Duration::from_millis(10));
            d.shutdown();
            assert_eq!(handle.join().unwrap(), Err(Errno::ESHUTDOWN));
        });

        // Shutdown is sticky.
        assert_eq!(d.take().map(drop), Err(Errno::ESHUTDOWN));
    }
}
