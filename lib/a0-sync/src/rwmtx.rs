//! Writer-exclusive, reader-parallel, process-shared mutex.
//!
//! Composed of a guard mutex, a writer mutex, a condition variable, and a
//! *caller-supplied* span of reader-slot mutexes. At most `span.len()`
//! readers hold the lock concurrently; readers never serialize amongst
//! themselves (each occupies its own slot), and writers cannot be starved:
//! a blocked reader re-acquires and releases the writer mutex on every
//! iteration, so it queues behind any waiting writer.
//!
//! Owner death on any internal mutex is absorbed here; the rwmutex itself
//! protects no state that could be left mid-transaction.

use core::cell::UnsafeCell;

use nix::errno::Errno;

use crate::clock::TimeMono;
use crate::mtx::{Cnd, Mtx};
use crate::Result;

/// Lock a mutex, absorbing a dead previous owner.
fn lock_consistent(mtx: &Mtx, deadline: Option<TimeMono>) -> Result<()> {
    let acquired = match deadline {
        None => mtx.lock()?,
        Some(deadline) => mtx.timed_lock(deadline)?,
    };
    if acquired.owner_died() {
        mtx.consistent()?;
    }
    Ok(())
}

/// Try locking a mutex, absorbing a dead previous owner.
fn try_lock_consistent(mtx: &Mtx) -> Result<()> {
    if mtx.try_lock()?.owner_died() {
        mtx.consistent()?;
    }
    Ok(())
}

/// Wait on `cnd` under `guard`, absorbing a dead previous owner of the
/// guard on the way back in.
fn guarded_wait(cnd: &Cnd, guard: &Mtx, deadline: Option<TimeMono>) -> Result<()> {
    let acquired = match deadline {
        None => cnd.wait(guard)?,
        Some(deadline) => cnd.timed_wait(guard, deadline)?,
    };
    if acquired.owner_died() {
        guard.consistent()?;
    }
    Ok(())
}

/// Lock `mtx`, relaxing the guard while blocked so that another thread can
/// release the lock in question.
fn guarded_lock(guard: &Mtx, cnd: &Cnd, mtx: &Mtx, deadline: Option<TimeMono>) -> Result<()> {
    loop {
        match try_lock_consistent(mtx) {
            Err(Errno::EBUSY) => guarded_wait(cnd, guard, deadline)?,
            other => return other,
        }
    }
}

/// Identifies the slot a successful lock operation occupied; required to
/// unlock.
#[must_use]
#[derive(Debug)]
pub struct RwTkn<'a> {
    mtx: &'a Mtx,
}

/// Process-shared read/write mutex.
///
/// `repr(C)`, zero-initialized valid, suitable for shared memory. The
/// reader-slot span is supplied per call so that the caller controls where
/// (and how many) slots live in the shared region; a given `RwMtx` must
/// always be used with the same span.
#[repr(C)]
pub struct RwMtx {
    guard: Mtx,
    wmtx: Mtx,
    cnd: Cnd,
    // Index of the first reader slot not handed out since the last time a
    // writer drained the slots. Guarded by `guard`.
    next_rmtx_idx: UnsafeCell<u64>,
}

// SAFETY: `next_rmtx_idx` is only accessed under `guard`.
unsafe impl Send for RwMtx {}
unsafe impl Sync for RwMtx {}

impl RwMtx {
    pub const fn new() -> RwMtx {
        RwMtx {
            guard: Mtx::new(),
            wmtx: Mtx::new(),
            cnd: Cnd::new(),
            next_rmtx_idx: UnsafeCell::new(0),
        }
    }

    // Caller holds `guard` for both accessors.
    fn next_idx(&self) -> u64 {
        unsafe { *self.next_rmtx_idx.get() }
    }

    fn set_next_idx(&self, val: u64) {
        unsafe { *self.next_rmtx_idx.get() = val }
    }

    /// Grab an available reader slot. Requires the guard to be held.
    fn try_rlock_slot<'s>(&self, rmtx_span: &'s [Mtx]) -> Result<RwTkn<'s>> {
        // If there are more slots than have been handed out, grab a known
        // free one. This is the common case when there have been fewer
        // concurrent readers than slots since the last writer lock.
        let idx = self.next_idx();
        if (idx as usize) < rmtx_span.len() {
            let rmtx = &rmtx_span[idx as usize];
            self.set_next_idx(idx + 1);
            lock_consistent(rmtx, None)?;
            return Ok(RwTkn { mtx: rmtx });
        }

        // All slots have been handed out at some point since the last
        // writer lock. Check whether any have been released since.
        for rmtx in rmtx_span {
            if try_lock_consistent(rmtx).is_ok() {
                return Ok(RwTkn { mtx: rmtx });
            }
        }

        Err(Errno::EBUSY)
    }

    /// Acquire a reader slot without blocking. `EBUSY` if a writer is
    /// active or all slots are taken.
    pub fn try_rlock<'s>(&self, rmtx_span: &'s [Mtx]) -> Result<RwTkn<'s>> {
        lock_consistent(&self.guard, None)?;

        // Grab and release the writer mutex. Failure means a writer is
        // active and this try-rlock fails.
        let res = match try_lock_consistent(&self.wmtx) {
            Ok(()) => {
                self.wmtx.unlock()?;
                self.try_rlock_slot(rmtx_span)
            }
            Err(err) => Err(err),
        };

        self.guard.unlock()?;
        res
    }

    /// Acquire a reader slot, waiting as long as it takes.
    pub fn rlock<'s>(&self, rmtx_span: &'s [Mtx]) -> Result<RwTkn<'s>> {
        self.rlock_opt(rmtx_span, None)
    }

    /// Acquire a reader slot, waiting no later than `deadline`.
    pub fn timed_rlock<'s>(&self, rmtx_span: &'s [Mtx], deadline: TimeMono) -> Result<RwTkn<'s>> {
        self.rlock_opt(rmtx_span, Some(deadline))
    }

    fn rlock_opt<'s>(&self, rmtx_span: &'s [Mtx], deadline: Option<TimeMono>) -> Result<RwTkn<'s>> {
        lock_consistent(&self.guard, deadline)?;

        let res = loop {
            // Block until the writer mutex is available, then let it go
            // immediately. Holding it across attempts would starve wlock.
            if let Err(err) = guarded_lock(&self.guard, &self.cnd, &self.wmtx, deadline) {
                break Err(err);
            }
            self.wmtx.unlock()?;

            match self.try_rlock_slot(rmtx_span) {
                Err(Errno::EBUSY) => {
                    // No reader slot available right now. Sleep until an
                    // unlock event and try again.
                    if let Err(err) = guarded_wait(&self.cnd, &self.guard, deadline) {
                        break Err(err);
                    }
                }
                other => break other,
            }
        };

        self.guard.unlock()?;
        res
    }

    /// Acquire the writer lock without blocking. `EBUSY` if a writer or
    /// any reader is active.
    pub fn try_wlock<'s>(&'s self, rmtx_span: &'s [Mtx]) -> Result<RwTkn<'s>> {
        lock_consistent(&self.guard, None)?;

        let res = self.try_wlock_impl(rmtx_span);

        self.guard.unlock()?;
        res
    }

    fn try_wlock_impl<'s>(&'s self, rmtx_span: &'s [Mtx]) -> Result<RwTkn<'s>> {
        try_lock_consistent(&self.wmtx)?;

        // Probe every handed-out reader slot; a held slot aborts.
        loop {
            let idx = self.next_idx();
            if idx == 0 {
                break;
            }
            let rmtx = &rmtx_span[idx as usize - 1];
            if let Err(err) = try_lock_consistent(rmtx) {
                self.wmtx.unlock()?;
                return Err(err);
            }
            rmtx.unlock()?;
            self.set_next_idx(idx - 1);
        }

        Ok(RwTkn { mtx: &self.wmtx })
    }

    /// Acquire the writer lock, waiting as long as it takes.
    pub fn wlock<'s>(&'s self, rmtx_span: &'s [Mtx]) -> Result<RwTkn<'s>> {
        self.wlock_opt(rmtx_span, None)
    }

    /// Acquire the writer lock, waiting no later than `deadline`.
    pub fn timed_wlock<'s>(&'s self, rmtx_span: &'s [Mtx], deadline: TimeMono) -> Result<RwTkn<'s>> {
        self.wlock_opt(rmtx_span, Some(deadline))
    }

    fn wlock_opt<'s>(&'s self, rmtx_span: &'s [Mtx], deadline: Option<TimeMono>) -> Result<RwTkn<'s>> {
        lock_consistent(&self.guard, deadline)?;

        if let Err(err) = guarded_lock(&self.guard, &self.cnd, &self.wmtx, deadline) {
            self.guard.unlock()?;
            return Err(err);
        }

        // Drain every handed-out reader slot, waiting for each. On expiry
        // the writer mutex is surrendered.
        loop {
            let idx = self.next_idx();
            if idx == 0 {
                break;
            }
            let rmtx = &rmtx_span[idx as usize - 1];
            if let Err(err) = guarded_lock(&self.guard, &self.cnd, rmtx, deadline) {
                self.wmtx.unlock()?;
                self.guard.unlock()?;
                return Err(err);
            }
            rmtx.unlock()?;
            self.set_next_idx(idx - 1);
        }

        self.guard.unlock()?;
        Ok(RwTkn { mtx: &self.wmtx })
    }

    /// Release a held slot and wake parked lockers.
    pub fn unlock(&self, tkn: RwTkn<'_>) -> Result<()> {
        // The slot is released outside the guard to avoid lock inversion.
        tkn.mtx.unlock()?;

        // Notify that a slot is available.
        lock_consistent(&self.guard, None)?;
        let _ = self.cnd.broadcast(&self.guard);
        self.guard.unlock()
    }
}

impl Default for RwMtx {
    fn default() -> RwMtx {
        RwMtx::new()
    }
}
