//! Thin blocking wrappers over the futex syscall.
//!
//! Everything here operates on a [`Ftx`]: a 32-bit futex word placed in
//! memory shared between processes. None of the operations use
//! `FUTEX_PRIVATE_FLAG`, so they work across address spaces.
//!
//! The wrappers are deliberately minimal. They report `EINTR` and `EAGAIN`
//! to the caller (a futex wait is allowed to wake spuriously); every caller
//! in this crate retries on those. Timeouts are monotonic deadlines; the
//! plain `FUTEX_WAIT` takes a relative timeout and the PI operations take an
//! absolute `CLOCK_REALTIME` one, and [`TimeMono`] converts to both.

use core::sync::atomic::{AtomicU32, Ordering};

use nix::errno::Errno;

use crate::clock::TimeMono;
use crate::Result;

/// A futex word.
///
/// Operations rely on the address; a `Ftx` must not be copied or moved while
/// in use. Zero-initialized memory is a valid (unlocked / zero-count) word.
#[derive(Debug)]
#[repr(transparent)]
pub struct Ftx(AtomicU32);

// The kernel interprets the word as a plain u32 at the same address.
static_assertions::assert_eq_size!(Ftx, u32);
static_assertions::assert_eq_align!(Ftx, u32);

impl Ftx {
    pub const fn new(val: u32) -> Ftx {
        Ftx(AtomicU32::new(val))
    }

    pub fn load(&self, ord: Ordering) -> u32 {
        self.0.load(ord)
    }

    pub fn store(&self, val: u32, ord: Ordering) {
        self.0.store(val, ord)
    }

    pub fn fetch_add(&self, val: u32, ord: Ordering) -> u32 {
        self.0.fetch_add(val, ord)
    }

    pub fn fetch_and(&self, val: u32, ord: Ordering) -> u32 {
        self.0.fetch_and(val, ord)
    }

    pub fn compare_exchange(
        &self,
        current: u32,
        new: u32,
        success: Ordering,
        failure: Ordering,
    ) -> core::result::Result<u32, u32> {
        self.0.compare_exchange(current, new, success, failure)
    }

    fn as_ptr(&self) -> *mut u32 {
        self.0.as_ptr()
    }
}

// Kernel encoding of a PI / robust futex word.
pub const FTX_WAITERS: u32 = 0x8000_0000;
pub const FTX_OWNER_DIED: u32 = 0x4000_0000;
pub const FTX_TID_MASK: u32 = 0x3fff_ffff;

/// The owning thread id encoded in a PI futex word.
pub fn tid_of(word: u32) -> u32 {
    word & FTX_TID_MASK
}

/// Whether the kernel has flagged the word as held by a dead thread.
pub fn owner_died(word: u32) -> bool {
    word & FTX_OWNER_DIED != 0
}

fn futex(
    ftx: &Ftx,
    op: libc::c_int,
    val: u32,
    timeout: *const libc::timespec,
    ftx2: *mut u32,
    val3: u32,
) -> Result<()> {
    Errno::result(unsafe {
        libc::syscall(libc::SYS_futex, ftx.as_ptr(), op, val, timeout, ftx2, val3)
    })
    .map(drop)
}

fn timespec_ptr(ts: &Option<libc::timespec>) -> *const libc::timespec {
    ts.as_ref()
        .map_or(core::ptr::null(), |ts| ts as *const libc::timespec)
}

/// Park until `ftx != expected` or the deadline passes.
pub fn wait(ftx: &Ftx, expected: u32, deadline: Option<TimeMono>) -> Result<()> {
    let ts = match deadline {
        None => None,
        // FUTEX_WAIT takes a relative timeout.
        Some(deadline) => match deadline.as_relative_timespec() {
            None => return Err(Errno::ETIMEDOUT),
            Some(rel) => Some(rel),
        },
    };
    futex(
        ftx,
        libc::FUTEX_WAIT,
        expected,
        timespec_ptr(&ts),
        core::ptr::null_mut(),
        0,
    )
}

/// Wake up to `n` waiters parked on `ftx`.
pub fn wake(ftx: &Ftx, n: i32) -> Result<()> {
    futex(
        ftx,
        libc::FUTEX_WAKE,
        n as u32,
        core::ptr::null(),
        core::ptr::null_mut(),
        0,
    )
}

pub fn signal(ftx: &Ftx) -> Result<()> {
    wake(ftx, 1)
}

pub fn broadcast(ftx: &Ftx) -> Result<()> {
    wake(ftx, i32::MAX)
}

/// Kernel-assisted priority-inheriting lock of a PI futex word.
pub fn lock_pi(ftx: &Ftx, deadline: Option<TimeMono>) -> Result<()> {
    // PI timeouts are absolute CLOCK_REALTIME.
    let ts = deadline.map(TimeMono::as_realtime_timespec);
    futex(
        ftx,
        libc::FUTEX_LOCK_PI,
        0,
        timespec_ptr(&ts),
        core::ptr::null_mut(),
        0,
    )
}

/// Kernel-assisted try-lock, used to resolve an owner-died word that cannot
/// be safely claimed with a bare compare-and-swap.
pub fn trylock_pi(ftx: &Ftx) -> Result<()> {
    futex(
        ftx,
        libc::FUTEX_TRYLOCK_PI,
        0,
        core::ptr::null(),
        core::ptr::null_mut(),
        0,
    )
}

pub fn unlock_pi(ftx: &Ftx) -> Result<()> {
    futex(
        ftx,
        libc::FUTEX_UNLOCK_PI,
        0,
        core::ptr::null(),
        core::ptr::null_mut(),
        0,
    )
}

/// Park on `cnd` (while `cnd == expected`) and, when woken, atomically
/// acquire the PI mutex word `mtx`.
pub fn wait_requeue_pi(
    cnd: &Ftx,
    expected: u32,
    deadline: Option<TimeMono>,
    mtx: &Ftx,
) -> Result<()> {
    let ts = deadline.map(TimeMono::as_realtime_timespec);
    futex(
        cnd,
        libc::FUTEX_WAIT_REQUEUE_PI,
        expected,
        timespec_ptr(&ts),
        mtx.as_ptr(),
        0,
    )
}

/// Wake one waiter parked on `cnd` and requeue up to `n_requeue` more onto
/// the PI mutex word `mtx`, without waking them.
///
/// Fails with `EAGAIN` if `cnd != expected` (a racing signaller bumped the
/// counter); the caller reloads and retries.
pub fn cmp_requeue_pi(cnd: &Ftx, expected: u32, mtx: &Ftx, n_requeue: i32) -> Result<()> {
    // val2 rides in the timeout slot of the syscall.
    futex(
        cnd,
        libc::FUTEX_CMP_REQUEUE_PI,
        1,
        n_requeue as usize as *const libc::timespec,
        mtx.as_ptr(),
        expected,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::time::Duration;

    #[test]
    fn word_helpers() {
        assert_eq!(tid_of(1234 | FTX_OWNER_DIED | FTX_WAITERS), 1234);
        assert!(owner_died(1 | FTX_OWNER_DIED));
        assert!(!owner_died(1 | FTX_WAITERS));
    }

    #[test]
    fn wait_value_mismatch_is_eagain() {
        let ftx = Ftx::new(7);
        assert_eq!(wait(&ftx, 8, None), Err(Errno::EAGAIN));
    }

    #[test]
    fn wait_times_out() {
        let ftx = Ftx::new(7);
        let deadline = TimeMono::after(Duration::from_millis(10));
        assert_eq!(wait(&ftx, 7, Some(deadline)), Err(Errno::ETIMEDOUT));
    }

    #[test]
    fn expired_deadline_short_circuits() {
        let ftx = Ftx::new(7);
        let deadline = TimeMono::now();
        std::thread::sleep(Duration::from_millis(1));
        assert_eq!(wait(&ftx, 7, Some(deadline)), Err(Errno::ETIMEDOUT));
    }

    #[test]
    fn wake_with_no_waiters() {
        let ftx = Ftx::new(0);
        assert_eq!(wake(&ftx, 1), Ok(()));
        assert_eq!(broadcast(&ftx), Ok(()));
    }
}
