//! Monotonic deadlines for the timed lock and wait variants.
//!
//! All timed operations in this workspace take an absolute [`TimeMono`]
//! deadline rather than a duration, so that a deadline can be threaded
//! through several blocking calls without drifting.

use core::time::Duration;

use rustix::time::{clock_gettime, ClockId};

const NS_PER_SEC: u64 = 1_000_000_000;

/// An instant on `CLOCK_MONOTONIC`, stored as nanoseconds since the clock's
/// (unspecified) epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimeMono {
    nanos: u64,
}

impl TimeMono {
    pub fn now() -> TimeMono {
        let ts = clock_gettime(ClockId::Monotonic);
        TimeMono {
            nanos: ts.tv_sec as u64 * NS_PER_SEC + ts.tv_nsec as u64,
        }
    }

    /// The current time plus `d`. The usual way to build a deadline.
    pub fn after(d: Duration) -> TimeMono {
        TimeMono::now().add(d)
    }

    pub fn add(self, d: Duration) -> TimeMono {
        TimeMono {
            nanos: self.nanos.saturating_add(d.as_nanos() as u64),
        }
    }

    /// Time left until the deadline, or `None` if it has already passed.
    pub fn remaining(self) -> Option<Duration> {
        let now = TimeMono::now();
        if self.nanos <= now.nanos {
            return None;
        }
        Some(Duration::from_nanos(self.nanos - now.nanos))
    }

    /// Relative timeout form, as consumed by `FUTEX_WAIT`.
    pub(crate) fn as_relative_timespec(self) -> Option<libc::timespec> {
        let rem = self.remaining()?;
        Some(libc::timespec {
            tv_sec: rem.as_secs() as libc::time_t,
            tv_nsec: rem.subsec_nanos() as libc::c_long,
        })
    }

    /// Absolute `CLOCK_REALTIME` form, as consumed by the PI futex
    /// operations. The kernel interprets PI timeouts against the realtime
    /// clock, so the monotonic deadline is shifted by the current offset
    /// between the two clocks.
    pub(crate) fn as_realtime_timespec(self) -> libc::timespec {
        let mono_now = TimeMono::now();
        let real_now = clock_gettime(ClockId::Realtime);
        let real_now_ns = real_now.tv_sec as i128 * NS_PER_SEC as i128 + real_now.tv_nsec as i128;
        let abs = real_now_ns + self.nanos as i128 - mono_now.nanos as i128;
        let abs = abs.max(0);
        libc::timespec {
            tv_sec: (abs / NS_PER_SEC as i128) as libc::time_t,
            tv_nsec: (abs % NS_PER_SEC as i128) as libc::c_long,
        }
    }
}
