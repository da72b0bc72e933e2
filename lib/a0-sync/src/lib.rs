//! Process-shared synchronization primitives for shared memory.
//!
//! This is a collection of synchronization primitives intended for use in
//! shared memory mapped into multiple cooperating processes, potentially at
//! different virtual addresses. They differ from the primitives in `std` in
//! three ways:
//!
//! * They have a fixed `repr(C)` layout and are valid when zero-initialized,
//!   so they can live inside a freshly `ftruncate`d shared-memory file.
//! * They are self-contained; no `Box`, no process-local lock state.
//! * They are *robust*: if a process dies while holding a lock, the kernel
//!   flags the lock word and the next acquirer recovers it instead of
//!   deadlocking. See [`robust`] for the registry that makes this work.
//!
//! The mutex is additionally priority-inheriting and error-checking, built
//! on the `FUTEX_LOCK_PI` family of operations ([`ftx`]).
//!
//! All fallible operations return [`Errno`]; each failure kind maps onto a
//! single POSIX errno. Owner death is *not* an error: lock acquisition
//! reports it as [`mtx::Acquired::OwnerDied`], a success with a caveat that
//! the caller must reconcile the protected state.

// https://github.com/rust-lang/rfcs/blob/master/text/2585-unsafe-block-in-unsafe-fn.md
#![deny(unsafe_op_in_unsafe_fn)]

pub mod clock;
pub mod ftx;
pub mod mtx;
pub mod robust;
pub mod rwmtx;

pub use nix::errno::Errno;

pub type Result<T> = core::result::Result<T, Errno>;
