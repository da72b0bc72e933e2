//! A crash-resilient shared-memory transport.
//!
//! The transport is a single-producer/multiple-consumer, bounded,
//! ring-structured log living entirely inside a caller-provided region of
//! shared memory (an [`Arena`], typically a memory-mapped file). Any
//! participating process may die at any instant, including in the middle
//! of a mutation, without corrupting the shared state or deadlocking the
//! survivors:
//!
//! * all mutation happens under a robust, priority-inheriting mutex
//!   ([`a0_sync::mtx::Mtx`]) embedded in the region;
//! * the mutable log state is double-buffered, and publishing a mutation is
//!   a single index flip ([`transport::LockedTransport::commit`]), so an
//!   observer of the committed page always sees a consistent log;
//! * a locker that inherits the mutex from a dead process finds the working
//!   page automatically reset to the committed page.
//!
//! New frames evict the oldest frames when the ring wraps; readers that
//! fall behind observe a broken-pipe error and rewind to the head. The
//! [`deadman`] module builds a single-owner liveness token from the same
//! primitives.

// https://github.com/rust-lang/rfcs/blob/master/text/2585-unsafe-block-in-unsafe-fn.md
#![deny(unsafe_op_in_unsafe_fn)]

pub mod arena;
pub mod deadman;
pub mod transport;

pub use a0_sync::{Errno, Result};

pub use arena::{Arena, ArenaMode};
pub use deadman::{Deadman, DeadmanShared, DeadmanState};
pub use transport::{Frame, FrameMut, InitStatus, LockedTransport, Transport};
