//! The arena contract: a borrowed view of caller-owned shared memory.
//!
//! The transport never maps, resizes or unmaps memory. Whoever creates the
//! mapping (a shared-memory file, an inherited anonymous mapping, a plain
//! heap buffer in tests) hands the transport an [`Arena`] describing it and
//! keeps the mapping alive for as long as any handle uses it.

use core::ptr::NonNull;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArenaMode {
    /// Normal operation; the region is writable and shared.
    Shared,
    /// Attach-only. Every operation that would write arena bytes,
    /// including taking the embedded mutex, fails with `EPERM`.
    ReadOnly,
}

/// A contiguous region of memory shared by all participants of a transport.
///
/// The region's length is fixed for the life of the handle, and its
/// contents must be all zero when the very first participant attaches.
#[derive(Debug, Clone, Copy)]
pub struct Arena {
    base: NonNull<u8>,
    len: usize,
    mode: ArenaMode,
}

// SAFETY: an `Arena` is a plain (pointer, length) view; all synchronization
// of the pointed-to bytes is the transport's responsibility.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// Wrap a raw region.
    ///
    /// # Safety
    ///
    /// `base` must point to `len` bytes that stay valid and mapped at a
    /// stable address for the lifetime of every transport handle built on
    /// this arena, in every participating process's own address space.
    pub unsafe fn from_raw_parts(base: NonNull<u8>, len: usize, mode: ArenaMode) -> Arena {
        Arena { base, len, mode }
    }

    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn mode(&self) -> ArenaMode {
        self.mode
    }
}
