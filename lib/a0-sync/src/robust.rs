//! The per-thread robust-list registry.
//!
//! Every thread that takes a [`Mtx`](crate::mtx::Mtx) owns a linked list of
//! the mutexes it currently holds, registered with the kernel via
//! `set_robust_list`. When the thread dies by any path, including the
//! whole process being killed, the kernel walks the list and sets
//! `FUTEX_OWNER_DIED` on each held futex word, waking one waiter. That is
//! the entire recovery story: no daemon, no timeout.
//!
//! The list handshake follows the kernel's documented protocol: the mutex
//! about to be (un)linked is published in `list_op_pending` before the
//! operation and cleared after, so a death in the middle of an acquire or
//! release is still observed.
//!
//! The registry is registered lazily on each thread's first lock operation.
//! A forked child inherits the parent's registration, which points at the
//! parent's addresses; an atfork handler clears the thread-local flag so
//! the child re-registers on first use.

use core::cell::UnsafeCell;
use core::mem;
use core::ptr;
use core::sync::atomic::{compiler_fence, Ordering};

use crate::mtx::Mtx;

/// Kernel ABI for the robust-list head (see `set_robust_list(2)`).
///
/// The first field doubles as the embedded list node: an empty list is the
/// head pointing at itself, and [`Mtx`] starts with the same next/prev pair
/// so the head can be spliced like any other entry.
#[repr(C)]
struct RobustListHead {
    next: *mut Mtx,
    futex_offset: libc::c_long,
    list_op_pending: *mut Mtx,
}

struct ThreadState {
    head: RobustListHead,
    registered: bool,
    tid: u32,
}

thread_local! {
    static THREAD_STATE: UnsafeCell<ThreadState> = const {
        UnsafeCell::new(ThreadState {
            head: RobustListHead {
                next: ptr::null_mut(),
                futex_offset: 0,
                list_op_pending: ptr::null_mut(),
            },
            registered: false,
            tid: 0,
        })
    };
}

static ATFORK_ONCE: std::sync::Once = std::sync::Once::new();

extern "C" fn atfork_child_reset() {
    // Runs on the (single) surviving thread of the child. The inherited
    // registration and cached tid belong to the parent.
    let _ = THREAD_STATE.try_with(|state| {
        let state = unsafe { &mut *state.get() };
        state.registered = false;
        state.tid = 0;
    });
}

fn with_state<R>(f: impl FnOnce(&mut ThreadState) -> R) -> R {
    THREAD_STATE.with(|state| {
        let state = unsafe { &mut *state.get() };
        if !state.registered {
            init_thread(state);
        }
        f(state)
    })
}

fn init_thread(state: &mut ThreadState) {
    ATFORK_ONCE.call_once(|| unsafe {
        libc::pthread_atfork(None, None, Some(atfork_child_reset));
    });

    state.head.next = head_entry(state);
    state.head.futex_offset = mem::offset_of!(Mtx, ftx) as libc::c_long;
    state.head.list_op_pending = ptr::null_mut();
    unsafe {
        libc::syscall(
            libc::SYS_set_robust_list,
            &state.head as *const RobustListHead,
            mem::size_of::<RobustListHead>(),
        );
    }

    state.tid = rustix::thread::gettid().as_raw_nonzero().get() as u32;
    state.registered = true;
}

/// The head, viewed as a list entry (layout-compatible first field).
fn head_entry(state: &mut ThreadState) -> *mut Mtx {
    &mut state.head as *mut RobustListHead as *mut Mtx
}

/// The calling thread's kernel tid, as stored into futex words.
pub fn tid() -> u32 {
    with_state(|state| state.tid)
}

/// Publish `mtx` as the in-progress list operation.
pub fn op_start(mtx: &Mtx) {
    with_state(|state| {
        debug_assert!(state.head.list_op_pending.is_null());
        state.head.list_op_pending = mtx as *const Mtx as *mut Mtx;
        compiler_fence(Ordering::SeqCst);
    })
}

/// Clear the in-progress marker.
pub fn op_end(mtx: &Mtx) {
    with_state(|state| {
        debug_assert!(core::ptr::eq(state.head.list_op_pending, mtx));
        compiler_fence(Ordering::SeqCst);
        state.head.list_op_pending = ptr::null_mut();
    })
}

/// Splice a just-acquired `mtx` to the front of the thread's list.
pub fn op_add(mtx: &Mtx) {
    with_state(|state| {
        let head = head_entry(state);
        let mtx_ptr = mtx as *const Mtx as *mut Mtx;
        let old_first = state.head.next;

        mtx.robust_prev.set(head);
        mtx.robust_next.set(old_first);

        compiler_fence(Ordering::SeqCst);

        state.head.next = mtx_ptr;
        if old_first != head {
            unsafe { (*old_first).robust_prev.set(mtx_ptr) };
        }
    })
}

/// Unlink a to-be-released `mtx` from the thread's list.
pub fn op_del(mtx: &Mtx) {
    with_state(|state| {
        let head = head_entry(state);
        let prev = mtx.robust_prev.get();
        let next = mtx.robust_next.get();

        // `prev` may be the head itself; the next pointer sits at offset
        // zero in both, so the write below is valid either way.
        unsafe { (*prev).robust_next.set(next) };
        if next != head {
            unsafe { (*next).robust_prev.set(prev) };
        }
    })
}
