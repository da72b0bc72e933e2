//! Shared helpers for the transport tests: a `MAP_SHARED | MAP_ANONYMOUS`
//! mapping that survives `fork` (standing in for the shared-memory file a
//! real deployment would use), and a child-process harness.

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::num::NonZeroUsize;
use std::ptr::NonNull;

use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult};

use a0_transport::{Arena, ArenaMode};

pub struct SharedMem {
    ptr: NonNull<libc::c_void>,
    len: usize,
}

impl SharedMem {
    pub fn new(len: usize) -> SharedMem {
        let ptr = unsafe {
            mmap_anonymous(
                None,
                NonZeroUsize::new(len).unwrap(),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED | MapFlags::MAP_ANONYMOUS,
            )
        }
        .unwrap();
        SharedMem { ptr, len }
    }

    pub fn arena(&self) -> Arena {
        unsafe {
            Arena::from_raw_parts(
                NonNull::new(self.ptr.as_ptr() as *mut u8).unwrap(),
                self.len,
                ArenaMode::Shared,
            )
        }
    }

    pub fn arena_readonly(&self) -> Arena {
        unsafe {
            Arena::from_raw_parts(
                NonNull::new(self.ptr.as_ptr() as *mut u8).unwrap(),
                self.len,
                ArenaMode::ReadOnly,
            )
        }
    }
}

impl Drop for SharedMem {
    fn drop(&mut self) {
        let _ = unsafe { munmap(self.ptr, self.len) };
    }
}

/// Run `child` in a forked process and `parent` here; assert the child
/// exited cleanly. A panic in the child turns into a nonzero exit.
pub fn with_child(child: impl FnOnce(), parent: impl FnOnce(nix::unistd::Pid)) {
    match unsafe { fork() }.unwrap() {
        ForkResult::Child => {
            // Ensure we exit with a non-zero exit code on panic.
            std::panic::set_hook(Box::new(|info| {
                eprintln!("panic in child: {info:?}");
                unsafe { libc::exit(1) };
            }));
            child();
            unsafe { libc::exit(0) };
        }
        ForkResult::Parent { child } => {
            parent(child);
            // The parent callback may have already reaped a killed child;
            // only insist on a clean exit if it is still around.
            match waitpid(child, None) {
                Ok(WaitStatus::Exited(pid, code)) => {
                    assert_eq!(pid, child);
                    assert_eq!(code, 0);
                }
                Ok(status) => panic!("unexpected child status: {status:?}"),
                Err(nix::errno::Errno::ECHILD) => {}
                Err(err) => panic!("waitpid failed: {err}"),
            }
        }
    }
}
