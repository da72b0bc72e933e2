//! The shared-memory log: header layout, the doubly linked frame ring,
//! allocation and eviction, iteration, and the await/notify protocol.
//!
//! Layout, from offset 0 of the arena:
//!
//! * the transport header: initialization gate, robust mutex, wake futex,
//!   double-buffered state pages, cached sizes;
//! * an opaque metadata region of the size fixed at creation;
//! * the frame ring: max-aligned frames, each a [`FrameHdr`] followed by its
//!   payload, linked to its neighbors by arena-relative offsets.
//!
//! Frames are views into the arena parameterized by offset, never native
//! pointers: the arena maps at a different address in every process.
//!
//! All mutation happens under the header mutex and lands in the *working*
//! state page; [`LockedTransport::commit`] publishes it by flipping the
//! committed-page index. Acquiring the lock always starts by copying the
//! committed page over the working page, which is what silently discards
//! the half-finished transaction of a process that died holding the lock.

use core::cell::Cell;
use core::fmt;
use core::mem;
use core::slice;
use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use a0_sync::clock::TimeMono;
use a0_sync::ftx::{self, Ftx};
use a0_sync::mtx::{Acquired, Mtx};
use a0_sync::{Errno, Result};

use crate::arena::{Arena, ArenaMode};

/// Alignment of the header, the data region and every frame.
const MAX_ALIGN: u64 = 16;

const fn align_max(off: u64) -> u64 {
    (off + MAX_ALIGN - 1) & !(MAX_ALIGN - 1)
}

/// One copy of the mutable log state. Two of these live in the header; the
/// committed one is authoritative, the other is scratch for the transaction
/// in progress.
///
/// The log is empty iff `seq_high == 0` or `seq_low > seq_high`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct StatePage {
    seq_low: u64,
    seq_high: u64,
    off_head: u64,
    off_tail: u64,
}

/// Prefix of every frame in the ring.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameHdr {
    /// Strictly increasing, never reused.
    pub seq: u64,
    /// This frame's own arena offset, for validation and debugging.
    pub off: u64,
    /// Arena offset of the previous live frame; zero at the head.
    pub prev_off: u64,
    /// Arena offset of the next live frame; zero at the tail.
    pub next_off: u64,
    /// Payload bytes following this header.
    pub data_size: u64,
}

const FRAME_HDR_SIZE: u64 = mem::size_of::<FrameHdr>() as u64;

/// The shared header at offset 0 of the arena. Constructed exactly once per
/// arena by whichever process wins the initialization race; all fields are
/// valid when zeroed.
#[repr(C, align(16))]
struct TransportHdr {
    init_started: AtomicU8,
    init_completed: AtomicU8,
    _pad0: [u8; 14],

    mu: Mtx,

    wake_ftx: Ftx,
    next_tkn: AtomicU32,
    has_waiter: AtomicU8,
    _pad1: [u8; 15],

    // Mutated only under `mu`.
    state_pages: core::cell::UnsafeCell<[StatePage; 2]>,
    committed_page_idx: AtomicU32,
    _pad2: [u8; 4],

    // Written once by the creator, before `init_completed` is published.
    arena_size: core::cell::UnsafeCell<u64>,
    metadata_size: core::cell::UnsafeCell<u64>,
}

// The layout is shared-memory ABI; pin it.
static_assertions::const_assert_eq!(mem::offset_of!(TransportHdr, init_started), 0);
static_assertions::const_assert_eq!(mem::offset_of!(TransportHdr, init_completed), 1);
static_assertions::const_assert_eq!(mem::offset_of!(TransportHdr, mu), 16);
static_assertions::const_assert_eq!(mem::offset_of!(TransportHdr, wake_ftx), 40);
static_assertions::const_assert_eq!(mem::offset_of!(TransportHdr, next_tkn), 44);
static_assertions::const_assert_eq!(mem::offset_of!(TransportHdr, has_waiter), 48);
static_assertions::const_assert_eq!(mem::offset_of!(TransportHdr, state_pages), 64);
static_assertions::const_assert_eq!(mem::offset_of!(TransportHdr, committed_page_idx), 128);
static_assertions::const_assert_eq!(mem::offset_of!(TransportHdr, arena_size), 136);
static_assertions::const_assert_eq!(mem::offset_of!(TransportHdr, metadata_size), 144);
static_assertions::const_assert_eq!(mem::size_of::<TransportHdr>(), 160);
static_assertions::const_assert_eq!(mem::size_of::<StatePage>(), 32);
static_assertions::const_assert_eq!(mem::size_of::<FrameHdr>(), 40);

const HDR_SIZE: u64 = mem::size_of::<TransportHdr>() as u64;

/// Byte offset of the opaque metadata region.
const METADATA_OFF: u64 = align_max(HDR_SIZE);

/// Outcome of attaching to an arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStatus {
    /// This process won the initialization race and built the header.
    Created,
    /// The header already existed (or another process built it first).
    Connected,
}

fn intersects(start1: u64, size1: u64, start2: u64, size2: u64) -> bool {
    start1 < start2 + size2 && start2 < start1 + size1
}

/// A per-process handle onto a transport.
///
/// The handle carries this reader's cursor and the await/close bookkeeping.
/// It may be shared across threads (e.g. one thread blocked in
/// [`LockedTransport::wait`] while another calls [`Transport::close`]); all
/// of its interior state is only touched under the header mutex.
pub struct Transport {
    arena: Arena,

    // Reader cursor.
    seq: Cell<u64>,
    off: Cell<u64>,

    // Await/close bookkeeping.
    await_cnt: Cell<u32>,
    closing: Cell<bool>,
    closed: Cell<bool>,

    // Critical-section bookkeeping, valid while the lock is held.
    lk_tkn: Cell<u32>,
    should_notify: Cell<bool>,
}

// SAFETY: every Cell is only accessed while holding the in-arena header
// mutex (`lock` / the await protocol), which serializes all threads of all
// processes attached to the arena.
unsafe impl Send for Transport {}
unsafe impl Sync for Transport {}

impl Transport {
    /// Attach to `arena`, initializing the header if this process gets
    /// there first.
    ///
    /// `metadata_size` is honored only by the creator; later attachments
    /// observe the creator's value. `EOVERFLOW` if the arena cannot hold
    /// the header, the metadata, and at least a minimal frame.
    pub fn init(arena: Arena, metadata_size: u64) -> Result<(Transport, InitStatus)> {
        if arena.base().as_ptr() as u64 % MAX_ALIGN != 0 {
            return Err(Errno::EINVAL);
        }
        if METADATA_OFF + metadata_size + 64 >= arena.len() as u64 {
            return Err(Errno::EOVERFLOW);
        }

        let transport = Transport {
            arena,
            seq: Cell::new(0),
            off: Cell::new(0),
            await_cnt: Cell::new(0),
            closing: Cell::new(false),
            closed: Cell::new(false),
            lk_tkn: Cell::new(0),
            should_notify: Cell::new(false),
        };
        let hdr = transport.hdr();

        if arena.mode() == ArenaMode::ReadOnly {
            // Cannot create, cannot even spin-wait usefully on an arena
            // nobody has started initializing.
            if hdr.init_started.load(Ordering::Acquire) == 0 {
                return Err(Errno::EAGAIN);
            }
            while hdr.init_completed.load(Ordering::Relaxed) == 0 {
                core::hint::spin_loop();
            }
            return Ok((transport, InitStatus::Connected));
        }

        // The arena is expected to be either all null bytes (guaranteed by
        // ftruncate on a fresh shared-memory file) or a previously
        // initialized header.
        if hdr
            .init_started
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            transport.init_create(metadata_size)?;
            log::debug!("transport created, arena_size={}", arena.len());
            return Ok((transport, InitStatus::Created));
        }

        // Spin until the winner finishes.
        while hdr.init_completed.load(Ordering::Relaxed) == 0 {
            core::hint::spin_loop();
        }
        core::sync::atomic::fence(Ordering::Acquire);
        log::debug!("transport connected, arena_size={}", arena.len());
        Ok((transport, InitStatus::Connected))
    }

    fn init_create(&self, metadata_size: u64) -> Result<()> {
        let hdr = self.hdr();
        unsafe {
            // No other process gets past the gate until `init_completed`,
            // so these plain writes cannot race.
            let hdr_ptr: *const TransportHdr = hdr;
            core::ptr::write(core::ptr::addr_of!((*hdr_ptr).mu) as *mut Mtx, Mtx::new());
            *hdr.state_pages.get() = [StatePage::default(); 2];
            *hdr.arena_size.get() = self.arena.len() as u64;
            *hdr.metadata_size.get() = metadata_size;
        }

        // Hold the lock across publication so the creator's first critical
        // section is ordered before any connector's.
        let _acquired = self.lock_impl()?;
        hdr.init_completed.store(1, Ordering::Release);
        self.unlock_impl();
        Ok(())
    }

    fn hdr(&self) -> &TransportHdr {
        unsafe { &*(self.arena.base().as_ptr() as *const TransportHdr) }
    }

    fn arena_size(&self) -> u64 {
        unsafe { *self.hdr().arena_size.get() }
    }

    fn metadata_size(&self) -> u64 {
        unsafe { *self.hdr().metadata_size.get() }
    }

    /// First byte offset usable by frames.
    fn data_start(&self) -> u64 {
        align_max(METADATA_OFF + self.metadata_size())
    }

    fn committed_idx(&self) -> usize {
        (self.hdr().committed_page_idx.load(Ordering::Relaxed) & 1) as usize
    }

    fn read_page(&self, idx: usize) -> StatePage {
        unsafe { (*self.hdr().state_pages.get())[idx] }
    }

    fn write_page(&self, idx: usize, page: StatePage) {
        unsafe { (*self.hdr().state_pages.get())[idx] = page }
    }

    fn committed_page(&self) -> StatePage {
        self.read_page(self.committed_idx())
    }

    fn working_page(&self) -> StatePage {
        self.read_page(1 - self.committed_idx())
    }

    fn set_working_page(&self, page: StatePage) {
        self.write_page(1 - self.committed_idx(), page)
    }

    /// Discard any incomplete changes.
    fn reset_working(&self) {
        self.set_working_page(self.committed_page());
    }

    /// Take the transport lock.
    ///
    /// If the previous holder died mid-transaction, its scribbles on the
    /// working page are discarded here and the returned guard reports
    /// [`Acquired::OwnerDied`]; the committed log is consistent by
    /// construction, so no further repair is needed.
    pub fn lock(&self) -> Result<LockedTransport<'_>> {
        if self.closed.get() {
            return Err(Errno::EINVAL);
        }
        if self.arena.mode() == ArenaMode::ReadOnly {
            return Err(Errno::EPERM);
        }
        let acquired = self.lock_impl()?;
        Ok(LockedTransport { t: self, acquired })
    }

    fn lock_impl(&self) -> Result<Acquired> {
        let hdr = self.hdr();

        let acquired = hdr.mu.lock()?;
        if acquired.owner_died() {
            log::warn!("transport lock recovered from a dead owner");
            let _ = hdr.mu.consistent();
        }

        self.lk_tkn
            .set(hdr.next_tkn.fetch_add(1, Ordering::Relaxed).wrapping_add(1));

        // Clear any incomplete changes.
        self.reset_working();

        // An owner-died recovery wakes anyone who was waiting on the dead
        // process's operation to complete.
        self.should_notify.set(acquired.owner_died());

        Ok(acquired)
    }

    fn unlock_impl(&self) {
        let hdr = self.hdr();
        self.reset_working();
        if hdr.has_waiter.load(Ordering::Relaxed) != 0 && self.should_notify.get() {
            let tkn = self.lk_tkn.get();
            // A waiter unlocks through this path right before parking; its
            // own token in `wake_ftx` identifies that case, and the waiter
            // flag must survive it. Any other unlocker hands the word its
            // token, which both wakes parked waiters and invalidates the
            // expected value of any waiter that has not parked yet.
            let parking_self = hdr.wake_ftx.load(Ordering::Relaxed) == tkn;
            hdr.has_waiter.store(parking_self as u8, Ordering::Relaxed);
            hdr.wake_ftx.store(tkn, Ordering::Relaxed);
            let _ = ftx::broadcast(&hdr.wake_ftx);
        }
        let _ = hdr.mu.unlock();
    }

    /// Shut the transport down: all current and future [`LockedTransport::wait`]
    /// calls on this handle return `ESHUTDOWN`, and `close` returns once the
    /// last of them has unwound. The arena itself is untouched.
    pub fn close(&self) -> Result<()> {
        let mut lk = self.lock()?;

        self.closing.set(true);
        lk.schedule_notify();

        while self.await_cnt.get() > 0 {
            lk.wait_for_notify(None)?;
        }

        drop(lk);
        self.closed.set(true);
        log::trace!("transport closed");
        Ok(())
    }
}

/// Owned payload view of a committed frame.
#[derive(Debug)]
pub struct Frame<'a> {
    pub hdr: FrameHdr,
    pub data: &'a [u8],
}

/// Payload view of a freshly allocated, not yet committed frame.
#[derive(Debug)]
pub struct FrameMut<'a> {
    pub hdr: FrameHdr,
    pub data: &'a mut [u8],
}

/// A held transport lock. All log operations live here; dropping the guard
/// runs the unlock protocol (discarding uncommitted work and waking
/// scheduled notifications).
pub struct LockedTransport<'a> {
    t: &'a Transport,
    acquired: Acquired,
}

impl<'a> LockedTransport<'a> {
    /// How the lock was acquired. [`Acquired::OwnerDied`] means a previous
    /// holder died mid-transaction; its uncommitted work has already been
    /// discarded.
    pub fn acquired(&self) -> Acquired {
        self.acquired
    }

    fn base(&self) -> *mut u8 {
        self.t.arena.base().as_ptr()
    }

    fn frame_hdr_at(&self, off: u64) -> FrameHdr {
        debug_assert!(off + FRAME_HDR_SIZE <= self.t.arena_size());
        unsafe { *(self.base().add(off as usize) as *const FrameHdr) }
    }

    fn write_frame_hdr(&self, off: u64, hdr: FrameHdr) {
        debug_assert!(off + FRAME_HDR_SIZE <= self.t.arena_size());
        unsafe { *(self.base().add(off as usize) as *mut FrameHdr) = hdr }
    }

    fn schedule_notify(&mut self) {
        self.t.should_notify.set(true);
    }

    // ---- Observers ------------------------------------------------------

    pub fn empty(&self) -> bool {
        let st = self.t.working_page();
        st.seq_high == 0 || st.seq_low > st.seq_high
    }

    pub fn nonempty(&self) -> bool {
        !self.empty()
    }

    /// Sequence number of the oldest live frame.
    pub fn seq_low(&self) -> u64 {
        self.t.working_page().seq_low
    }

    /// Sequence number of the newest live frame.
    pub fn seq_high(&self) -> u64 {
        self.t.working_page().seq_high
    }

    /// Whether the cursor still points at a live frame.
    pub fn ptr_valid(&self) -> bool {
        let st = self.t.working_page();
        st.seq_low <= self.t.seq.get() && self.t.seq.get() <= st.seq_high
    }

    // ---- Metadata -------------------------------------------------------

    /// The opaque metadata region between the header and the frame ring.
    pub fn metadata(&self) -> &[u8] {
        let size = self.t.metadata_size() as usize;
        unsafe { slice::from_raw_parts(self.base().add(METADATA_OFF as usize), size) }
    }

    pub fn metadata_mut(&mut self) -> &mut [u8] {
        let size = self.t.metadata_size() as usize;
        unsafe { slice::from_raw_parts_mut(self.base().add(METADATA_OFF as usize), size) }
    }

    /// Change the metadata region's size. Only legal while the log is
    /// empty (`EPERM` otherwise); `EOVERFLOW` if the arena cannot fit the
    /// new size.
    pub fn resize_metadata(&mut self, size: u64) -> Result<()> {
        if !self.empty() {
            return Err(Errno::EPERM);
        }
        if METADATA_OFF + size + 64 >= self.t.arena.len() as u64 {
            return Err(Errno::EOVERFLOW);
        }
        unsafe { *self.t.hdr().metadata_size.get() = size }
        Ok(())
    }

    // ---- Cursor ---------------------------------------------------------

    /// Move the cursor to the oldest live frame. `EAGAIN` if empty.
    pub fn jump_head(&mut self) -> Result<()> {
        if self.empty() {
            return Err(Errno::EAGAIN);
        }
        let st = self.t.working_page();
        self.t.seq.set(st.seq_low);
        self.t.off.set(st.off_head);
        Ok(())
    }

    /// Move the cursor to the newest live frame. `EAGAIN` if empty.
    pub fn jump_tail(&mut self) -> Result<()> {
        if self.empty() {
            return Err(Errno::EAGAIN);
        }
        let st = self.t.working_page();
        self.t.seq.set(st.seq_high);
        self.t.off.set(st.off_tail);
        Ok(())
    }

    pub fn has_next(&self) -> bool {
        !self.empty() && self.t.seq.get() < self.t.working_page().seq_high
    }

    pub fn has_prev(&self) -> bool {
        !self.empty() && self.t.seq.get() > self.t.working_page().seq_low
    }

    /// Advance the cursor one frame toward the tail. A cursor that has
    /// been evicted from under the reader restarts at the head.
    pub fn step_next(&mut self) -> Result<()> {
        if !self.has_next() {
            return Err(Errno::EAGAIN);
        }

        let st = self.t.working_page();
        if self.t.seq.get() < st.seq_low {
            self.t.seq.set(st.seq_low);
            self.t.off.set(st.off_head);
            return Ok(());
        }

        let cur = self.frame_hdr_at(self.t.off.get());
        let next = self.frame_hdr_at(cur.next_off);
        self.t.off.set(cur.next_off);
        self.t.seq.set(next.seq);
        Ok(())
    }

    /// Step the cursor one frame toward the head.
    pub fn step_prev(&mut self) -> Result<()> {
        if !self.has_prev() {
            return Err(Errno::EAGAIN);
        }

        let cur = self.frame_hdr_at(self.t.off.get());
        let prev = self.frame_hdr_at(cur.prev_off);
        self.t.off.set(cur.prev_off);
        self.t.seq.set(prev.seq);
        Ok(())
    }

    /// The frame under the cursor. `ESPIPE` if the frame has been evicted;
    /// the defined recovery is [`LockedTransport::jump_head`] (or
    /// [`LockedTransport::step_next`], which rewinds on its own).
    pub fn frame(&self) -> Result<Frame<'_>> {
        let st = self.t.working_page();
        if self.t.seq.get() < st.seq_low {
            return Err(Errno::ESPIPE);
        }

        let off = self.t.off.get();
        let hdr = self.frame_hdr_at(off);
        let data = unsafe {
            slice::from_raw_parts(
                self.base().add((off + FRAME_HDR_SIZE) as usize),
                hdr.data_size as usize,
            )
        };
        Ok(Frame { hdr, data })
    }

    // ---- Allocation -----------------------------------------------------

    fn frame_end(&self, off: u64) -> u64 {
        off + FRAME_HDR_SIZE + self.frame_hdr_at(off).data_size
    }

    /// Where a frame of `frame_size` total bytes would land. `EOVERFLOW`
    /// if it cannot fit anywhere.
    fn find_slot(&self, frame_size: u64) -> Result<u64> {
        let arena_size = self.t.arena_size();
        let st = self.t.working_page();

        let mut off;
        if self.empty() {
            off = self.t.data_start();
        } else {
            off = align_max(self.frame_end(st.off_tail));
            if off + frame_size > arena_size {
                // Wrap around.
                off = self.t.data_start();
            }
        }

        if off + frame_size > arena_size {
            return Err(Errno::EOVERFLOW);
        }
        Ok(off)
    }

    fn head_interval(&self) -> Option<(u64, u64)> {
        if self.empty() {
            return None;
        }
        let st = self.t.working_page();
        let head = self.frame_hdr_at(st.off_head);
        Some((st.off_head, FRAME_HDR_SIZE + head.data_size))
    }

    fn remove_head(&mut self) {
        let mut st = self.t.working_page();

        if st.off_head == st.off_tail {
            st.off_head = 0;
            st.off_tail = 0;
            st.seq_low += 1;
        } else {
            let head = self.frame_hdr_at(st.off_head);
            let mut next = self.frame_hdr_at(head.next_off);
            next.prev_off = 0;
            self.write_frame_hdr(next.off, next);
            st.off_head = next.off;
            st.seq_low = next.seq;
        }

        self.t.set_working_page(st);
        self.commit();
    }

    /// Evict head frames until `[off, off + frame_size)` is free. Each
    /// removal commits, so a crash mid-eviction loses no consistency.
    fn evict(&mut self, off: u64, frame_size: u64) {
        while let Some((head_off, head_size)) = self.head_interval() {
            if !intersects(off, frame_size, head_off, head_size) {
                break;
            }
            self.remove_head();
        }
    }

    /// Whether allocating `size` payload bytes would evict live frames.
    pub fn alloc_evicts(&self, size: u64) -> Result<bool> {
        let frame_size = FRAME_HDR_SIZE + size;
        let off = self.find_slot(frame_size)?;

        Ok(match self.head_interval() {
            Some((head_off, head_size)) => intersects(off, frame_size, head_off, head_size),
            None => false,
        })
    }

    /// Allocate a frame for `size` payload bytes, evicting the oldest
    /// frames as needed. The frame is not visible to readers until
    /// [`LockedTransport::commit`]; an allocation that is never committed
    /// is silently reverted by the next lock acquisition.
    pub fn alloc(&mut self, size: u64) -> Result<FrameMut<'_>> {
        let frame_size = FRAME_HDR_SIZE + size;
        let off = self.find_slot(frame_size)?;

        self.evict(off, frame_size);

        // Eviction commits, which swaps the pages; reload.
        let mut st = self.t.working_page();

        st.seq_high += 1;
        let mut hdr = FrameHdr {
            seq: st.seq_high,
            off,
            prev_off: 0,
            next_off: 0,
            data_size: size,
        };
        if st.seq_low == 0 {
            st.seq_low = hdr.seq;
        }

        if st.off_tail != 0 {
            let mut tail = self.frame_hdr_at(st.off_tail);
            tail.next_off = off;
            self.write_frame_hdr(st.off_tail, tail);
            hdr.prev_off = st.off_tail;
        }
        if st.off_head == 0 {
            st.off_head = off;
        }
        st.off_tail = off;

        self.write_frame_hdr(off, hdr);
        self.t.set_working_page(st);

        let data = unsafe {
            slice::from_raw_parts_mut(
                self.base().add((off + FRAME_HDR_SIZE) as usize),
                size as usize,
            )
        };
        Ok(FrameMut { hdr, data })
    }

    /// Publish the working page.
    pub fn commit(&mut self) {
        let hdr = self.t.hdr();
        // The working page becomes the committed page *before* its
        // contents are copied back over the old one, so a crash between
        // the two steps leaves the published side untouched.
        let idx = hdr.committed_page_idx.load(Ordering::Relaxed);
        hdr.committed_page_idx.store(idx ^ 1, Ordering::Release);
        self.t.reset_working();

        self.schedule_notify();
    }

    // ---- Await ----------------------------------------------------------

    /// Park until a scheduled notification arrives, releasing and
    /// reacquiring the transport lock around the sleep.
    fn wait_for_notify(&mut self, deadline: Option<TimeMono>) -> Result<()> {
        let hdr = self.t.hdr();
        let key = self.t.lk_tkn.get();
        hdr.wake_ftx.store(key, Ordering::Relaxed);
        hdr.has_waiter.store(1, Ordering::Relaxed);

        self.t.unlock_impl();
        let res = ftx::wait(&hdr.wake_ftx, key, deadline);
        // Spurious wakes (EINTR/EAGAIN) just cost one predicate re-check.
        let _ = self.t.lock_impl()?;

        match res {
            Err(Errno::ETIMEDOUT) => Err(Errno::ETIMEDOUT),
            _ => Ok(()),
        }
    }

    /// Block until `pred` returns true (or errors), a shutdown is
    /// requested (`ESHUTDOWN`), or, in [`LockedTransport::timed_wait`],
    /// the deadline passes (`ETIMEDOUT`).
    ///
    /// The predicate always runs with the transport lock held. Every
    /// commit and every owner-died recovery notifies waiters, so a
    /// satisfiable predicate is re-evaluated within one commit cycle.
    pub fn wait<F>(&mut self, pred: F) -> Result<()>
    where
        F: FnMut(&mut LockedTransport<'a>) -> Result<bool>,
    {
        self.wait_opt(pred, None)
    }

    pub fn timed_wait<F>(&mut self, pred: F, deadline: TimeMono) -> Result<()>
    where
        F: FnMut(&mut LockedTransport<'a>) -> Result<bool>,
    {
        self.wait_opt(pred, Some(deadline))
    }

    /// Convenience: wait until the log is nonempty.
    pub fn wait_nonempty(&mut self) -> Result<()> {
        self.wait(|lk| Ok(lk.nonempty()))
    }

    /// Convenience: wait until the cursor has a next frame.
    pub fn wait_has_next(&mut self) -> Result<()> {
        self.wait(|lk| Ok(lk.has_next()))
    }

    fn wait_opt<F>(&mut self, mut pred: F, deadline: Option<TimeMono>) -> Result<()>
    where
        F: FnMut(&mut LockedTransport<'a>) -> Result<bool>,
    {
        if self.t.closing.get() {
            return Err(Errno::ESHUTDOWN);
        }

        match pred(&mut *self) {
            Err(err) => return Err(err),
            Ok(true) => return Ok(()),
            Ok(false) => {}
        }

        self.t.await_cnt.set(self.t.await_cnt.get() + 1);

        let mut res = Ok(());
        while !self.t.closing.get() {
            match pred(&mut *self) {
                Err(err) => {
                    res = Err(err);
                    break;
                }
                Ok(true) => break,
                Ok(false) => {}
            }
            if let Err(err) = self.wait_for_notify(deadline) {
                res = Err(err);
                break;
            }
        }
        if res.is_ok() && self.t.closing.get() {
            res = Err(Errno::ESHUTDOWN);
        }

        self.t.await_cnt.set(self.t.await_cnt.get() - 1);
        // Let a blocked `close` make progress.
        self.schedule_notify();

        res
    }
}

impl Drop for LockedTransport<'_> {
    fn drop(&mut self) {
        self.t.unlock_impl();
    }
}

fn fmt_limited(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    let (shown, overflow) = if bytes.len() > 32 {
        (&bytes[..29], true)
    } else {
        (bytes, false)
    };
    write!(f, "{}", String::from_utf8_lossy(shown))?;
    if overflow {
        write!(f, "...")?;
    }
    Ok(())
}

fn fmt_page(f: &mut fmt::Formatter<'_>, name: &str, page: StatePage, last: bool) -> fmt::Result {
    writeln!(f, "    \"{}\": {{", name)?;
    writeln!(f, "      \"seq_low\": {},", page.seq_low)?;
    writeln!(f, "      \"seq_high\": {},", page.seq_high)?;
    writeln!(f, "      \"off_head\": {},", page.off_head)?;
    writeln!(f, "      \"off_tail\": {}", page.off_tail)?;
    writeln!(f, "    }}{}", if last { "" } else { "," })
}

/// Renders the header, both state pages, the metadata and every reachable
/// frame as a JSON-shaped document. Uncommitted frames are flagged.
impl fmt::Debug for LockedTransport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let committed = self.t.committed_page();
        let working = self.t.working_page();

        writeln!(f)?;
        writeln!(f, "{{")?;
        writeln!(f, "  \"header\": {{")?;
        writeln!(f, "    \"arena_size\": {},", self.t.arena_size())?;
        fmt_page(f, "committed_state", committed, false)?;
        fmt_page(f, "working_state", working, true)?;
        writeln!(f, "  }},")?;
        write!(f, "  \"metadata\": \"")?;
        fmt_limited(f, self.metadata())?;
        writeln!(f, "\",")?;
        writeln!(f, "  \"data\": [")?;

        if working.off_head != 0 {
            let mut off = working.off_head;
            loop {
                let hdr = self.frame_hdr_at(off);

                writeln!(f, "    {{")?;
                if hdr.seq > committed.seq_high {
                    writeln!(f, "      \"committed\": false,")?;
                }
                writeln!(f, "      \"off\": {},", hdr.off)?;
                writeln!(f, "      \"seq\": {},", hdr.seq)?;
                writeln!(f, "      \"prev_off\": {},", hdr.prev_off)?;
                writeln!(f, "      \"next_off\": {},", hdr.next_off)?;
                writeln!(f, "      \"data_size\": {},", hdr.data_size)?;
                let data = unsafe {
                    slice::from_raw_parts(
                        self.base().add((hdr.off + FRAME_HDR_SIZE) as usize),
                        hdr.data_size as usize,
                    )
                };
                write!(f, "      \"data\": \"")?;
                fmt_limited(f, data)?;
                writeln!(f, "\"")?;

                if hdr.seq == working.seq_high {
                    writeln!(f, "    }}")?;
                    break;
                }
                writeln!(f, "    }},")?;
                off = hdr.next_off;
            }
        }
        writeln!(f, "  ]")?;
        writeln!(f, "}}")
    }
}
