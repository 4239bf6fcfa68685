//! Per-queue command slot pool.
//!
//! Each queue owns a fixed array of command slots, threaded onto Free and
//! Active lists through prev/next indices. Slot ids are 1-based; id 0 is
//! reserved so a zero command id in a completion entry is recognizably
//! invalid. A PRP list page is allocated per slot at construction time and
//! reused for the slot's lifetime.
//!
//! All pool operations run under the owning queue's CQ lock.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::cmd::{Cqe, Sqe};
use crate::driver::IoRequest;
use crate::error::Status;
use crate::hal::DmaEntry;
use crate::sg::SgPosition;

/// Reserved invalid slot id.
pub const INVALID_ID: u16 = 0;

/// Lifecycle state of a command slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdState {
    Free,
    /// Submitted to hardware, completion pending
    Active,
    /// Completion handler has run
    Done,
    /// Free the slot as soon as its completion arrives
    FreeOnComplete,
}

/// What kind of work a slot carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdKind {
    Unused,
    /// Driver-internal admin command
    Admin,
    /// Block I/O request (possibly one child of a split)
    BlockIo,
    /// Management passthrough
    Passthrough,
    /// Asynchronous event request
    Event,
    /// Log page fetch
    Log,
    /// Abandoned by a timed-out waiter; reclaimed by recovery
    AbortContext,
}

/// Completion signal shared between a synchronous submitter and the slot.
///
/// The waiter holds one reference and the slot holds the other, so a
/// timed-out waiter can abandon the slot without leaving a dangling
/// destination for the late completion.
pub struct DoneSignal {
    done: core::sync::atomic::AtomicBool,
    result: Mutex<(Cqe, Status)>,
}

impl DoneSignal {
    pub fn new() -> Arc<DoneSignal> {
        Arc::new(DoneSignal {
            done: core::sync::atomic::AtomicBool::new(false),
            result: Mutex::new((Cqe::default(), Status::Failure)),
        })
    }

    pub fn complete(&self, cqe: Cqe, status: Status) {
        *self.result.lock() = (cqe, status);
        self.done.store(true, core::sync::atomic::Ordering::Release);
    }

    pub fn is_done(&self) -> bool {
        self.done.load(core::sync::atomic::Ordering::Acquire)
    }

    pub fn result(&self) -> (Cqe, Status) {
        *self.result.lock()
    }
}

/// How a completed slot is dispatched.
pub enum Completion {
    /// No handler installed; reaching completion this way is a driver bug.
    None,
    /// Wake a synchronous submitter (sleep-wait or poll-wait).
    Sync(Arc<DoneSignal>),
    /// Block I/O child/base accounting, then the request callback.
    BlockIo,
    /// Asynchronous event request: log the event and rearm accounting.
    Event,
    /// The base of a split completed early; only child accounting remains.
    Dummy,
}

/// Deferred resource release, run at the slot's final completion (or at
/// flush). Used by passthrough commands whose DMA buffer must outlive a
/// timed-out command.
pub enum Cleanup {
    None,
    FreeDma(DmaEntry),
}

/// One command slot.
pub struct CmdInfo {
    /// Slot id, 1-based
    pub id: u16,
    prev: u16,
    next: u16,

    pub state: CmdState,
    pub kind: CmdKind,

    /// Staged submission entry, copied into the ring at submit time
    pub sqe: Sqe,
    /// Completion entry cached by the completion path
    pub cqe: Cqe,
    /// Decoded completion status
    pub status: Status,

    pub completion: Completion,
    pub cleanup: Cleanup,

    /// The upper-layer request; present on standalone and base slots only
    pub request: Option<IoRequest>,

    /// Base slot id of a split command (0 = not split)
    pub base: u16,
    /// On a base slot: number of submitted commands sharing the base
    pub child_count: u32,

    /// Namespace the command targets (0 = none)
    pub ns_id: u32,
    /// Timeout bucket this slot was stamped into
    pub timeout_id: u16,
    /// Resume position in the base request's SG array
    pub sg_position: SgPosition,
    /// Bytes carried by this command
    pub count: u64,
    /// Base only: bytes submitted so far across all children
    pub requested: u64,
    /// Base only: total bytes the request needs
    pub required: u64,
    pub retries: u16,
    /// Submission timestamp
    pub start_us: u64,

    /// Preallocated PRP list page
    pub prp_page: DmaEntry,
}

impl CmdInfo {
    fn new(id: u16, prp_page: DmaEntry) -> CmdInfo {
        CmdInfo {
            id,
            prev: INVALID_ID,
            next: INVALID_ID,
            state: CmdState::Free,
            kind: CmdKind::Unused,
            sqe: Sqe::default(),
            cqe: Cqe::default(),
            status: Status::Success,
            completion: Completion::None,
            cleanup: Cleanup::None,
            request: None,
            base: INVALID_ID,
            child_count: 0,
            ns_id: 0,
            timeout_id: 0,
            sg_position: SgPosition::default(),
            count: 0,
            requested: 0,
            required: 0,
            retries: 0,
            start_us: 0,
            prp_page,
        }
    }

    /// Reset the per-command fields that must not leak between users.
    fn recycle(&mut self) {
        self.kind = CmdKind::Unused;
        self.completion = Completion::None;
        self.cleanup = Cleanup::None;
        self.request = None;
        self.base = INVALID_ID;
        self.child_count = 0;
        self.ns_id = 0;
        self.sg_position = SgPosition::default();
        self.count = 0;
        self.requested = 0;
        self.required = 0;
        self.retries = 0;
        self.status = Status::Success;
    }
}

/// Fixed pool of command slots plus the queue's timeout bucket counters.
pub struct CmdPool {
    /// Index 0 is a never-used sentinel so slot ids index directly.
    slots: Vec<CmdInfo>,
    free_head: u16,
    free_tail: u16,
    active_head: u16,
    active_tail: u16,
    active_count: u32,
    /// Outstanding-command counters, one per timeout bucket
    pub timeout: Vec<u32>,
}

impl CmdPool {
    /// Build a pool of `count` slots (ids `1..=count`), one PRP page each.
    pub fn new(count: u16, prp_pages: Vec<DmaEntry>, timeout_buckets: usize) -> CmdPool {
        debug_assert!(count >= 1);
        debug_assert_eq!(prp_pages.len(), count as usize);

        let mut slots = Vec::with_capacity(count as usize + 1);
        // Sentinel at index 0; its PRP page entry is a copy of the first
        // page and is never used.
        slots.push(CmdInfo::new(INVALID_ID, prp_pages[0]));
        for (i, page) in prp_pages.into_iter().enumerate() {
            slots.push(CmdInfo::new(i as u16 + 1, page));
        }

        let mut pool = CmdPool {
            slots,
            free_head: INVALID_ID,
            free_tail: INVALID_ID,
            active_head: INVALID_ID,
            active_tail: INVALID_ID,
            active_count: 0,
            timeout: alloc::vec![0; timeout_buckets.max(1)],
        };
        pool.thread_free_list();
        pool
    }

    pub fn slot_count(&self) -> u16 {
        (self.slots.len() - 1) as u16
    }

    pub fn active_count(&self) -> u32 {
        self.active_count
    }

    #[inline]
    pub fn slot(&self, id: u16) -> &CmdInfo {
        debug_assert!(id != INVALID_ID && (id as usize) < self.slots.len());
        &self.slots[id as usize]
    }

    #[inline]
    pub fn slot_mut(&mut self, id: u16) -> &mut CmdInfo {
        debug_assert!(id != INVALID_ID && (id as usize) < self.slots.len());
        &mut self.slots[id as usize]
    }

    /// Whether a completion-entry command id refers to a real slot.
    #[inline]
    pub fn is_valid_id(&self, id: u16) -> bool {
        id != INVALID_ID && (id as usize) < self.slots.len()
    }

    /// Take the head of the free list and move it to the active tail.
    ///
    /// Returns `None` when no slot is free; the caller reports `QueueFull`.
    pub fn get(&mut self) -> Option<u16> {
        let id = self.free_head;
        if id == INVALID_ID {
            return None;
        }
        self.unlink_free(id);
        self.link_active_tail(id);
        self.active_count += 1;

        let slot = self.slot_mut(id);
        slot.recycle();
        Some(id)
    }

    /// Return a slot to the free list.
    pub fn put(&mut self, id: u16) {
        let slot = self.slot_mut(id);
        slot.state = CmdState::Free;
        slot.completion = Completion::None;
        slot.cleanup = Cleanup::None;
        slot.base = INVALID_ID;
        slot.request = None;

        self.unlink_active(id);
        self.link_free_tail(id);
        self.active_count -= 1;
    }

    /// Ids currently on the active list, in list order.
    pub fn active_ids(&self) -> Vec<u16> {
        let mut ids = Vec::with_capacity(self.active_count as usize);
        let mut id = self.active_head;
        while id != INVALID_ID {
            ids.push(id);
            id = self.slots[id as usize].next;
        }
        ids
    }

    /// The PRP list pages owned by the slots, for teardown.
    pub fn prp_pages(&self) -> Vec<DmaEntry> {
        self.slots[1..].iter().map(|s| s.prp_page).collect()
    }

    /// Re-thread every slot onto the free list and clear the timeout
    /// buckets. Only legal while the owning queue is being reset.
    pub fn reset(&mut self) {
        self.thread_free_list();
        for bucket in self.timeout.iter_mut() {
            *bucket = 0;
        }
    }

    fn thread_free_list(&mut self) {
        self.free_head = INVALID_ID;
        self.free_tail = INVALID_ID;
        self.active_head = INVALID_ID;
        self.active_tail = INVALID_ID;
        self.active_count = 0;
        let count = self.slot_count();
        for id in 1..=count {
            let slot = self.slot_mut(id);
            slot.state = CmdState::Free;
            slot.recycle();
            slot.prev = if id == 1 { INVALID_ID } else { id - 1 };
            slot.next = if id == count { INVALID_ID } else { id + 1 };
        }
        if count >= 1 {
            self.free_head = 1;
            self.free_tail = count;
        }
    }

    fn unlink_free(&mut self, id: u16) {
        let (prev, next) = {
            let s = self.slot(id);
            (s.prev, s.next)
        };
        if prev != INVALID_ID {
            self.slots[prev as usize].next = next;
        } else {
            self.free_head = next;
        }
        if next != INVALID_ID {
            self.slots[next as usize].prev = prev;
        } else {
            self.free_tail = prev;
        }
    }

    fn unlink_active(&mut self, id: u16) {
        let (prev, next) = {
            let s = self.slot(id);
            (s.prev, s.next)
        };
        if prev != INVALID_ID {
            self.slots[prev as usize].next = next;
        } else {
            self.active_head = next;
        }
        if next != INVALID_ID {
            self.slots[next as usize].prev = prev;
        } else {
            self.active_tail = prev;
        }
    }

    fn link_active_tail(&mut self, id: u16) {
        let tail = self.active_tail;
        {
            let slot = self.slot_mut(id);
            slot.prev = tail;
            slot.next = INVALID_ID;
        }
        if tail != INVALID_ID {
            self.slots[tail as usize].next = id;
        } else {
            self.active_head = id;
        }
        self.active_tail = id;
    }

    fn link_free_tail(&mut self, id: u16) {
        let tail = self.free_tail;
        {
            let slot = self.slot_mut(id);
            slot.prev = tail;
            slot.next = INVALID_ID;
        }
        if tail != INVALID_ID {
            self.slots[tail as usize].next = id;
        } else {
            self.free_head = id;
        }
        self.free_tail = id;
    }
}
