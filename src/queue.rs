//! Queue pair machinery: one submission ring and one completion ring
//! sharing a doorbell pair, a phase tag, and a command slot pool.
//!
//! Queues begin life suspended and are resumed once their hardware side
//! exists. All completion-side state (CQ ring indices, the slot pool, the
//! timeout buckets) lives under the CQ lock; the SQ ring indices and
//! free-entry count live under the SQ lock. When both are needed the CQ
//! lock is taken first.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU16, Ordering};

use spin::Mutex;

use crate::cmd::{Cqe, Sqe, NVM_READ, NVM_WRITE};
use crate::cmdinfo::{
    Cleanup, CmdKind, CmdPool, CmdState, Completion, DoneSignal, CmdInfo, INVALID_ID,
};
use crate::driver::IoRequest;
use crate::error::{Result, Status};
use crate::hal::{DmaDirection, DmaEntry, Hal};
use crate::regs::{cq_head_doorbell, sq_tail_doorbell, CQE_SIZE, SQE_SIZE};

/// Busy-wait step for `submit_poll`.
const POLL_INTERVAL_US: u64 = 10;
/// Sleep step for `submit_wait`.
const WAIT_INTERVAL_US: u64 = 100;
/// How many times a flushed request may be reissued before failing up.
pub const MAX_RETRIES: u16 = 2;

/// Bucket sentinel for commands exempt from timeout tracking: async
/// event requests stay outstanding until the controller has something
/// to report.
const NO_BUCKET: u16 = u16::MAX;

/// A finished upper-layer request: the request, its final status, and the
/// bytes transferred.
pub type FinishedIo = (IoRequest, Status, u64);

/// Outcome of flushing a suspended queue.
pub struct FlushResult {
    /// Requests to complete upward
    pub finished: Vec<FinishedIo>,
    /// Requests to resubmit once the queues are restarted
    pub reissue: Vec<IoRequest>,
}

struct CompletionCtx {
    finished: Vec<FinishedIo>,
    reissue: Vec<IoRequest>,
    allow_reissue: bool,
}

impl CompletionCtx {
    fn new(allow_reissue: bool) -> CompletionCtx {
        CompletionCtx {
            finished: Vec::new(),
            reissue: Vec::new(),
            allow_reissue,
        }
    }
}

struct SubQueue {
    ring: DmaEntry,
    tail: u16,
    /// Head position cached from completion entries
    head: u16,
    /// Free submission entries; at most depth - 1 commands are in flight
    entries: u16,
}

struct CompQueue {
    ring: DmaEntry,
    head: u16,
    phase: bool,
    pool: CmdPool,
}

/// One admin or I/O queue pair.
pub struct QueuePair<H: Hal> {
    pub id: u16,
    depth: u16,
    intr_index: u32,
    msix: bool,
    sq_db: u64,
    cq_db: u64,
    suspended: AtomicBool,
    /// Set when the controller is hot-removed; suppresses doorbell writes
    /// so teardown never touches the vanished register window.
    dead: AtomicBool,
    current_bucket: AtomicU16,
    sq: Mutex<SubQueue>,
    cq: Mutex<CompQueue>,
    hal: Arc<H>,
}

impl<H: Hal> QueuePair<H> {
    /// Allocate rings and the slot pool for queue `id`. The queue starts
    /// suspended; `resume()` it once the hardware queue pair exists.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        hal: Arc<H>,
        bar: u64,
        id: u16,
        depth: u16,
        dstrd: u8,
        intr_index: u32,
        msix: bool,
        page_size: usize,
        timeout_buckets: usize,
    ) -> Result<QueuePair<H>> {
        debug_assert!(depth >= 2);

        let sq_ring = hal.dma_alloc(depth as usize * SQE_SIZE, DmaDirection::FromHost)?;
        let cq_ring = match hal.dma_alloc(depth as usize * CQE_SIZE, DmaDirection::ToHost) {
            Ok(ring) => ring,
            Err(e) => {
                hal.dma_free(&sq_ring);
                return Err(e);
            }
        };
        sq_ring.clear();
        cq_ring.clear();

        // One PRP list page per slot, allocated once and reused.
        let slot_count = depth - 1;
        let mut prp_pages: Vec<DmaEntry> = Vec::with_capacity(slot_count as usize);
        for _ in 0..slot_count {
            match hal.dma_alloc(page_size, DmaDirection::FromHost) {
                Ok(page) => prp_pages.push(page),
                Err(e) => {
                    for page in &prp_pages {
                        hal.dma_free(page);
                    }
                    hal.dma_free(&sq_ring);
                    hal.dma_free(&cq_ring);
                    return Err(e);
                }
            }
        }

        let pool = CmdPool::new(slot_count, prp_pages, timeout_buckets);

        Ok(QueuePair {
            id,
            depth,
            intr_index,
            msix,
            sq_db: bar + sq_tail_doorbell(id, dstrd),
            cq_db: bar + cq_head_doorbell(id, dstrd),
            suspended: AtomicBool::new(true),
            dead: AtomicBool::new(false),
            current_bucket: AtomicU16::new(0),
            sq: Mutex::new(SubQueue {
                ring: sq_ring,
                tail: 0,
                head: 0,
                entries: depth - 1,
            }),
            cq: Mutex::new(CompQueue {
                ring: cq_ring,
                head: 0,
                phase: true,
                pool,
            }),
            hal,
        })
    }

    /// Release the rings and PRP pages. The queue must not be used after.
    pub fn destroy(&self) {
        let (cq_ring, pages) = {
            let cq = self.cq.lock();
            (cq.ring, cq.pool.prp_pages())
        };
        let sq_ring = self.sq.lock().ring;
        for page in &pages {
            self.hal.dma_free(page);
        }
        self.hal.dma_free(&sq_ring);
        self.hal.dma_free(&cq_ring);
    }

    #[inline]
    pub fn depth(&self) -> u16 {
        self.depth
    }

    #[inline]
    pub fn intr_index(&self) -> u32 {
        self.intr_index
    }

    #[inline]
    pub fn sq_phys(&self) -> u64 {
        self.sq.lock().ring.ioa
    }

    #[inline]
    pub fn cq_phys(&self) -> u64 {
        self.cq.lock().ring.ioa
    }

    #[inline]
    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    /// Number of commands currently outstanding.
    pub fn active_count(&self) -> u32 {
        self.cq.lock().pool.active_count()
    }

    /// Free submission entries, for diagnostics.
    pub fn free_entries(&self) -> u16 {
        self.sq.lock().entries
    }

    // =========================================================================
    // Suspend / resume / reset
    // =========================================================================

    /// Stop admitting commands and mask the queue's interrupt vector.
    ///
    /// Fails with `BadParam` when the queue is already suspended.
    pub fn suspend(&self, new_bucket: u16) -> Result<()> {
        if self
            .suspended
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::warn!("queue {}: suspend on a suspended queue", self.id);
            return Err(Status::BadParam);
        }
        if self.msix {
            self.hal.disable_vector(self.intr_index);
        }
        self.current_bucket.store(new_bucket, Ordering::Release);
        Ok(())
    }

    /// Re-admit commands and unmask the interrupt vector.
    ///
    /// Fails with `BadParam` when the queue is not suspended.
    pub fn resume(&self) -> Result<()> {
        if self
            .suspended
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::warn!("queue {}: resume on an active queue", self.id);
            return Err(Status::BadParam);
        }
        if self.msix {
            self.hal.enable_vector(self.intr_index);
        }
        Ok(())
    }

    /// Zero both rings and re-thread the slot pool. Only legal while
    /// suspended.
    pub fn reset(&self) -> Result<()> {
        if !self.is_suspended() {
            log::error!("queue {}: reset on an active queue", self.id);
            return Err(Status::Busy);
        }

        let mut cq = self.cq.lock();
        debug_assert_eq!(cq.pool.active_count(), 0);
        cq.ring.clear();
        cq.head = 0;
        cq.phase = true;
        cq.pool.reset();
        drop(cq);

        let mut sq = self.sq.lock();
        sq.ring.clear();
        sq.tail = 0;
        sq.head = 0;
        sq.entries = self.depth - 1;
        Ok(())
    }

    /// Drain pending completions, then synthesize a completion with
    /// `status` on every command still outstanding. Only legal while
    /// suspended; afterwards nothing is active.
    ///
    /// With `allow_reissue`, block I/O requests that still have retry
    /// budget are handed back for resubmission instead of being failed.
    pub fn flush(&self, status: Status, allow_reissue: bool) -> Result<FlushResult> {
        if !self.is_suspended() {
            log::error!("queue {}: flush on an active queue", self.id);
            return Err(Status::Busy);
        }

        // Completions the hardware did post complete with their real
        // status and are never reissued; only the synthesized ones are
        // eligible.
        let mut drained = CompletionCtx::new(false);
        let mut ctx = CompletionCtx::new(allow_reissue);
        let mut last_sq_head = None;
        {
            let mut cq = self.cq.lock();
            let inner = &mut *cq;

            // Preserve whatever the hardware did manage to complete.
            // Two passes, so entries of both phases are seen.
            self.drain_locked(inner, &mut drained, &mut last_sq_head);
            self.drain_locked(inner, &mut drained, &mut last_sq_head);

            // The remainder reached the hardware but will never return.
            for id in inner.pool.active_ids() {
                let slot = inner.pool.slot_mut(id);
                if slot.state != CmdState::Active {
                    // A base whose own completion already ran; its
                    // children settle it through the child count.
                    continue;
                }
                slot.status = status;
                slot.cqe = Cqe::default();
                self.dispatch_completion(&mut inner.pool, id, &mut ctx);
            }

            debug_assert_eq!(inner.pool.active_count(), 0);
            for bucket in inner.pool.timeout.iter_mut() {
                *bucket = 0;
            }
        }
        self.sync_sq_head(last_sq_head);

        let mut finished = drained.finished;
        finished.extend(ctx.finished);
        Ok(FlushResult {
            finished,
            reissue: ctx.reissue,
        })
    }

    // =========================================================================
    // Slot management
    // =========================================================================

    /// Take a free command slot. Fails with `QueueFull` when the pool is
    /// exhausted or the queue is suspended.
    pub fn acquire_slot(&self, kind: CmdKind) -> Result<u16> {
        if self.is_suspended() {
            return Err(Status::QueueFull);
        }
        let mut cq = self.cq.lock();
        let id = cq.pool.get().ok_or(Status::QueueFull)?;
        cq.pool.slot_mut(id).kind = kind;
        Ok(id)
    }

    /// Mutate a held slot (stage its SQE, attach cleanup, ...).
    pub fn with_slot<R>(&self, id: u16, f: impl FnOnce(&mut CmdInfo) -> R) -> R {
        let mut cq = self.cq.lock();
        f(cq.pool.slot_mut(id))
    }

    /// Return a slot that never reached the hardware, running its cleanup.
    pub fn release_slot(&self, id: u16) {
        let mut cq = self.cq.lock();
        let cleanup = core::mem::replace(&mut cq.pool.slot_mut(id).cleanup, Cleanup::None);
        self.run_cleanup(cleanup);
        cq.pool.put(id);
    }

    /// Run an operation against the slot pool with the CQ lock held.
    /// Used by the recovery path's abort scan.
    pub(crate) fn with_pool<R>(&self, f: impl FnOnce(&mut CmdPool) -> R) -> R {
        let mut cq = self.cq.lock();
        f(&mut cq.pool)
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Submit a staged slot. The caller holds no locks. On failure the
    /// slot is NOT released; the caller decides between `release_slot`
    /// and retry.
    pub fn submit_async(&self, id: u16, completion: Completion) -> Result<()> {
        let mut cq = self.cq.lock();
        let inner = &mut *cq;
        self.submit_locked(&mut inner.pool, id, completion)
    }

    /// Submit while the caller already holds the pool (split-command
    /// loops must not let completions interleave between children).
    pub(crate) fn submit_locked(
        &self,
        pool: &mut CmdPool,
        id: u16,
        completion: Completion,
    ) -> Result<()> {
        let bucket = self.current_bucket.load(Ordering::Acquire) as usize % pool.timeout.len();
        let tracked = pool.slot(id).kind != CmdKind::Event;
        let sqe = {
            let slot = pool.slot_mut(id);
            slot.completion = completion;
            slot.state = CmdState::Active;
            slot.sqe.set_cid(id);
            slot.timeout_id = if tracked { bucket as u16 } else { NO_BUCKET };
            slot.start_us = self.hal.now_us();
            slot.sqe
        };
        if tracked {
            pool.timeout[bucket] += 1;
        }

        let mut sq = self.sq.lock();
        if sq.entries == 0 {
            log::warn!("queue {}: submission ring full", self.id);
            self.unwind_submit(pool, id, bucket);
            return Err(Status::QueueFull);
        }
        if self.is_suspended() {
            log::warn!("queue {}: submit while suspended", self.id);
            self.unwind_submit(pool, id, bucket);
            return Err(Status::InReset);
        }

        unsafe {
            core::ptr::write_volatile(sq.ring.as_ptr::<Sqe>().add(sq.tail as usize), sqe);
        }
        sq.tail = (sq.tail + 1) % self.depth;
        // The HAL write fence orders the ring store before the doorbell.
        if !self.dead.load(Ordering::Acquire) {
            self.hal.mmio_write32(self.sq_db, sq.tail as u32);
        }
        sq.entries -= 1;
        Ok(())
    }

    fn unwind_submit(&self, pool: &mut CmdPool, id: u16, bucket: usize) {
        if pool.slot(id).timeout_id != NO_BUCKET && pool.timeout[bucket] > 0 {
            pool.timeout[bucket] -= 1;
        }
        let slot = pool.slot_mut(id);
        slot.state = CmdState::Free;
        slot.completion = Completion::None;
    }

    /// Submit and sleep-wait for the completion.
    ///
    /// On `Timeout` the slot is flagged `AbortContext` and belongs to the
    /// error-recovery path from then on; the caller must not release it.
    pub fn submit_wait(&self, id: u16, timeout_us: u64) -> Result<Cqe> {
        self.submit_sync(id, timeout_us, WAIT_INTERVAL_US)
    }

    /// Busy-wait flavor of [`QueuePair::submit_wait`] for contexts that
    /// cannot block.
    pub fn submit_poll(&self, id: u16, timeout_us: u64) -> Result<Cqe> {
        self.submit_sync(id, timeout_us, POLL_INTERVAL_US)
    }

    fn submit_sync(&self, id: u16, timeout_us: u64, step_us: u64) -> Result<Cqe> {
        let signal = DoneSignal::new();

        if let Err(e) = self.submit_async(id, Completion::Sync(signal.clone())) {
            // Never reached the hardware; safe to reclaim here.
            self.release_slot(id);
            return Err(e);
        }

        let deadline = self.hal.now_us().saturating_add(timeout_us);
        while !signal.is_done() && self.hal.now_us() < deadline {
            self.hal.delay_us(step_us);
        }

        // The CQ lock makes the done-check and the abandonment atomic
        // against the completion path.
        let mut cq = self.cq.lock();
        if signal.is_done() {
            let (cqe, status) = signal.result();
            if status.is_success() {
                Ok(cqe)
            } else {
                Err(status)
            }
        } else {
            let slot = cq.pool.slot_mut(id);
            slot.kind = CmdKind::AbortContext;
            log::warn!(
                "queue {}: command [{}] timed out, abandoned to recovery",
                self.id,
                id
            );
            Err(Status::Timeout)
        }
    }

    // =========================================================================
    // Completion
    // =========================================================================

    /// Process every completion entry the controller has posted. Called
    /// from the interrupt handler and from pollers. Returns the number of
    /// entries consumed.
    pub fn process_completions(&self) -> usize {
        let mut ctx = CompletionCtx::new(false);
        let mut last_sq_head = None;
        let consumed = {
            let mut cq = self.cq.lock();
            let inner = &mut *cq;
            self.drain_locked(inner, &mut ctx, &mut last_sq_head)
        };
        self.sync_sq_head(last_sq_head);

        for (req, status, bytes) in ctx.finished {
            req.complete(status, bytes);
        }
        consumed
    }

    /// Core CQ ring walk. CQ lock held by the caller.
    fn drain_locked(
        &self,
        inner: &mut CompQueue,
        ctx: &mut CompletionCtx,
        last_sq_head: &mut Option<u16>,
    ) -> usize {
        let mut head = inner.head;
        let mut phase = inner.phase;
        let mut consumed = 0usize;

        loop {
            let cqe: Cqe =
                unsafe { core::ptr::read_volatile(inner.ring.as_ptr::<Cqe>().add(head as usize)) };
            // The read fence in the HAL orders this load against the
            // phase-bit test; entries with the stale phase are not ours.
            if cqe.phase() != phase {
                break;
            }

            consumed += 1;

            if !inner.pool.is_valid_id(cqe.cmd_id) {
                log::error!("queue {}: invalid command id {} in CQE", self.id, cqe.cmd_id);
                debug_assert!(false);
            } else if inner.pool.slot(cqe.cmd_id).state != CmdState::Active {
                log::error!(
                    "queue {}: completion for inactive command [{}]",
                    self.id,
                    cqe.cmd_id
                );
                debug_assert!(false);
            } else {
                let status = Status::from_cqe(&cqe);
                {
                    let slot = inner.pool.slot_mut(cqe.cmd_id);
                    slot.status = status;
                    slot.cqe = cqe;
                }
                *last_sq_head = Some(cqe.sq_head);
                if !status.is_success() {
                    log::warn!(
                        "queue {}: command [{}] failed: {}",
                        self.id,
                        cqe.cmd_id,
                        status
                    );
                }
                self.dispatch_completion(&mut inner.pool, cqe.cmd_id, ctx);
            }

            head += 1;
            if head >= self.depth {
                head = 0;
                phase = !phase;
            }
        }

        if consumed > 0 {
            inner.head = head;
            inner.phase = phase;
            if !self.dead.load(Ordering::Acquire) {
                self.hal.mmio_write32(self.cq_db, head as u32);
            }
        }
        consumed
    }

    /// Update the cached SQ head and recompute free entries.
    fn sync_sq_head(&self, last_sq_head: Option<u16>) {
        let mut sq = self.sq.lock();
        let head = last_sq_head.unwrap_or(sq.head);
        sq.head = head;
        sq.entries = if head <= sq.tail {
            self.depth - (sq.tail - head + 1)
        } else {
            head - sq.tail - 1
        };
    }

    /// Dispatch one completed slot. CQ lock held; `slot.status` and
    /// `slot.cqe` are already filled in.
    fn dispatch_completion(&self, pool: &mut CmdPool, id: u16, ctx: &mut CompletionCtx) {
        let bucket = pool.slot(id).timeout_id;
        if bucket != NO_BUCKET && pool.timeout[bucket as usize] > 0 {
            pool.timeout[bucket as usize] -= 1;
        }

        let completion = core::mem::replace(&mut pool.slot_mut(id).completion, Completion::None);
        match completion {
            Completion::None => {
                log::error!("queue {}: command [{}] has no completion handler", self.id, id);
                debug_assert!(false);
                let cleanup = core::mem::replace(&mut pool.slot_mut(id).cleanup, Cleanup::None);
                self.run_cleanup(cleanup);
                pool.put(id);
            }
            Completion::Sync(signal) => {
                let slot = pool.slot_mut(id);
                if slot.kind == CmdKind::AbortContext {
                    // The waiter gave up on this command long ago.
                    log::info!("queue {}: reclaiming abandoned command [{}]", self.id, id);
                } else {
                    slot.state = CmdState::Done;
                    signal.complete(slot.cqe, slot.status);
                }
                let cleanup = core::mem::replace(&mut pool.slot_mut(id).cleanup, Cleanup::None);
                self.run_cleanup(cleanup);
                pool.put(id);
            }
            Completion::BlockIo => {
                self.complete_block_io(pool, id, ctx);
            }
            Completion::Event => {
                let slot = pool.slot_mut(id);
                if slot.kind != CmdKind::AbortContext {
                    log::info!(
                        "queue {}: async event reported: {:#x} ({})",
                        self.id,
                        slot.cqe.dw0,
                        slot.status
                    );
                }
                pool.put(id);
            }
            Completion::Dummy => {
                // The base already completed; only the child accounting
                // keeps it on the active list. Nothing to do here.
                pool.slot_mut(id).completion = Completion::Dummy;
            }
        }
    }

    /// Child/base accounting for block I/O completions.
    fn complete_block_io(&self, pool: &mut CmdPool, id: u16, ctx: &mut CompletionCtx) {
        let (status, base_id) = {
            let slot = pool.slot_mut(id);
            slot.state = CmdState::Done;
            (slot.status, slot.base)
        };

        if base_id != INVALID_ID {
            // Part of a split command: the first error wins.
            if !status.is_success() && pool.slot(base_id).status.is_success() {
                pool.slot_mut(base_id).status = status;
            }

            if base_id != id {
                pool.put(id);
            } else {
                // The base completed before its siblings; protect it from
                // a second completion during a reset flush.
                pool.slot_mut(id).completion = Completion::Dummy;
            }

            let base = pool.slot_mut(base_id);
            let outstanding = base.child_count;
            base.child_count = outstanding.saturating_sub(1);
            if outstanding > 1 {
                return;
            }
            self.finish_request(pool, base_id, ctx);
        } else {
            self.finish_request(pool, id, ctx);
        }
    }

    /// Complete the upper-layer request attached to a base (or
    /// standalone) slot and free the slot.
    fn finish_request(&self, pool: &mut CmdPool, id: u16, ctx: &mut CompletionCtx) {
        let (mut status, request, xferred) = {
            let slot = pool.slot_mut(id);
            let mut status = slot.status;
            // Underrun/overrun only applies to data movers; the byte
            // counts of everything else are synthetic.
            let opcode = slot.sqe.opcode();
            if status.is_success()
                && (opcode == NVM_READ || opcode == NVM_WRITE)
                && slot.requested != slot.required
            {
                status = if slot.requested < slot.required {
                    Status::Underrun
                } else {
                    Status::Overrun
                };
                log::warn!(
                    "queue {}: command [{}] {} {}/{} bytes",
                    self.id,
                    id,
                    status,
                    slot.requested,
                    slot.required
                );
            }
            // Progress is only meaningful when data actually moved.
            let xferred = match status {
                Status::Success | Status::Underrun | Status::Overrun => slot.requested,
                _ => 0,
            };
            (status, slot.request.take(), xferred)
        };

        let cleanup = core::mem::replace(&mut pool.slot_mut(id).cleanup, Cleanup::None);
        self.run_cleanup(cleanup);
        pool.put(id);

        if let Some(mut req) = request {
            if ctx.allow_reissue && req.retries < MAX_RETRIES {
                req.retries += 1;
                ctx.reissue.push(req);
            } else {
                ctx.finished.push((req, status, xferred));
            }
        }
    }

    fn run_cleanup(&self, cleanup: Cleanup) {
        if let Cleanup::FreeDma(entry) = cleanup {
            self.hal.dma_free(&entry);
        }
    }

    /// Task-management scan: drain pending completions, then classify
    /// every still-outstanding block I/O command against `matches`.
    /// Returns (matched, collateral, completions to deliver).
    pub(crate) fn scan_active<F>(&self, matches: F) -> (usize, usize, Vec<FinishedIo>)
    where
        F: Fn(&IoRequest) -> bool,
    {
        let mut ctx = CompletionCtx::new(false);
        let mut last_sq_head = None;
        let (found, collateral) = {
            let mut cq = self.cq.lock();
            let inner = &mut *cq;
            self.drain_locked(inner, &mut ctx, &mut last_sq_head);
            self.drain_locked(inner, &mut ctx, &mut last_sq_head);

            let mut found = 0usize;
            let mut collateral = 0usize;
            for id in inner.pool.active_ids() {
                let slot = inner.pool.slot(id);
                if slot.state != CmdState::Active {
                    continue;
                }
                // A child command carries no request; look through to
                // the base.
                let request = if slot.request.is_some() {
                    slot.request.as_ref()
                } else if slot.base != INVALID_ID {
                    inner.pool.slot(slot.base).request.as_ref()
                } else {
                    None
                };
                match request {
                    Some(req) if matches(req) => found += 1,
                    Some(_) => collateral += 1,
                    None => {}
                }
            }
            (found, collateral)
        };
        self.sync_sq_head(last_sq_head);
        (found, collateral, ctx.finished)
    }

    /// Stop touching hardware: the controller is gone from the bus.
    pub fn mark_dead(&self) {
        self.dead.store(true, Ordering::Release);
    }

    /// Timeout bookkeeping: point new submissions at `bucket`.
    pub fn set_timeout_bucket(&self, bucket: u16) {
        self.current_bucket.store(bucket, Ordering::Release);
    }

    /// Outstanding commands stamped into `bucket`.
    pub fn bucket_pending(&self, bucket: u16) -> u32 {
        let cq = self.cq.lock();
        cq.pool.timeout.get(bucket as usize).copied().unwrap_or(0)
    }
}
