//! Block-facing driver surface: request submission, queue selection, and
//! the adapter registry.
//!
//! The upper layer hands the core an [`IoRequest`]; the core turns it
//! into one or more NVMe commands (splitting where the scatter-gather
//! layout forces it), rides the completion queue, and invokes the
//! request's callback exactly once. A submission error means the callback
//! will NOT run; the request comes back to the caller with the status.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use spin::Mutex;

use crate::cmd::{DsmRange, Sqe, NVM_COMPARE, NVM_READ, NVM_WRITE, NVM_WRITE_UNCORRECTABLE};
use crate::cmdinfo::{CmdKind, Completion, INVALID_ID};
use crate::controller::Controller;
use crate::error::Status;
use crate::hal::Hal;
use crate::prp;
use crate::queue::QueuePair;
use crate::sg::{self, SgElem};
use crate::state::CtrlrState;

/// Completion callback: final status plus bytes transferred.
pub type IoDoneFn = Box<dyn FnOnce(Status, u64) + Send>;

/// Operation carried by an [`IoRequest`].
pub enum IoOp {
    Read,
    Write { fua: bool },
    Compare,
    WriteUncorrectable,
    Flush,
    /// Dataset-management deallocate over the given ranges
    Deallocate(Vec<DsmRange>),
}

/// One block-shaped request from the upper layer.
pub struct IoRequest {
    /// Target namespace
    pub nsid: u32,
    pub op: IoOp,
    /// Starting logical block (data ops)
    pub lba: u64,
    /// Block count (data ops)
    pub block_count: u32,
    /// DMA-mapped scatter-gather list covering the payload
    pub sg: Vec<SgElem>,
    /// Optional submission-queue affinity hint; round-robin otherwise
    pub affinity: Option<u16>,
    /// Upper-layer correlation tag, visible to abort predicates
    pub tag: u64,
    /// Times this request has been reissued after a reset
    pub retries: u16,
    done: Option<IoDoneFn>,
}

impl IoRequest {
    pub fn new(
        nsid: u32,
        op: IoOp,
        lba: u64,
        block_count: u32,
        sg: Vec<SgElem>,
        done: IoDoneFn,
    ) -> IoRequest {
        IoRequest {
            nsid,
            op,
            lba,
            block_count,
            sg,
            affinity: None,
            tag: 0,
            retries: 0,
            done: Some(done),
        }
    }

    pub fn flush(nsid: u32, done: IoDoneFn) -> IoRequest {
        IoRequest::new(nsid, IoOp::Flush, 0, 0, Vec::new(), done)
    }

    pub fn deallocate(nsid: u32, ranges: Vec<DsmRange>, done: IoDoneFn) -> IoRequest {
        IoRequest::new(nsid, IoOp::Deallocate(ranges), 0, 0, Vec::new(), done)
    }

    pub fn with_affinity(mut self, queue: u16) -> IoRequest {
        self.affinity = Some(queue);
        self
    }

    pub fn with_tag(mut self, tag: u64) -> IoRequest {
        self.tag = tag;
        self
    }

    /// Deliver the final status. Invoked exactly once, by the completion
    /// path or by the caller when submission was refused.
    pub fn complete(mut self, status: Status, bytes: u64) {
        if let Some(done) = self.done.take() {
            done(status, bytes);
        }
    }

    fn opcode(&self) -> u8 {
        match self.op {
            IoOp::Read => NVM_READ,
            IoOp::Write { .. } => NVM_WRITE,
            IoOp::Compare => NVM_COMPARE,
            IoOp::WriteUncorrectable => NVM_WRITE_UNCORRECTABLE,
            IoOp::Flush => crate::cmd::NVM_FLUSH,
            IoOp::Deallocate(_) => crate::cmd::NVM_DATASET_MGMT,
        }
    }

    fn is_data_op(&self) -> bool {
        matches!(self.op, IoOp::Read | IoOp::Write { .. } | IoOp::Compare)
    }

    fn modifies_media(&self) -> bool {
        matches!(
            self.op,
            IoOp::Write { .. } | IoOp::WriteUncorrectable | IoOp::Deallocate(_)
        )
    }
}

type SubmitResult = core::result::Result<(), (Status, IoRequest)>;

impl<H: Hal> Controller<H> {
    /// Submit a request to a namespace. On `Ok` the request completes
    /// asynchronously through its callback; on `Err` it never reached
    /// the hardware and is returned with the refusing status.
    pub fn submit_io(&self, req: IoRequest) -> SubmitResult {
        // Sticky/transient state fast-fail, before any hardware work.
        match self.state.get() {
            CtrlrState::Operational => {}
            CtrlrState::Missing => return Err((Status::DeviceMissing, req)),
            CtrlrState::InReset | CtrlrState::Suspend => return Err((Status::InReset, req)),
            CtrlrState::Quiesced | CtrlrState::Detached => return Err((Status::Quiesced, req)),
            CtrlrState::Failed => return Err((Status::FatalError, req)),
            CtrlrState::Init | CtrlrState::Started => return Err((Status::NotReady, req)),
        }

        let ns = match self.namespace(req.nsid) {
            Some(ns) => ns,
            None => return Err((Status::InvalidNsOrFormat, req)),
        };
        if !ns.is_online() {
            return Err((Status::NsOffline, req));
        }
        if ns.is_readonly() && req.modifies_media() {
            return Err((Status::WriteProtect, req));
        }

        if req.is_data_op() {
            let shift = ns.lba_shift;
            let required = sg::data_len(&req.sg);
            if required == 0 || required != (req.block_count as u64) << shift {
                return Err((Status::InvalidField, req));
            }
            if req.lba.saturating_add(req.block_count as u64) > ns.block_count {
                return Err((Status::LbaOutOfRange, req));
            }
            if req.sg.len() > self.max_prp_entries() {
                return Err((Status::InvalidField, req));
            }
        }

        let queue = match self.pick_queue(&req) {
            Ok(queue) => queue,
            Err(e) => return Err((e, req)),
        };

        if req.is_data_op() {
            let shift = ns.lba_shift;
            self.submit_data_op(&queue, req, shift)
        } else {
            self.submit_single_op(&queue, req)
        }
    }

    /// Select the submission queue: honor an affinity hint, otherwise
    /// round-robin across the I/O queues.
    fn pick_queue(&self, req: &IoRequest) -> core::result::Result<Arc<QueuePair<H>>, Status> {
        let count = self.num_io_queues();
        if count == 0 {
            return Err(Status::Quiesced);
        }
        let qid = match req.affinity {
            Some(hint) => {
                // An out-of-range hint means the upper layer is running
                // ahead of (or behind) a teardown.
                if hint as usize >= count {
                    return Err(Status::Quiesced);
                }
                hint as usize
            }
            None => self.rr_counter.fetch_add(1, Ordering::Relaxed) as usize % count,
        };
        self.io_queue(qid).ok_or(Status::Quiesced)
    }

    /// Read/write/compare: walk the SG array, emitting one command per
    /// virtually-contiguous stretch. The pool stays locked across the
    /// whole split so no child can complete before the accounting is in
    /// place.
    fn submit_data_op(
        &self,
        queue: &QueuePair<H>,
        req: IoRequest,
        lba_shift: u8,
    ) -> SubmitResult {
        let page_shift = self.config.page_shift;
        let max_list = self.max_prp_entries();
        let required = sg::data_len(&req.sg);
        let opcode = req.opcode();
        let fua = matches!(req.op, IoOp::Write { fua: true });

        queue.with_pool(|pool| {
            let mut base_id = INVALID_ID;
            let mut requested: u64 = 0;
            let mut error: Option<Status> = None;

            loop {
                let id = match pool.get() {
                    Some(id) => id,
                    None => {
                        error = Some(Status::QueueFull);
                        break;
                    }
                };
                if base_id == INVALID_ID {
                    base_id = id;
                }

                let pos = match sg::find_position(&req.sg, requested) {
                    Some(pos) => pos,
                    None => {
                        pool.put(id);
                        if base_id == id {
                            base_id = INVALID_ID;
                        }
                        error = Some(Status::Failure);
                        break;
                    }
                };

                let covered = {
                    let slot = pool.slot_mut(id);
                    slot.kind = CmdKind::BlockIo;
                    slot.base = base_id;
                    slot.ns_id = req.nsid;
                    slot.sg_position = pos;

                    let mut sqe = Sqe::new(opcode);
                    sqe.nsid = req.nsid;
                    slot.sqe = sqe;

                    let outcome = prp::build(
                        page_shift,
                        max_list,
                        &req.sg,
                        pos,
                        required - requested,
                        &slot.prp_page,
                        &mut slot.sqe,
                    );

                    let start_lba = req.lba + (requested >> lba_shift);
                    let nlb = (outcome.covered >> lba_shift) as u32;
                    debug_assert!(nlb >= 1);
                    slot.sqe.cdw10 = start_lba as u32;
                    slot.sqe.cdw11 = (start_lba >> 32) as u32;
                    slot.sqe.cdw12 = (nlb - 1) | (if fua { 1 << 30 } else { 0 });
                    slot.count = outcome.covered;
                    outcome.covered
                };

                if let Err(e) = queue.submit_locked(pool, id, Completion::BlockIo) {
                    pool.put(id);
                    if base_id == id {
                        base_id = INVALID_ID;
                    }
                    error = Some(e);
                    break;
                }

                {
                    let base = pool.slot_mut(base_id);
                    base.child_count += 1;
                    base.requested += covered;
                }
                requested += covered;

                if requested >= required {
                    break;
                }
            }

            if let Some(e) = error {
                if base_id == INVALID_ID || requested == 0 {
                    // Nothing reached the hardware; safe to refuse.
                    return Err((e, req));
                }
                // Partially submitted: the outstanding children will
                // finish in completion context, and the short coverage
                // surfaces as an underrun there.
                log::warn!(
                    "partial submission {}/{} bytes ({}), finishing as underrun",
                    requested,
                    required,
                    e
                );
                let base = pool.slot_mut(base_id);
                base.required = required;
                base.request = Some(req);
                return Ok(());
            }

            let base = pool.slot_mut(base_id);
            base.required = required;
            base.request = Some(req);
            if base.child_count == 1 {
                // Unsplit: take the cheaper standalone completion path.
                base.base = INVALID_ID;
            }
            Ok(())
        })
    }

    /// Flush, write-uncorrectable, deallocate: one command, no SG walk.
    fn submit_single_op(&self, queue: &QueuePair<H>, req: IoRequest) -> SubmitResult {
        if let IoOp::Deallocate(ranges) = &req.op {
            let bytes = ranges.len() * core::mem::size_of::<DsmRange>();
            if ranges.is_empty() || bytes > self.page_size() {
                return Err((Status::ParamListLengthError, req));
            }
        }

        queue.with_pool(|pool| {
            let id = match pool.get() {
                Some(id) => id,
                None => return Err((Status::QueueFull, req)),
            };

            {
                let slot = pool.slot_mut(id);
                slot.kind = CmdKind::BlockIo;
                slot.ns_id = req.nsid;

                match &req.op {
                    IoOp::Flush => {
                        slot.sqe = Sqe::flush(req.nsid);
                    }
                    IoOp::WriteUncorrectable => {
                        slot.sqe =
                            Sqe::write_uncorrectable(req.nsid, req.lba, req.block_count.max(1));
                    }
                    IoOp::Deallocate(ranges) => {
                        let bytes = ranges.len() * core::mem::size_of::<DsmRange>();
                        unsafe {
                            core::ptr::copy_nonoverlapping(
                                ranges.as_ptr() as *const u8,
                                slot.prp_page.va,
                                bytes,
                            );
                        }
                        slot.sqe = Sqe::dsm_deallocate(
                            req.nsid,
                            ranges.len() as u32,
                            slot.prp_page.ioa,
                        );
                    }
                    _ => unreachable!("data ops take the split path"),
                }
            }

            if let Err(e) = queue.submit_locked(pool, id, Completion::BlockIo) {
                pool.put(id);
                return Err((e, req));
            }

            pool.slot_mut(id).request = Some(req);
            Ok(())
        })
    }
}

/// Process-wide adapter registry, created at module init and passed by
/// shared reference to everything that needs to enumerate controllers.
pub struct Registry<H: Hal> {
    adapters: Mutex<Vec<Arc<Controller<H>>>>,
}

impl<H: Hal> Registry<H> {
    pub fn new() -> Registry<H> {
        Registry {
            adapters: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self, ctrlr: Arc<Controller<H>>) {
        log::info!("registering adapter {}", ctrlr.name());
        self.adapters.lock().push(ctrlr);
    }

    /// Remove a controller by name, returning it for teardown.
    pub fn unregister(&self, name: &str) -> Option<Arc<Controller<H>>> {
        let mut adapters = self.adapters.lock();
        let idx = adapters.iter().position(|c| c.name() == name)?;
        Some(adapters.swap_remove(idx))
    }

    pub fn find(&self, name: &str) -> Option<Arc<Controller<H>>> {
        self.adapters.lock().iter().find(|c| c.name() == name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.adapters
            .lock()
            .iter()
            .map(|c| String::from(c.name()))
            .collect()
    }

    pub fn list(&self) -> Vec<Arc<Controller<H>>> {
        self.adapters.lock().clone()
    }
}

impl<H: Hal> Default for Registry<H> {
    fn default() -> Self {
        Registry::new()
    }
}
