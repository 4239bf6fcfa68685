//! Controller lifecycle: PCIe attach, register-level bring-up, IDENTIFY,
//! I/O queue creation, namespace enumeration, and teardown.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU16, AtomicU32, Ordering};

use spin::Mutex;

use crate::cmd::{
    Cqe, Sqe, ADMIN_ABORT, ADMIN_ASYNC_EVENT, ADMIN_CREATE_CQ, ADMIN_CREATE_SQ, ADMIN_DELETE_CQ,
    ADMIN_DELETE_SQ, ADMIN_FORMAT_NVM, CNS_CONTROLLER, CNS_NAMESPACE, QPRIO_MEDIUM,
};
use crate::cmdinfo::{Cleanup, CmdKind, CmdState, Completion};
use crate::error::{Result, Status};
use crate::hal::{DmaDirection, DmaEntry, Hal, Registers};
use crate::ident::{sanitize_ascii, IdentifyController, IdentifyNamespace};
use crate::namespace::Namespace;
use crate::queue::QueuePair;
use crate::regs::{
    cc_value, aqa_value, Caps, Csts, CC_SHN_MASK, CC_SHN_NORMAL, CSTS_SHST_MASK, REG_ACQ, REG_AQA,
    REG_ASQ, REG_CAP, REG_CC, REG_CSTS, REG_GONE, REG_VS,
};
use crate::state::{CtrlrState, StateMachine};

/// Upper bound on async event requests kept outstanding.
const MAX_EVENTS: u8 = 7;
/// Poll step while waiting on CSTS.RDY.
const READY_POLL_US: u64 = 1000;
/// Grace period between probe reads during bring-up.
const PROBE_RETRY_US: u64 = 1_000_000;

/// Driver configuration knobs, validated against CAP at attach.
#[derive(Debug, Clone)]
pub struct Config {
    /// Admin queue depth (SQ and CQ)
    pub admin_queue_depth: u16,
    /// I/O queue depth, clamped to CAP.MQES + 1
    pub io_queue_depth: u16,
    /// Most I/O queues to negotiate for
    pub max_io_queues: u16,
    /// MSI-X vectors available to this controller; 0 means INTx
    pub msix_vectors: u32,
    /// Host memory page shift
    pub page_shift: u32,
    /// Largest single transfer in bytes
    pub max_transfer: u32,
    /// Per-command timeout in seconds
    pub timeout_sec: u32,
    /// Timeout scanner tick in milliseconds
    pub tick_ms: u32,
    /// Reissue commands flushed by a reset instead of failing them up
    pub reissue_on_reset: bool,
    /// Admin command timeout in microseconds
    pub admin_timeout_us: u64,
    /// How long bring-up waits for the first successful probe read
    pub probe_timeout_us: u64,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            admin_queue_depth: 32,
            io_queue_depth: 256,
            max_io_queues: 16,
            msix_vectors: 0,
            page_shift: 12,
            max_transfer: 128 * 1024,
            timeout_sec: 10,
            tick_ms: 1000,
            reissue_on_reset: false,
            admin_timeout_us: 2_000_000,
            probe_timeout_us: 60_000_000,
        }
    }
}

/// Identity data captured from IDENTIFY CONTROLLER.
#[derive(Debug, Clone, Default)]
pub struct Identity {
    pub vendor_id: u16,
    pub serial: String,
    pub model: String,
    pub firmware: String,
    pub ieee_oui: [u8; 3],
    /// Admin vendor-specific command configuration
    pub adm_vendor_cfg: u8,
    /// NVM vendor-specific command configuration
    pub nvm_vendor_cfg: u8,
    pub log_page_attr: u8,
    pub max_aen: u8,
    pub ns_count: u32,
    pub mdts: u8,
    /// Number of power states supported (0-based on the wire)
    pub power_states: u8,
}

/// One NVMe controller instance.
pub struct Controller<H: Hal> {
    pub(crate) name: String,
    pub(crate) hal: Arc<H>,
    pub(crate) regs: Registers<H>,
    pub(crate) bar: u64,
    pub(crate) config: Config,
    pub(crate) caps: Caps,
    pub(crate) version: AtomicU32,
    pub(crate) state: StateMachine,
    pub(crate) admin: Arc<QueuePair<H>>,
    pub(crate) io_queues: Mutex<Vec<Arc<QueuePair<H>>>>,
    pub(crate) namespaces: Mutex<Vec<Arc<Namespace>>>,
    pub(crate) identity: Mutex<Identity>,
    /// Serializes task management sequences; never held inside a spinlock
    pub(crate) task_mgmt: Mutex<()>,
    /// Current timeout bucket, advanced by the sweeper tick
    pub(crate) timeout_id: AtomicU16,
    pub(crate) rr_counter: AtomicU32,
    pub(crate) cur_aen: AtomicU16,
    pub(crate) timeout_buckets: usize,
}

impl<H: Hal> Controller<H> {
    // =========================================================================
    // Attach / detach
    // =========================================================================

    /// Map and validate the controller, allocate the admin queue.
    ///
    /// No I/O is allowed until `start` and `set_operational` complete.
    pub fn attach(
        hal: Arc<H>,
        name: &str,
        bar: u64,
        bar_size: u64,
        mut config: Config,
    ) -> Result<Controller<H>> {
        let regs = Registers::new(hal.clone(), bar, bar_size)?;

        let raw_cap = regs.read64(REG_CAP);
        if raw_cap == u64::MAX {
            log::error!("{}: no controller behind the register window", name);
            return Err(Status::DeviceMissing);
        }
        let caps = Caps::from_raw(raw_cap);

        // CSS bit 0 is the NVM command set.
        if caps.css & 0x1 == 0 {
            log::error!("{}: controller does not support the NVM command set", name);
            return Err(Status::BadParam);
        }
        if !caps.supports_page_shift(config.page_shift) {
            log::error!(
                "{}: host page shift {} outside controller range [{}, {}]",
                name,
                config.page_shift,
                12 + caps.mpsmin,
                12 + caps.mpsmax
            );
            return Err(Status::BadParam);
        }

        // Clamp configured depths to what the hardware accepts.
        let max_depth = caps.max_queue_depth();
        if config.admin_queue_depth > max_depth {
            config.admin_queue_depth = max_depth;
        }
        if config.io_queue_depth > max_depth {
            config.io_queue_depth = max_depth;
        }

        let timeout_buckets =
            ((config.timeout_sec.max(1) * 1000) / config.tick_ms.max(1)).max(1) as usize;
        let page_size = 1usize << config.page_shift;

        let admin = Arc::new(QueuePair::new(
            hal.clone(),
            bar,
            0,
            config.admin_queue_depth,
            caps.dstrd,
            0,
            config.msix_vectors > 0,
            page_size,
            timeout_buckets,
        )?);

        log::info!(
            "{}: attached, MQES {}, DSTRD {}, TO {} ms",
            name,
            caps.mqes,
            caps.dstrd,
            caps.to as u64 * 500
        );

        Ok(Controller {
            name: String::from(name),
            hal,
            regs,
            bar,
            config,
            caps,
            version: AtomicU32::new(0),
            state: StateMachine::new(),
            admin,
            io_queues: Mutex::new(Vec::new()),
            namespaces: Mutex::new(Vec::new()),
            identity: Mutex::new(Identity::default()),
            task_mgmt: Mutex::new(()),
            timeout_id: AtomicU16::new(0),
            rr_counter: AtomicU32::new(0),
            cur_aen: AtomicU16::new(0),
            timeout_buckets,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn current_state(&self) -> CtrlrState {
        self.state.get()
    }

    pub fn version(&self) -> u32 {
        self.version.load(Ordering::Acquire)
    }

    pub fn identity(&self) -> Identity {
        self.identity.lock().clone()
    }

    #[inline]
    pub(crate) fn page_size(&self) -> usize {
        1usize << self.config.page_shift
    }

    #[inline]
    pub(crate) fn max_prp_entries(&self) -> usize {
        (self.config.max_transfer as usize / self.page_size()).max(1)
    }

    pub fn num_io_queues(&self) -> usize {
        self.io_queues.lock().len()
    }

    pub(crate) fn io_queue(&self, qid: usize) -> Option<Arc<QueuePair<H>>> {
        self.io_queues.lock().get(qid).cloned()
    }

    pub fn namespace(&self, nsid: u32) -> Option<Arc<Namespace>> {
        self.namespaces
            .lock()
            .iter()
            .find(|ns| ns.id == nsid)
            .cloned()
    }

    pub fn namespaces(&self) -> Vec<Arc<Namespace>> {
        self.namespaces.lock().clone()
    }

    // =========================================================================
    // Register-level bring-up
    // =========================================================================

    /// Poll CSTS until RDY reaches `want`, within the CAP.TO budget.
    pub(crate) fn wait_ready(&self, want: bool) -> Result<()> {
        let deadline = self
            .hal
            .now_us()
            .saturating_add(self.caps.timeout_us().max(READY_POLL_US));
        loop {
            let raw = self.regs.read32(REG_CSTS);
            if raw == REG_GONE {
                log::error!("{}: controller vanished while waiting for ready", self.name);
                return Err(Status::DeviceMissing);
            }
            let csts = Csts::from_bits_truncate(raw);
            if csts.contains(Csts::CFS) {
                log::error!("{}: controller fatal status during bring-up", self.name);
                return Err(Status::FatalError);
            }
            if csts.contains(Csts::RDY) == want {
                return Ok(());
            }
            if self.hal.now_us() >= deadline {
                log::error!("{}: timed out waiting for CSTS.RDY={}", self.name, want as u8);
                return Err(Status::NotReady);
            }
            self.hal.delay_us(READY_POLL_US);
        }
    }

    /// Program the admin queue registers and enable the controller.
    pub(crate) fn hw_start(&self) -> Result<()> {
        // A previously enabled controller must come down first.
        let csts = self.regs.read32(REG_CSTS);
        if csts == REG_GONE {
            return Err(Status::DeviceMissing);
        }
        if Csts::from_bits_truncate(csts).contains(Csts::RDY) {
            self.regs.write32(REG_CC, 0);
            self.wait_ready(false)?;
        }

        self.regs.write32(
            REG_AQA,
            aqa_value(self.admin.depth(), self.admin.depth()),
        );
        self.regs.write64(REG_ASQ, self.admin.sq_phys());
        self.regs.write64(REG_ACQ, self.admin.cq_phys());

        self.regs.write32(REG_CC, cc_value(self.config.page_shift));
        self.wait_ready(true)?;

        let version = self.regs.read32(REG_VS);
        if version == REG_GONE {
            log::error!("{}: controller missing after enable", self.name);
            return Err(Status::DeviceMissing);
        }
        self.version.store(version, Ordering::Release);
        log::info!(
            "{}: controller up, NVMe {}.{}",
            self.name,
            version >> 16,
            (version >> 8) & 0xFF
        );
        Ok(())
    }

    /// Clear CC.EN and wait for the controller to quiesce.
    pub(crate) fn hw_stop(&self) -> Result<()> {
        if self.state.get() == CtrlrState::Missing {
            return Ok(());
        }
        let csts = self.regs.read32(REG_CSTS);
        if csts == REG_GONE {
            return Ok(());
        }
        if Csts::from_bits_truncate(csts).contains(Csts::RDY) {
            self.regs.write32(REG_CC, 0);
        }
        match self.wait_ready(false) {
            // A controller that disappeared mid-stop is already stopped.
            Err(Status::DeviceMissing) => Ok(()),
            other => other,
        }
    }

    /// Orderly shutdown notification, used at detach.
    pub(crate) fn hw_shutdown(&self) {
        let cc = self.regs.read32(REG_CC);
        if cc == REG_GONE {
            return;
        }
        self.regs
            .write32(REG_CC, (cc & !CC_SHN_MASK) | CC_SHN_NORMAL);
        let deadline = self.hal.now_us().saturating_add(self.caps.timeout_us());
        loop {
            let csts = self.regs.read32(REG_CSTS);
            if csts == REG_GONE
                || (csts & CSTS_SHST_MASK) == Csts::SHST_COMPLETE.bits()
                || self.hal.now_us() >= deadline
            {
                break;
            }
            self.hal.delay_us(READY_POLL_US);
        }
    }

    // =========================================================================
    // Start / stop
    // =========================================================================

    /// Bring the controller to the Started state: enable the hardware,
    /// identify, negotiate and create I/O queues, and enumerate
    /// namespaces. The upper layer moves it to Operational once its path
    /// discovery is ready for I/O.
    pub fn start(&self) -> Result<()> {
        self.hw_start()?;

        // Fresh admin ring state for the freshly enabled controller.
        let _ = self.admin.reset();
        self.admin.resume()?;

        self.cur_aen.store(0, Ordering::Release);

        if let Err(e) = self.get_identify() {
            log::error!("{}: IDENTIFY CONTROLLER failed: {}", self.name, e);
            let _ = self.hw_stop();
            return Err(e);
        }

        // One queue per vector, one vector reserved for the admin queue;
        // INTx gets a single I/O queue.
        let desired = if self.config.msix_vectors > 1 {
            (self.config.msix_vectors - 1).min(self.config.max_io_queues as u32) as u16
        } else {
            1
        };
        let granted = match self.request_io_queues(desired) {
            Ok(n) => n,
            Err(e) => {
                log::error!("{}: number-of-queues negotiation failed: {}", self.name, e);
                let _ = self.hw_stop();
                return Err(e);
            }
        };
        log::info!("{}: using {} I/O queues", self.name, granted);

        if let Err(e) = self.create_io_queues(granted) {
            log::error!("{}: I/O queue creation failed: {}", self.name, e);
            let _ = self.hw_stop();
            return Err(e);
        }

        self.alloc_namespaces();

        if let Err(e) = self.wait_device_ready() {
            log::error!("{}: device never became I/O ready: {}", self.name, e);
            let _ = self.hw_stop();
            return Err(e);
        }

        self.submit_aens();

        self.state.set(CtrlrState::Started);
        Ok(())
    }

    /// The upper layer signals that I/O may flow.
    pub fn set_operational(&self) {
        self.state.set(CtrlrState::Operational);
    }

    /// Quiesce the controller: fail new submissions, stop the hardware,
    /// and complete everything still in flight with `Quiesced`.
    pub fn stop(&self) {
        self.state.set(CtrlrState::Quiesced);

        // Orderly hardware queue deletion while the admin queue is alive.
        let queues: Vec<Arc<QueuePair<H>>> = self.io_queues.lock().clone();
        if self.state.get() != CtrlrState::Missing {
            for qp in queues.iter().rev() {
                let _ = self.delete_sq(qp.id);
                let _ = self.delete_cq(qp.id);
            }
        }

        let _ = self.hw_stop();

        let _ = self.admin.suspend(0);
        if let Ok(flush) = self.admin.flush(Status::Quiesced, false) {
            for (req, status, bytes) in flush.finished {
                req.complete(status, bytes);
            }
        }
        let _ = self.admin.reset();

        for qp in queues.iter() {
            let _ = qp.suspend(0);
            if let Ok(flush) = qp.flush(Status::Quiesced, false) {
                for (req, status, bytes) in flush.finished {
                    req.complete(status, bytes);
                }
            }
            let _ = qp.reset();
        }

        self.cur_aen.store(0, Ordering::Release);
    }

    /// Final teardown: release namespaces and queue memory. The
    /// controller object must not be used afterwards.
    pub fn detach(&self) {
        self.hw_shutdown();

        {
            let mut namespaces = self.namespaces.lock();
            for ns in namespaces.iter() {
                if ns.refcount() != 0 {
                    log::warn!(
                        "{}: ns {} still referenced at detach ({} paths)",
                        self.name,
                        ns.id,
                        ns.refcount()
                    );
                }
            }
            namespaces.clear();
        }

        let queues: Vec<Arc<QueuePair<H>>> = core::mem::take(&mut *self.io_queues.lock());
        for qp in queues.iter() {
            qp.destroy();
        }
        self.admin.destroy();

        self.state.set(CtrlrState::Detached);
        log::info!("{}: detached", self.name);
    }

    // =========================================================================
    // Admin commands
    // =========================================================================

    /// Issue one admin command and sleep-wait for its completion.
    pub(crate) fn send_admin(&self, sqe: Sqe, timeout_us: u64) -> Result<Cqe> {
        let id = self.admin.acquire_slot(CmdKind::Admin)?;
        self.admin.with_slot(id, |slot| slot.sqe = sqe);
        self.admin.submit_wait(id, timeout_us)
    }

    /// Issue an admin command that targets a DMA buffer.
    ///
    /// On a delayed return (timeout), the hardware may still write the
    /// buffer, so ownership moves to the abandoned slot and the buffer is
    /// freed whenever the slot is finally reclaimed. Every other outcome
    /// hands the buffer back.
    pub(crate) fn send_admin_with_buf(
        &self,
        sqe: Sqe,
        buf: DmaEntry,
        timeout_us: u64,
    ) -> core::result::Result<(Cqe, DmaEntry), Status> {
        let id = match self.admin.acquire_slot(CmdKind::Admin) {
            Ok(id) => id,
            Err(e) => {
                self.hal.dma_free(&buf);
                return Err(e);
            }
        };
        self.admin.with_slot(id, |slot| slot.sqe = sqe);

        match self.admin.submit_wait(id, timeout_us) {
            Ok(cqe) => Ok((cqe, buf)),
            Err(e) => {
                if e.is_delayed_return() {
                    let attached = self.admin.with_slot(id, |slot| {
                        if slot.state == CmdState::Active && slot.kind == CmdKind::AbortContext {
                            slot.cleanup = Cleanup::FreeDma(buf);
                            true
                        } else {
                            false
                        }
                    });
                    if !attached {
                        // The late completion beat us to it; the slot is
                        // done with the buffer.
                        self.hal.dma_free(&buf);
                    }
                } else {
                    self.hal.dma_free(&buf);
                }
                Err(e)
            }
        }
    }

    /// Fetch and apply IDENTIFY CONTROLLER data.
    pub(crate) fn get_identify(&self) -> Result<()> {
        let buf = self
            .hal
            .dma_alloc(self.page_size(), DmaDirection::ToHost)?;
        let (_cqe, buf) = self.send_admin_with_buf(
            Sqe::identify(0, CNS_CONTROLLER, buf.ioa),
            buf,
            self.config.admin_timeout_us,
        )?;

        let bytes = unsafe { core::slice::from_raw_parts(buf.va as *const u8, buf.size) };
        let parsed = IdentifyController::parse(bytes);
        self.hal.dma_free(&buf);
        let ident = parsed.ok_or(Status::Failure)?;

        let identity = Identity {
            vendor_id: ident.vid,
            serial: sanitize_ascii(&ident.sn),
            model: sanitize_ascii(&ident.mn),
            firmware: sanitize_ascii(&ident.fr),
            ieee_oui: ident.ieee,
            adm_vendor_cfg: ident.avscc,
            nvm_vendor_cfg: ident.nvscc,
            log_page_attr: ident.lpa,
            max_aen: (ident.aerl + 1).min(MAX_EVENTS),
            ns_count: ident.nn,
            mdts: ident.mdts,
            power_states: ident.npss,
        };
        log::info!(
            "{}: model '{}' serial '{}' firmware '{}', {} namespaces",
            self.name,
            identity.model,
            identity.serial,
            identity.firmware,
            identity.ns_count
        );
        *self.identity.lock() = identity;
        Ok(())
    }

    pub(crate) fn identify_namespace(&self, nsid: u32) -> Result<IdentifyNamespace> {
        let buf = self
            .hal
            .dma_alloc(self.page_size(), DmaDirection::ToHost)?;
        let (_cqe, buf) = self.send_admin_with_buf(
            Sqe::identify(nsid, CNS_NAMESPACE, buf.ioa),
            buf,
            self.config.admin_timeout_us,
        )?;
        let bytes = unsafe { core::slice::from_raw_parts(buf.va as *const u8, buf.size) };
        let parsed = IdentifyNamespace::parse(bytes);
        self.hal.dma_free(&buf);
        parsed.ok_or(Status::Failure)
    }

    /// Negotiate the number of I/O queues, falling back to one.
    pub(crate) fn request_io_queues(&self, desired: u16) -> Result<u16> {
        let mut want = desired.max(1);
        loop {
            match self.send_admin(Sqe::set_num_queues(want), self.config.admin_timeout_us) {
                Ok(cqe) => {
                    let granted_cq = (cqe.dw0 >> 16) as u16 + 1;
                    let granted_sq = (cqe.dw0 & 0xFFFF) as u16 + 1;
                    return Ok(want.min(granted_cq).min(granted_sq));
                }
                Err(e) => {
                    if want == 1 {
                        return Err(e);
                    }
                    log::warn!(
                        "{}: controller refused {} queues ({}), retrying with 1",
                        self.name,
                        want,
                        e
                    );
                    want = 1;
                }
            }
        }
    }

    pub(crate) fn create_cq(&self, qp: &QueuePair<H>) -> Result<()> {
        let sqe = Sqe::create_io_cq(
            qp.id,
            qp.depth(),
            qp.cq_phys(),
            qp.intr_index() as u16,
            true,
        );
        self.send_admin(sqe, self.config.admin_timeout_us).map(|_| ())
    }

    pub(crate) fn create_sq(&self, qp: &QueuePair<H>) -> Result<()> {
        let sqe = Sqe::create_io_sq(qp.id, qp.depth(), qp.sq_phys(), qp.id, QPRIO_MEDIUM);
        self.send_admin(sqe, self.config.admin_timeout_us).map(|_| ())
    }

    pub(crate) fn delete_sq(&self, qid: u16) -> Result<()> {
        self.send_admin(Sqe::delete_io_sq(qid), self.config.admin_timeout_us)
            .map(|_| ())
    }

    pub(crate) fn delete_cq(&self, qid: u16) -> Result<()> {
        self.send_admin(Sqe::delete_io_cq(qid), self.config.admin_timeout_us)
            .map(|_| ())
    }

    /// Allocate queue pairs 1..=n and register them with the controller,
    /// completion queue first. Rolls back in reverse on any failure.
    pub(crate) fn create_io_queues(&self, count: u16) -> Result<()> {
        let msix = self.config.msix_vectors > 0;
        let mut created: Vec<Arc<QueuePair<H>>> = Vec::with_capacity(count as usize);

        let result = (|| {
            for qid in 1..=count {
                let intr_index = if msix { qid as u32 } else { 0 };
                let qp = Arc::new(QueuePair::new(
                    self.hal.clone(),
                    self.bar,
                    qid,
                    self.config.io_queue_depth,
                    self.caps.dstrd,
                    intr_index,
                    msix,
                    self.page_size(),
                    self.timeout_buckets,
                )?);

                if let Err(e) = self.create_cq(&qp) {
                    qp.destroy();
                    return Err(e);
                }
                if let Err(e) = self.create_sq(&qp) {
                    let _ = self.delete_cq(qid);
                    qp.destroy();
                    return Err(e);
                }

                qp.resume()?;
                created.push(qp);
            }
            Ok(())
        })();

        match result {
            Ok(()) => {
                *self.io_queues.lock() = created;
                Ok(())
            }
            Err(e) => {
                for qp in created.iter().rev() {
                    let _ = self.delete_sq(qp.id);
                    let _ = self.delete_cq(qp.id);
                    let _ = qp.suspend(0);
                    qp.destroy();
                }
                Err(e)
            }
        }
    }

    /// Re-register existing (reset) queue pairs with the hardware after a
    /// controller reset.
    pub(crate) fn restart_io_queues(&self) -> Result<()> {
        let queues: Vec<Arc<QueuePair<H>>> = self.io_queues.lock().clone();
        for qp in queues.iter() {
            self.create_cq(qp)?;
            self.create_sq(qp)?;
            qp.resume()?;
        }
        Ok(())
    }

    // =========================================================================
    // Namespaces
    // =========================================================================

    /// Enumerate namespaces 1..=nsCount. Empty namespaces are recorded
    /// offline; the upper layer's validation may offline more of them.
    pub(crate) fn alloc_namespaces(&self) {
        let count = self.identity.lock().ns_count;
        let mut list: Vec<Arc<Namespace>> = Vec::new();

        for nsid in 1..=count {
            match self.identify_namespace(nsid) {
                Ok(ident) => {
                    let ns = Namespace::from_identify(nsid, &ident);
                    if ns.block_count == 0 {
                        ns.set_online(false);
                        log::warn!("{}: ns {} is empty, keeping offline", self.name, nsid);
                    } else {
                        log::info!(
                            "{}: ns {}: {} blocks of {} bytes",
                            self.name,
                            nsid,
                            ns.block_count,
                            ns.block_size()
                        );
                    }
                    list.push(Arc::new(ns));
                }
                Err(e) => {
                    log::warn!("{}: IDENTIFY NAMESPACE {} failed: {}", self.name, nsid, e);
                    break;
                }
            }
        }

        *self.namespaces.lock() = list;
    }

    /// Probe the first usable namespace with a one-block read until the
    /// device services I/O, within the probe budget.
    pub(crate) fn wait_device_ready(&self) -> Result<()> {
        let queue = match self.io_queue(0) {
            Some(q) => q,
            None => {
                log::error!("{}: no I/O queues for the readiness probe", self.name);
                return Err(Status::Failure);
            }
        };

        let ns = {
            let namespaces = self.namespaces.lock();
            if namespaces.is_empty() {
                return Ok(());
            }
            match namespaces.iter().find(|ns| ns.validate().is_ok()) {
                Some(ns) => ns.clone(),
                // Nothing the upper layer could use anyway.
                None => return Ok(()),
            }
        };

        let deadline = self.hal.now_us().saturating_add(self.config.probe_timeout_us);
        loop {
            match self.check_io_function(&ns, &queue) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    if self.hal.now_us() >= deadline {
                        log::error!("{}: probe read never succeeded: {}", self.name, e);
                        return Err(Status::NotReady);
                    }
                    if e == Status::NsNotReady {
                        self.hal.delay_us(PROBE_RETRY_US);
                    }
                }
            }
        }
    }

    /// One probe read of LBA 0 into the command slot's own PRP page.
    fn check_io_function(&self, ns: &Namespace, queue: &QueuePair<H>) -> Result<()> {
        let id = queue.acquire_slot(CmdKind::BlockIo)?;
        queue.with_slot(id, |slot| {
            let mut sqe = Sqe::read(ns.id, 0, 1);
            sqe.prp1 = slot.prp_page.ioa;
            slot.sqe = sqe;
            slot.ns_id = ns.id;
        });
        queue.submit_wait(id, PROBE_RETRY_US).map(|_| ())
    }

    // =========================================================================
    // Asynchronous events
    // =========================================================================

    /// Keep up to maxAEN async event requests outstanding.
    pub(crate) fn submit_aens(&self) {
        let max_aen = self.identity.lock().max_aen as u16;
        while self.cur_aen.load(Ordering::Acquire) < max_aen {
            let id = match self.admin.acquire_slot(CmdKind::Event) {
                Ok(id) => id,
                Err(_) => return,
            };
            self.admin
                .with_slot(id, |slot| slot.sqe = Sqe::async_event_request());
            if self.admin.submit_async(id, Completion::Event).is_err() {
                self.admin.release_slot(id);
                return;
            }
            self.cur_aen.fetch_add(1, Ordering::AcqRel);
        }
    }

    // =========================================================================
    // Interrupt and poll entry points
    // =========================================================================

    /// ISR entry: process completions on every queue bound to `vector`.
    /// Returns the number of completions handled.
    pub fn handle_interrupt(&self, vector: u32) -> usize {
        let mut handled = 0;
        if self.admin.intr_index() == vector && !self.admin.is_suspended() {
            handled += self.admin.process_completions();
        }
        let queues: Vec<Arc<QueuePair<H>>> = self.io_queues.lock().clone();
        for qp in queues.iter() {
            if qp.intr_index() == vector && !qp.is_suspended() {
                handled += qp.process_completions();
            }
        }
        handled
    }

    /// Poll one queue (0 = admin) for completions.
    pub fn poll_queue(&self, qid: u16) -> usize {
        if qid == 0 {
            return self.admin.process_completions();
        }
        match self.io_queue(qid as usize - 1) {
            Some(qp) => qp.process_completions(),
            None => 0,
        }
    }

    // =========================================================================
    // Admin passthrough
    // =========================================================================

    /// Gate a passthrough admin command.
    ///
    /// Queue management, Abort, and async event requests belong to the
    /// core alone; passing them through would corrupt its bookkeeping. A
    /// FORMAT NVM is only accepted against a namespace that is offline
    /// (or unknown to the core); vendor-specific opcodes require the
    /// controller to advertise vendor command support.
    fn allowed_admin_cmd(&self, sqe: &Sqe) -> Result<()> {
        match sqe.opcode() {
            ADMIN_DELETE_SQ | ADMIN_CREATE_SQ | ADMIN_DELETE_CQ | ADMIN_CREATE_CQ
            | ADMIN_ABORT | ADMIN_ASYNC_EVENT => Err(Status::InvalidOpcode),
            ADMIN_FORMAT_NVM => match self.namespace(sqe.nsid) {
                Some(ns) if ns.is_online() => {
                    log::warn!(
                        "{}: refusing FORMAT NVM against online ns {}",
                        self.name,
                        ns.id
                    );
                    Err(Status::Busy)
                }
                _ => Ok(()),
            },
            op if op >= 0xC0 => {
                if self.identity.lock().adm_vendor_cfg & 0x1 != 0 {
                    Ok(())
                } else {
                    Err(Status::InvalidOpcode)
                }
            }
            _ => Ok(()),
        }
    }

    /// Admin passthrough for the external management surface. `data` is
    /// copied into a bounce buffer; `to_host` selects the transfer
    /// direction.
    pub fn admin_passthrough(
        &self,
        mut sqe: Sqe,
        data: Option<&mut [u8]>,
        to_host: bool,
        timeout_us: u64,
    ) -> Result<Cqe> {
        self.allowed_admin_cmd(&sqe)?;

        match data {
            None => self.send_admin(sqe, timeout_us),
            Some(data) => {
                let page = self.page_size();
                if data.is_empty() || data.len() > 2 * page {
                    return Err(Status::ParamListLengthError);
                }
                let dir = if to_host {
                    DmaDirection::ToHost
                } else {
                    DmaDirection::FromHost
                };
                let buf = self.hal.dma_alloc(data.len().max(page), dir)?;
                if !to_host {
                    unsafe {
                        core::ptr::copy_nonoverlapping(data.as_ptr(), buf.va, data.len());
                    }
                }
                sqe.prp1 = buf.ioa;
                if data.len() > page {
                    sqe.prp2 = buf.ioa + page as u64;
                }

                let (cqe, buf) = self.send_admin_with_buf(sqe, buf, timeout_us)?;
                if to_host {
                    unsafe {
                        core::ptr::copy_nonoverlapping(buf.va as *const u8, data.as_mut_ptr(), data.len());
                    }
                }
                self.hal.dma_free(&buf);
                Ok(cqe)
            }
        }
    }
}
