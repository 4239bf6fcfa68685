//! In-memory NVMe controller model backing the integration tests.
//!
//! Implements [`Hal`] over a virtual register file, a DMA arena, and a
//! virtual clock. Admin and I/O submissions are executed synchronously at
//! doorbell time; completion entries are posted into the real CQ rings
//! with proper phase handling, so the driver's completion path runs
//! unmodified. Fault switches simulate dropped commands (timeouts) and
//! hot removal.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use nvme_core::cmd::{
    ADMIN_ABORT, ADMIN_ASYNC_EVENT, ADMIN_CREATE_CQ, ADMIN_CREATE_SQ, ADMIN_DELETE_CQ,
    ADMIN_DELETE_SQ, ADMIN_FORMAT_NVM, ADMIN_FW_ACTIVATE, ADMIN_FW_DOWNLOAD, ADMIN_GET_FEATURES,
    ADMIN_GET_LOG_PAGE, ADMIN_IDENTIFY, ADMIN_SET_FEATURES, CNS_CONTROLLER, CNS_NAMESPACE,
    FEATURE_NUM_QUEUES,
};
use nvme_core::regs::{
    REG_ACQ, REG_AQA, REG_ASQ, REG_CAP, REG_CC, REG_CSTS, REG_DB_BASE, REG_GONE, REG_INTMC,
    REG_INTMS, REG_VS,
};
use nvme_core::{DmaDirection, DmaEntry, Hal, Status};

/// CAP advertised by the model: MPSMAX=15, MPSMIN=0, CSS=NVM, TO=20
/// (10 s), DSTRD=0, MQES=0xFFFF.
pub const MOCK_CAP: u64 = 0x00F0_0020_1401_FFFF;
/// NVMe 1.4
pub const MOCK_VS: u32 = 0x0001_0400;

pub const MOCK_SERIAL: &[u8; 20] = b"MOCKSN000123        ";
pub const MOCK_MODEL: &[u8; 40] = b"Mock NVMe Controller                    ";
pub const MOCK_FIRMWARE: &[u8; 8] = b"1.0     ";

const SQE_SIZE: usize = 64;
const CQE_SIZE: usize = 16;

struct DmaAlloc {
    ioa: u64,
    buf: Box<[u8]>,
}

#[derive(Clone, Copy)]
struct MockCq {
    ioa: u64,
    depth: u16,
    tail: u16,
    phase: bool,
}

#[derive(Clone, Copy)]
struct MockSq {
    ioa: u64,
    depth: u16,
    head: u16,
    cqid: u16,
}

#[derive(Default)]
struct DeviceState {
    enabled: bool,
    aqa: u32,
    asq: u64,
    acq: u64,
    cc: u32,
    csts: u32,
    admin_sq: Option<MockSq>,
    admin_cq: Option<MockCq>,
    io_sqs: HashMap<u16, MockSq>,
    io_cqs: HashMap<u16, MockCq>,
}

/// A raw submission entry as received by the model.
#[derive(Clone, Copy)]
pub struct SeenSqe {
    pub qid: u16,
    pub raw: [u32; 16],
}

impl SeenSqe {
    pub fn opcode(&self) -> u8 {
        self.raw[0] as u8
    }
    pub fn cid(&self) -> u16 {
        (self.raw[0] >> 16) as u16
    }
    pub fn nsid(&self) -> u32 {
        self.raw[1]
    }
    pub fn prp1(&self) -> u64 {
        (self.raw[6] as u64) | ((self.raw[7] as u64) << 32)
    }
    pub fn prp2(&self) -> u64 {
        (self.raw[8] as u64) | ((self.raw[9] as u64) << 32)
    }
    pub fn cdw10(&self) -> u32 {
        self.raw[10]
    }
    pub fn cdw11(&self) -> u32 {
        self.raw[11]
    }
    pub fn cdw12(&self) -> u32 {
        self.raw[12]
    }
    pub fn start_lba(&self) -> u64 {
        (self.cdw10() as u64) | ((self.cdw11() as u64) << 32)
    }
    pub fn nlb0(&self) -> u32 {
        self.cdw12() & 0xFFFF
    }
}

pub struct MockNvme {
    state: Mutex<DeviceState>,
    allocs: Mutex<Vec<DmaAlloc>>,
    next_ioa: Mutex<u64>,
    now: AtomicU64,
    /// Every MMIO write the driver performs, in order.
    pub mmio_writes: Mutex<Vec<(u64, u32)>>,
    /// Every I/O-queue submission entry received.
    pub io_seen: Mutex<Vec<SeenSqe>>,
    /// Every admin submission entry received.
    pub admin_seen: Mutex<Vec<SeenSqe>>,
    /// Swallow admin commands (never complete them).
    pub drop_admin: AtomicBool,
    /// Swallow I/O commands.
    pub drop_io: AtomicBool,
    /// Hot-removed: reads return all-ones, writes are ignored.
    pub gone: AtomicBool,
    /// Completion pump, run from `delay_us`, so sleep-waiters see
    /// completions without a real interrupt thread.
    pump: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
    /// Namespace geometry
    pub ns_blocks: u64,
    pub ns_lbads: u8,
    pub ns_count: u32,
    /// Queue count the controller grants
    pub max_queues: u16,
}

impl MockNvme {
    pub fn new() -> Arc<MockNvme> {
        Arc::new(MockNvme {
            state: Mutex::new(DeviceState::default()),
            allocs: Mutex::new(Vec::new()),
            next_ioa: Mutex::new(0x1000_0000),
            now: AtomicU64::new(0),
            mmio_writes: Mutex::new(Vec::new()),
            io_seen: Mutex::new(Vec::new()),
            admin_seen: Mutex::new(Vec::new()),
            drop_admin: AtomicBool::new(false),
            drop_io: AtomicBool::new(false),
            gone: AtomicBool::new(false),
            pump: Mutex::new(None),
            ns_blocks: 1 << 21, // 1 GiB of 512-byte blocks
            ns_lbads: 9,
            ns_count: 1,
            max_queues: 4,
        })
    }

    pub fn with_geometry(ns_blocks: u64, ns_lbads: u8, max_queues: u16) -> Arc<MockNvme> {
        let mut mock = MockNvme::new();
        {
            let m = Arc::get_mut(&mut mock).unwrap();
            m.ns_blocks = ns_blocks;
            m.ns_lbads = ns_lbads;
            m.max_queues = max_queues;
        }
        mock
    }

    /// Register the completion pump (normally `handle_interrupt`).
    pub fn set_pump(&self, pump: Arc<dyn Fn() + Send + Sync>) {
        *self.pump.lock().unwrap() = Some(pump);
    }

    pub fn mmio_write_count(&self) -> usize {
        self.mmio_writes.lock().unwrap().len()
    }

    /// Outstanding DMA allocations; zero after a clean detach.
    pub fn alloc_count(&self) -> usize {
        self.allocs.lock().unwrap().len()
    }

    /// Copy bytes out of the DMA arena for assertions.
    pub fn host_slice(&self, ioa: u64, len: usize) -> Vec<u8> {
        let allocs = self.allocs.lock().unwrap();
        for alloc in allocs.iter() {
            let size = alloc.buf.len() as u64;
            if ioa >= alloc.ioa && ioa + len as u64 <= alloc.ioa + size {
                let off = (ioa - alloc.ioa) as usize;
                return alloc.buf[off..off + len].to_vec();
            }
        }
        panic!("host_slice: {:#x} not inside the DMA arena", ioa);
    }

    fn host_ptr(&self, ioa: u64, len: usize) -> *mut u8 {
        let allocs = self.allocs.lock().unwrap();
        for alloc in allocs.iter() {
            let size = alloc.buf.len() as u64;
            if ioa >= alloc.ioa && ioa + len as u64 <= alloc.ioa + size {
                let off = (ioa - alloc.ioa) as usize;
                return unsafe { alloc.buf.as_ptr().add(off) as *mut u8 };
            }
        }
        panic!("host_ptr: {:#x} not inside the DMA arena", ioa);
    }

    fn read_sqe(&self, sq: &MockSq, index: u16) -> [u32; 16] {
        let ptr = self.host_ptr(sq.ioa + index as u64 * SQE_SIZE as u64, SQE_SIZE) as *const [u32; 16];
        unsafe { core::ptr::read(ptr) }
    }

    fn post_cqe(&self, cq: &mut MockCq, sq_head: u16, sq_id: u16, cid: u16, dw0: u32, sf: u16) {
        let ptr = self.host_ptr(cq.ioa + cq.tail as u64 * CQE_SIZE as u64, CQE_SIZE) as *mut u32;
        let status = (sf << 1) | (cq.phase as u16);
        unsafe {
            core::ptr::write_volatile(ptr, dw0);
            core::ptr::write_volatile(ptr.add(1), 0);
            core::ptr::write_volatile(
                ptr.add(2),
                (sq_head as u32) | ((sq_id as u32) << 16),
            );
            core::ptr::write_volatile(ptr.add(3), (cid as u32) | ((status as u32) << 16));
        }
        cq.tail += 1;
        if cq.tail >= cq.depth {
            cq.tail = 0;
            cq.phase = !cq.phase;
        }
    }

    fn enable(&self, state: &mut DeviceState) {
        let asqs = (state.aqa & 0xFFF) as u16 + 1;
        let acqs = ((state.aqa >> 16) & 0xFFF) as u16 + 1;
        state.admin_sq = Some(MockSq {
            ioa: state.asq,
            depth: asqs,
            head: 0,
            cqid: 0,
        });
        state.admin_cq = Some(MockCq {
            ioa: state.acq,
            depth: acqs,
            tail: 0,
            phase: true,
        });
        state.enabled = true;
        state.csts |= 0x1; // RDY
    }

    fn disable(&self, state: &mut DeviceState) {
        state.enabled = false;
        state.csts &= !0x1;
        state.admin_sq = None;
        state.admin_cq = None;
        state.io_sqs.clear();
        state.io_cqs.clear();
    }

    fn doorbell(&self, offset: u64, value: u32) {
        let index = (offset - REG_DB_BASE) / 4;
        let qid = (index / 2) as u16;
        let is_cq_head = index % 2 == 1;
        if is_cq_head {
            // Head updates only release ring space; nothing to emulate.
            return;
        }
        if qid == 0 {
            self.run_admin_sq(value as u16);
        } else {
            self.run_io_sq(qid, value as u16);
        }
    }

    fn run_admin_sq(&self, tail: u16) {
        if self.drop_admin.load(Ordering::SeqCst) {
            return;
        }
        let mut state = self.state.lock().unwrap();
        let (mut sq, mut cq) = match (state.admin_sq, state.admin_cq) {
            (Some(sq), Some(cq)) => (sq, cq),
            _ => return,
        };
        while sq.head != tail {
            let raw = self.read_sqe(&sq, sq.head);
            sq.head = (sq.head + 1) % sq.depth;
            self.admin_seen.lock().unwrap().push(SeenSqe { qid: 0, raw });
            self.execute_admin(&mut state, raw, sq.head, &mut cq);
        }
        state.admin_sq = Some(sq);
        state.admin_cq = Some(cq);
    }

    fn execute_admin(&self, state: &mut DeviceState, raw: [u32; 16], sq_head: u16, cq: &mut MockCq) {
        let sqe = SeenSqe { qid: 0, raw };
        let opcode = sqe.opcode();
        let cid = sqe.cid();
        let mut dw0 = 0u32;
        let mut sf = 0u16; // SC | SCT, zero = success

        match opcode {
            ADMIN_IDENTIFY => {
                let cns = (sqe.cdw10() & 0xFF) as u8;
                let buf = self.host_ptr(sqe.prp1(), 4096);
                let data = self.identify_payload(cns, sqe.nsid());
                match data {
                    Some(data) => unsafe {
                        core::ptr::copy_nonoverlapping(data.as_ptr(), buf, 4096);
                    },
                    None => sf = 0x0B, // invalid namespace or format
                }
            }
            ADMIN_SET_FEATURES => {
                if (sqe.cdw10() & 0xFF) as u8 == FEATURE_NUM_QUEUES {
                    let want_sq = (sqe.cdw11() & 0xFFFF) as u16 + 1;
                    let granted = want_sq.min(self.max_queues);
                    dw0 = (((granted - 1) as u32) << 16) | (granted - 1) as u32;
                }
            }
            ADMIN_GET_FEATURES => {}
            ADMIN_CREATE_CQ => {
                let qid = (sqe.cdw10() & 0xFFFF) as u16;
                let depth = (sqe.cdw10() >> 16) as u16 + 1;
                state.io_cqs.insert(
                    qid,
                    MockCq {
                        ioa: sqe.prp1(),
                        depth,
                        tail: 0,
                        phase: true,
                    },
                );
            }
            ADMIN_CREATE_SQ => {
                let qid = (sqe.cdw10() & 0xFFFF) as u16;
                let depth = (sqe.cdw10() >> 16) as u16 + 1;
                let cqid = (sqe.cdw11() >> 16) as u16;
                if state.io_cqs.contains_key(&cqid) {
                    state.io_sqs.insert(
                        qid,
                        MockSq {
                            ioa: sqe.prp1(),
                            depth,
                            head: 0,
                            cqid,
                        },
                    );
                } else {
                    sf = (1 << 8) | 0x00; // command specific: invalid CQ
                }
            }
            ADMIN_DELETE_SQ => {
                state.io_sqs.remove(&((sqe.cdw10() & 0xFFFF) as u16));
            }
            ADMIN_DELETE_CQ => {
                state.io_cqs.remove(&((sqe.cdw10() & 0xFFFF) as u16));
            }
            ADMIN_GET_LOG_PAGE => {
                let dwords = (sqe.cdw10() >> 16) as usize + 1;
                let buf = self.host_ptr(sqe.prp1(), dwords * 4);
                unsafe { core::ptr::write_bytes(buf, 0, dwords * 4) };
            }
            ADMIN_ASYNC_EVENT => {
                // Held by the controller until an event occurs.
                return;
            }
            ADMIN_ABORT => {
                dw0 = 1; // not aborted
            }
            ADMIN_FORMAT_NVM | ADMIN_FW_DOWNLOAD | ADMIN_FW_ACTIVATE => {
                // Accepted; the model has no media or firmware slots to
                // actually rewrite.
            }
            _ => {
                sf = 0x01; // invalid opcode
            }
        }

        self.post_cqe(cq, sq_head, 0, cid, dw0, sf);
    }

    fn identify_payload(&self, cns: u8, nsid: u32) -> Option<Vec<u8>> {
        let mut data = vec![0u8; 4096];
        match cns {
            CNS_CONTROLLER => {
                data[0] = 0x36; // vid 0x1B36
                data[1] = 0x1B;
                data[4..24].copy_from_slice(MOCK_SERIAL);
                data[24..64].copy_from_slice(MOCK_MODEL);
                data[64..72].copy_from_slice(MOCK_FIRMWARE);
                data[73..76].copy_from_slice(&[0x00, 0x02, 0xEE]); // IEEE OUI
                data[259] = 3; // aerl: up to 4 AENs
                data[261] = 0x1; // lpa
                data[516..520].copy_from_slice(&self.ns_count.to_le_bytes());
                Some(data)
            }
            CNS_NAMESPACE => {
                if nsid == 0 || nsid > self.ns_count {
                    return None;
                }
                data[0..8].copy_from_slice(&self.ns_blocks.to_le_bytes());
                data[8..16].copy_from_slice(&self.ns_blocks.to_le_bytes());
                data[25] = 0; // nlbaf
                data[26] = 0; // flbas: format 0
                data[120..128].copy_from_slice(&0x0002EE0000000001u64.to_le_bytes());
                // lbaf[0]: ms = 0, lbads, rp
                data[128] = 0;
                data[129] = 0;
                data[130] = self.ns_lbads;
                Some(data)
            }
            _ => None,
        }
    }

    fn run_io_sq(&self, qid: u16, tail: u16) {
        let mut state = self.state.lock().unwrap();
        let mut sq = match state.io_sqs.get(&qid) {
            Some(sq) => *sq,
            None => return,
        };
        let drop_io = self.drop_io.load(Ordering::SeqCst);
        while sq.head != tail {
            let raw = self.read_sqe(&sq, sq.head);
            sq.head = (sq.head + 1) % sq.depth;
            self.io_seen.lock().unwrap().push(SeenSqe { qid, raw });
            if drop_io {
                continue;
            }
            let cid = (raw[0] >> 16) as u16;
            let mut cq = *state.io_cqs.get(&sq.cqid).unwrap();
            self.post_cqe(&mut cq, sq.head, qid, cid, 0, 0);
            state.io_cqs.insert(sq.cqid, cq);
        }
        state.io_sqs.insert(qid, sq);
    }

    fn run_pump(&self) {
        let pump = self.pump.lock().unwrap().clone();
        if let Some(pump) = pump {
            pump();
        }
    }
}

impl Hal for MockNvme {
    fn mmio_read32(&self, addr: u64) -> u32 {
        if self.gone.load(Ordering::SeqCst) {
            return REG_GONE;
        }
        let state = self.state.lock().unwrap();
        match addr {
            REG_CAP => MOCK_CAP as u32,
            x if x == REG_CAP + 4 => (MOCK_CAP >> 32) as u32,
            REG_VS => MOCK_VS,
            REG_CC => state.cc,
            REG_CSTS => state.csts,
            REG_AQA => state.aqa,
            REG_ASQ => state.asq as u32,
            x if x == REG_ASQ + 4 => (state.asq >> 32) as u32,
            REG_ACQ => state.acq as u32,
            x if x == REG_ACQ + 4 => (state.acq >> 32) as u32,
            REG_INTMS | REG_INTMC => 0,
            _ => 0,
        }
    }

    fn mmio_write32(&self, addr: u64, val: u32) {
        // Attempts against a removed controller are recorded (the tests
        // assert there are none) but have no effect.
        self.mmio_writes.lock().unwrap().push((addr, val));
        if self.gone.load(Ordering::SeqCst) {
            return;
        }

        if addr >= REG_DB_BASE {
            self.doorbell(addr, val);
            return;
        }

        let mut state = self.state.lock().unwrap();
        match addr {
            REG_CC => {
                let was_enabled = state.enabled;
                state.cc = val;
                let enable = val & 0x1 != 0;
                if enable && !was_enabled {
                    self.enable(&mut state);
                } else if !enable && was_enabled {
                    self.disable(&mut state);
                }
                // Shutdown notification completes immediately.
                if (val >> 14) & 0x3 != 0 {
                    state.csts = (state.csts & !(0x3 << 2)) | (2 << 2);
                }
            }
            REG_AQA => state.aqa = val,
            REG_ASQ => state.asq = (state.asq & !0xFFFF_FFFF) | val as u64,
            x if x == REG_ASQ + 4 => {
                state.asq = (state.asq & 0xFFFF_FFFF) | ((val as u64) << 32)
            }
            REG_ACQ => state.acq = (state.acq & !0xFFFF_FFFF) | val as u64,
            x if x == REG_ACQ + 4 => {
                state.acq = (state.acq & 0xFFFF_FFFF) | ((val as u64) << 32)
            }
            _ => {}
        }
    }

    fn dma_alloc(&self, size: usize, _dir: DmaDirection) -> nvme_core::Result<DmaEntry> {
        let size = size.max(8).next_multiple_of(8);
        let buf = vec![0u8; size].into_boxed_slice();
        let mut next = self.next_ioa.lock().unwrap();
        let ioa = *next;
        *next += ((size as u64) + 0xFFF) & !0xFFF;

        let entry = DmaEntry {
            va: buf.as_ptr() as *mut u8,
            ioa,
            size,
            dir: _dir,
        };
        self.allocs.lock().unwrap().push(DmaAlloc { ioa, buf });
        Ok(entry)
    }

    fn dma_free(&self, entry: &DmaEntry) {
        let mut allocs = self.allocs.lock().unwrap();
        match allocs.iter().position(|a| a.ioa == entry.ioa) {
            Some(idx) => {
                allocs.swap_remove(idx);
            }
            None => panic!("dma_free of unknown entry {:#x}", entry.ioa),
        }
    }

    fn delay_us(&self, us: u64) {
        self.now.fetch_add(us, Ordering::SeqCst);
        self.run_pump();
    }

    fn now_us(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Error the HAL reports when the arena rejects an allocation; kept here
/// so fault-injection tests can assert against it.
pub const ALLOC_FAILURE: Status = Status::Alloc;

/// Build a started controller over a fresh mock, wire the completion
/// pump, and move it to Operational.
pub fn operational_controller(
    mock: Arc<MockNvme>,
    config: nvme_core::Config,
) -> Arc<nvme_core::Controller<MockNvme>> {
    let ctrlr = Arc::new(
        nvme_core::Controller::attach(mock.clone(), "nvme0", 0, 0x3000, config)
            .expect("attach failed"),
    );
    let pump_target = ctrlr.clone();
    mock.set_pump(Arc::new(move || {
        // Service every vector; INTx setups route everything to 0.
        for vector in 0..8 {
            pump_target.handle_interrupt(vector);
        }
    }));
    ctrlr.start().expect("start failed");
    ctrlr.set_operational();
    ctrlr
}

pub fn default_config() -> nvme_core::Config {
    nvme_core::Config {
        admin_queue_depth: 32,
        io_queue_depth: 64,
        max_io_queues: 2,
        msix_vectors: 0,
        ..Default::default()
    }
}
