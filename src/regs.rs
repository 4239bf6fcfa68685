//! NVMe controller register definitions.
//!
//! Offsets and field layouts per NVM Express 1.0a.

use bitflags::bitflags;

// =============================================================================
// Controller Registers (offset from BAR0)
// =============================================================================

/// Controller Capabilities (64-bit)
pub const REG_CAP: u64 = 0x00;
/// Version
pub const REG_VS: u64 = 0x08;
/// Interrupt Mask Set
pub const REG_INTMS: u64 = 0x0C;
/// Interrupt Mask Clear
pub const REG_INTMC: u64 = 0x10;
/// Controller Configuration
pub const REG_CC: u64 = 0x14;
/// Controller Status
pub const REG_CSTS: u64 = 0x1C;
/// Admin Queue Attributes
pub const REG_AQA: u64 = 0x24;
/// Admin Submission Queue Base Address (64-bit)
pub const REG_ASQ: u64 = 0x28;
/// Admin Completion Queue Base Address (64-bit)
pub const REG_ACQ: u64 = 0x30;

/// Base of the doorbell region
pub const REG_DB_BASE: u64 = 0x1000;

/// Minimum usable register window (through the doorbell region base)
pub const MIN_BAR_SIZE: u64 = 0x1000;

/// Sentinel read value indicating the controller is gone from the bus.
pub const REG_GONE: u32 = 0xFFFF_FFFF;

/// Submission queue tail doorbell offset for queue `qid`.
#[inline]
pub fn sq_tail_doorbell(qid: u16, dstrd: u8) -> u64 {
    REG_DB_BASE + (2 * qid as u64) * (4u64 << dstrd)
}

/// Completion queue head doorbell offset for queue `qid`.
#[inline]
pub fn cq_head_doorbell(qid: u16, dstrd: u8) -> u64 {
    REG_DB_BASE + (2 * qid as u64 + 1) * (4u64 << dstrd)
}

// =============================================================================
// CC - Controller Configuration (32-bit)
// =============================================================================

/// Enable
pub const CC_EN: u32 = 1 << 0;
/// I/O Command Set Selected
pub const CC_CSS_SHIFT: u32 = 4;
pub const CC_CSS_NVM: u32 = 0;
/// Memory Page Size (2^(12+MPS))
pub const CC_MPS_SHIFT: u32 = 7;
/// Arbitration Mechanism Selected
pub const CC_AMS_SHIFT: u32 = 11;
pub const CC_AMS_RR: u32 = 0;
/// Shutdown Notification
pub const CC_SHN_SHIFT: u32 = 14;
pub const CC_SHN_MASK: u32 = 0x3 << CC_SHN_SHIFT;
pub const CC_SHN_NONE: u32 = 0 << CC_SHN_SHIFT;
pub const CC_SHN_NORMAL: u32 = 1 << CC_SHN_SHIFT;
/// I/O Submission Queue Entry Size (2^IOSQES bytes)
pub const CC_IOSQES_SHIFT: u32 = 16;
/// I/O Completion Queue Entry Size (2^IOCQES bytes)
pub const CC_IOCQES_SHIFT: u32 = 20;

/// Build the CC value used for bring-up: NVM command set, round-robin
/// arbitration, no shutdown notification, 64-byte SQ entries, 16-byte CQ
/// entries, and the negotiated memory page size.
#[inline]
pub fn cc_value(page_shift: u32) -> u32 {
    CC_EN
        | (CC_CSS_NVM << CC_CSS_SHIFT)
        | ((page_shift - 12) << CC_MPS_SHIFT)
        | (CC_AMS_RR << CC_AMS_SHIFT)
        | CC_SHN_NONE
        | (6 << CC_IOSQES_SHIFT)
        | (4 << CC_IOCQES_SHIFT)
}

// =============================================================================
// CSTS - Controller Status (32-bit)
// =============================================================================

bitflags! {
    /// Controller status register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Csts: u32 {
        /// Ready
        const RDY = 1 << 0;
        /// Controller Fatal Status
        const CFS = 1 << 1;
        /// Shutdown Status (2 bits)
        const SHST_OCCURRING = 1 << 2;
        const SHST_COMPLETE = 2 << 2;
    }
}

pub const CSTS_SHST_MASK: u32 = 0x3 << 2;

// =============================================================================
// AQA - Admin Queue Attributes (32-bit)
// =============================================================================

pub const AQA_ASQS_SHIFT: u32 = 0;
pub const AQA_ACQS_SHIFT: u32 = 16;
pub const AQA_SIZE_MASK: u32 = 0xFFF;

/// Build the AQA register value from 1-based admin queue depths.
#[inline]
pub fn aqa_value(asqs: u16, acqs: u16) -> u32 {
    (((asqs as u32 - 1) & AQA_SIZE_MASK) << AQA_ASQS_SHIFT)
        | (((acqs as u32 - 1) & AQA_SIZE_MASK) << AQA_ACQS_SHIFT)
}

// =============================================================================
// CAP - Controller Capabilities (64-bit)
// =============================================================================

/// Decoded snapshot of the CAP register.
#[derive(Debug, Clone, Copy, Default)]
pub struct Caps {
    /// Maximum queue entries supported (0-based)
    pub mqes: u16,
    /// Contiguous queues required
    pub cqr: bool,
    /// Arbitration mechanisms supported
    pub ams: u8,
    /// Worst-case ready transition time, in 500 ms units
    pub to: u8,
    /// Doorbell stride (stride bytes = 4 << dstrd)
    pub dstrd: u8,
    /// Command sets supported bitmap
    pub css: u8,
    /// Memory page size minimum (page = 2^(12 + mpsmin))
    pub mpsmin: u8,
    /// Memory page size maximum
    pub mpsmax: u8,
}

impl Caps {
    pub fn from_raw(value: u64) -> Self {
        Caps {
            mqes: (value & 0xFFFF) as u16,
            cqr: (value >> 16) & 1 != 0,
            ams: ((value >> 17) & 0x3) as u8,
            to: ((value >> 24) & 0xFF) as u8,
            dstrd: ((value >> 32) & 0xF) as u8,
            css: ((value >> 37) & 0xFF) as u8,
            mpsmin: ((value >> 48) & 0xF) as u8,
            mpsmax: ((value >> 52) & 0xF) as u8,
        }
    }

    /// Largest queue depth the controller accepts.
    #[inline]
    pub fn max_queue_depth(&self) -> u16 {
        self.mqes.saturating_add(1)
    }

    /// Whether the host page shift falls inside the controller's supported
    /// memory page range.
    #[inline]
    pub fn supports_page_shift(&self, page_shift: u32) -> bool {
        let min = 12 + self.mpsmin as u32;
        let max = 12 + self.mpsmax as u32;
        page_shift >= min && page_shift <= max
    }

    /// Ready-wait budget in microseconds (CAP.TO is in 500 ms units).
    #[inline]
    pub fn timeout_us(&self) -> u64 {
        self.to as u64 * 500_000
    }
}

// =============================================================================
// Queue entry sizes
// =============================================================================

/// Submission queue entry size in bytes
pub const SQE_SIZE: usize = 64;
/// Completion queue entry size in bytes
pub const CQE_SIZE: usize = 16;
