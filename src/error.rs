//! Driver status codes and completion-entry status decoding.

use core::fmt;

use crate::cmd::Cqe;

// =============================================================================
// Status Code Types (CQE.SCT)
// =============================================================================

/// Generic Command Status
pub const SCT_GENERIC: u8 = 0;
/// Command Specific Status
pub const SCT_COMMAND_SPECIFIC: u8 = 1;
/// Media and Data Integrity Errors
pub const SCT_MEDIA_ERROR: u8 = 2;
/// Vendor Specific
pub const SCT_VENDOR: u8 = 7;

// =============================================================================
// Generic Status Codes (SCT = 0)
// =============================================================================

pub const SC_SUCCESS: u8 = 0x00;
pub const SC_INVALID_OPCODE: u8 = 0x01;
pub const SC_INVALID_FIELD: u8 = 0x02;
pub const SC_CID_CONFLICT: u8 = 0x03;
pub const SC_DATA_XFER_ERROR: u8 = 0x04;
/// Commands aborted due to power loss notification
pub const SC_POWER_LOSS: u8 = 0x05;
pub const SC_INTERNAL: u8 = 0x06;
pub const SC_ABORT_REQUESTED: u8 = 0x07;
pub const SC_ABORT_SQ_DELETED: u8 = 0x08;
pub const SC_ABORT_FUSED_FAIL: u8 = 0x09;
pub const SC_ABORT_FUSED_MISSING: u8 = 0x0A;
pub const SC_INVALID_NS: u8 = 0x0B;
pub const SC_CMD_SEQ_ERROR: u8 = 0x0C;
pub const SC_LBA_RANGE: u8 = 0x80;
pub const SC_CAP_EXCEEDED: u8 = 0x81;
pub const SC_NS_NOT_READY: u8 = 0x82;

// =============================================================================
// Command Specific Status Codes (SCT = 1)
// =============================================================================

pub const SC_SPC_INVALID_CQ: u8 = 0x00;
pub const SC_SPC_INVALID_QID: u8 = 0x01;
pub const SC_SPC_EXCEED_Q_SIZE: u8 = 0x02;
pub const SC_SPC_EXCEED_ABORT_LIMIT: u8 = 0x03;
pub const SC_SPC_EXCEED_AER_LIMIT: u8 = 0x05;
pub const SC_SPC_INVALID_FW_SLOT: u8 = 0x06;
pub const SC_SPC_INVALID_FW_IMAGE: u8 = 0x07;
pub const SC_SPC_INVALID_INT_VECTOR: u8 = 0x08;
pub const SC_SPC_INVALID_LOG_PAGE: u8 = 0x09;
pub const SC_SPC_INVALID_FORMAT: u8 = 0x0A;
/// Firmware activation requires conventional reset
pub const SC_SPC_FW_NEEDS_RESET: u8 = 0x0B;
/// Firmware activation requires NVM subsystem reset
pub const SC_SPC_FW_NEEDS_SUBSYS_RESET: u8 = 0x10;
pub const SC_SPC_ATTR_CONFLICT: u8 = 0x80;
pub const SC_SPC_INVALID_PROT_INFO: u8 = 0x81;
pub const SC_SPC_WRITE_TO_RO_RANGE: u8 = 0x82;

// =============================================================================
// Media Error Status Codes (SCT = 2)
// =============================================================================

pub const SC_MEDIA_WRITE_FAULT: u8 = 0x80;
pub const SC_MEDIA_UNRECOVERED_READ: u8 = 0x81;
pub const SC_MEDIA_GUARD_CHECK: u8 = 0x82;
pub const SC_MEDIA_APP_TAG_CHECK: u8 = 0x83;
pub const SC_MEDIA_REF_TAG_CHECK: u8 = 0x84;
pub const SC_MEDIA_COMPARE_FAIL: u8 = 0x85;

// =============================================================================
// Driver Status
// =============================================================================

/// Status code for operations on the driver core.
///
/// Commands that reached the hardware are completed with a status decoded
/// from the completion entry; everything else reports the driver-side
/// condition directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// No error
    Success,
    /// Device removed
    DeviceMissing,
    /// Device not ready
    NotReady,
    /// Device is going through reset
    InReset,
    /// Device is shut down
    Quiesced,
    /// Fatal error, device cannot recover
    FatalError,
    /// Medium error
    MediumError,
    /// Queue full
    QueueFull,
    /// Device is busy
    Busy,
    /// Invalid operation code
    InvalidOpcode,
    /// Invalid field in the command
    InvalidField,
    /// Invalid namespace or format
    InvalidNsOrFormat,
    /// Namespace not ready
    NsNotReady,
    /// Namespace is offline
    NsOffline,
    /// I/O error
    IoError,
    /// I/O write error
    IoWriteError,
    /// I/O read error
    IoReadError,
    /// Command aborted
    Aborted,
    /// Command timed out
    Timeout,
    /// Command reset
    Reset,
    /// Command will be completed asynchronously
    WouldBlock,
    /// Underrun condition
    Underrun,
    /// Overrun condition
    Overrun,
    /// LBA out of range
    LbaOutOfRange,
    /// Capacity exceeded
    CapacityExceeded,
    /// Conflicting attributes
    ConflictAttributes,
    /// Invalid protection information
    InvalidPi,
    /// NVMe protocol error
    ProtocolError,
    /// Bad parameter
    BadParam,
    /// General failure
    Failure,
    /// Write to a read-only range
    WriteProtect,
    /// Over temperature
    OverTemp,
    /// Guard check failure
    GuardCheckError,
    /// Application tag check failure
    AppCheckError,
    /// Reference tag check failure
    RefCheckError,
    /// Parameter list length error
    ParamListLengthError,
    /// DMA allocation failure
    Alloc,
}

impl Status {
    #[inline]
    pub fn is_success(self) -> bool {
        self == Status::Success
    }

    /// Whether a synchronous submitter has relinquished the command to the
    /// error-recovery path instead of receiving it back.
    #[inline]
    pub fn is_delayed_return(self) -> bool {
        matches!(self, Status::Timeout | Status::Aborted)
    }

    /// Decode a completion entry status field into a driver status.
    ///
    /// Total over all (SCT, SC) combinations. Only (0, 0) and the two
    /// firmware-activation-pending codes map to `Success`.
    pub fn from_cqe(cqe: &Cqe) -> Status {
        let sct = cqe.sct();
        let sc = cqe.sc();

        if sct == SCT_GENERIC && sc == SC_SUCCESS {
            return Status::Success;
        }

        match sct {
            SCT_GENERIC => match sc {
                SC_INVALID_OPCODE => Status::InvalidOpcode,
                SC_INVALID_FIELD => Status::InvalidField,
                SC_CID_CONFLICT => Status::ProtocolError,
                SC_DATA_XFER_ERROR => Status::IoError,
                SC_POWER_LOSS => Status::DeviceMissing,
                SC_INTERNAL => Status::MediumError,
                SC_ABORT_REQUESTED => Status::Aborted,
                SC_ABORT_SQ_DELETED => Status::Quiesced,
                SC_ABORT_FUSED_FAIL => Status::ProtocolError,
                SC_ABORT_FUSED_MISSING => Status::ProtocolError,
                SC_INVALID_NS => Status::InvalidNsOrFormat,
                SC_CMD_SEQ_ERROR => Status::ProtocolError,
                SC_LBA_RANGE => Status::LbaOutOfRange,
                SC_CAP_EXCEEDED => Status::CapacityExceeded,
                SC_NS_NOT_READY => Status::NsNotReady,
                _ => Status::Failure,
            },
            SCT_COMMAND_SPECIFIC => match sc {
                SC_SPC_INVALID_CQ
                | SC_SPC_INVALID_QID
                | SC_SPC_EXCEED_Q_SIZE
                | SC_SPC_EXCEED_ABORT_LIMIT
                | SC_SPC_EXCEED_AER_LIMIT
                | SC_SPC_INVALID_FW_SLOT
                | SC_SPC_INVALID_FW_IMAGE
                | SC_SPC_INVALID_INT_VECTOR
                | SC_SPC_INVALID_LOG_PAGE
                | SC_SPC_INVALID_FORMAT => Status::ProtocolError,
                // Firmware is activated, the controller just wants a reset
                // before it takes effect.
                SC_SPC_FW_NEEDS_RESET | SC_SPC_FW_NEEDS_SUBSYS_RESET => Status::Success,
                SC_SPC_ATTR_CONFLICT => Status::ConflictAttributes,
                SC_SPC_INVALID_PROT_INFO => Status::InvalidPi,
                SC_SPC_WRITE_TO_RO_RANGE => Status::WriteProtect,
                _ => Status::Failure,
            },
            SCT_MEDIA_ERROR => match sc {
                SC_MEDIA_WRITE_FAULT => Status::IoWriteError,
                SC_MEDIA_UNRECOVERED_READ => Status::IoReadError,
                SC_MEDIA_GUARD_CHECK
                | SC_MEDIA_APP_TAG_CHECK
                | SC_MEDIA_REF_TAG_CHECK
                | SC_MEDIA_COMPARE_FAIL => Status::MediumError,
                _ => Status::MediumError,
            },
            SCT_VENDOR => Status::Failure,
            _ => Status::Failure,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Success => "success",
            Status::DeviceMissing => "device missing",
            Status::NotReady => "not ready",
            Status::InReset => "in reset",
            Status::Quiesced => "quiesced",
            Status::FatalError => "fatal error",
            Status::MediumError => "medium error",
            Status::QueueFull => "queue full",
            Status::Busy => "busy",
            Status::InvalidOpcode => "invalid opcode",
            Status::InvalidField => "invalid field in command",
            Status::InvalidNsOrFormat => "invalid namespace or format",
            Status::NsNotReady => "namespace not ready",
            Status::NsOffline => "namespace offline",
            Status::IoError => "I/O error",
            Status::IoWriteError => "I/O write error",
            Status::IoReadError => "I/O read error",
            Status::Aborted => "aborted",
            Status::Timeout => "timed out",
            Status::Reset => "reset",
            Status::WouldBlock => "would block",
            Status::Underrun => "underrun",
            Status::Overrun => "overrun",
            Status::LbaOutOfRange => "LBA out of range",
            Status::CapacityExceeded => "capacity exceeded",
            Status::ConflictAttributes => "conflicting attributes",
            Status::InvalidPi => "invalid protection information",
            Status::ProtocolError => "protocol error",
            Status::BadParam => "bad parameter",
            Status::Failure => "failure",
            Status::WriteProtect => "write protected",
            Status::OverTemp => "over temperature",
            Status::GuardCheckError => "guard check error",
            Status::AppCheckError => "application tag check error",
            Status::RefCheckError => "reference tag check error",
            Status::ParamListLengthError => "parameter list length error",
            Status::Alloc => "allocation failure",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type Result<T> = core::result::Result<T, Status>;
