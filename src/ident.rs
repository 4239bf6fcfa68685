//! IDENTIFY CONTROLLER / IDENTIFY NAMESPACE data structures.
//!
//! Both blocks are 4 KiB on the wire; the structs cover the prefix the
//! driver consumes, with reserved ranges padded so field offsets match the
//! specification exactly.

use alloc::string::String;
use alloc::vec::Vec;

/// Subset of the IDENTIFY CONTROLLER data structure (NVMe 1.x).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct IdentifyController {
    /// PCI Vendor ID
    pub vid: u16,
    /// PCI Subsystem Vendor ID
    pub ssvid: u16,
    /// Serial Number
    pub sn: [u8; 20],
    /// Model Number
    pub mn: [u8; 40],
    /// Firmware Revision
    pub fr: [u8; 8],
    /// Recommended Arbitration Burst
    pub rab: u8,
    /// IEEE OUI Identifier
    pub ieee: [u8; 3],
    /// Multi-path I/O and Namespace Sharing Capabilities
    pub cmic: u8,
    /// Maximum Data Transfer Size (2^mdts pages; 0 = unlimited)
    pub mdts: u8,
    /// Controller ID
    pub cntlid: u16,
    /// Version
    pub ver: u32,
    pub _rsvd84: [u8; 172],
    /// Optional Admin Command Support
    pub oacs: u16,
    /// Abort Command Limit
    pub acl: u8,
    /// Asynchronous Event Request Limit (0-based)
    pub aerl: u8,
    /// Firmware Updates
    pub frmw: u8,
    /// Log Page Attributes
    pub lpa: u8,
    /// Error Log Page Entries
    pub elpe: u8,
    /// Number of Power States Support (0-based)
    pub npss: u8,
    /// Admin Vendor Specific Command Configuration
    pub avscc: u8,
    /// Autonomous Power State Transition Attributes
    pub apsta: u8,
    /// Warning Composite Temperature Threshold
    pub wctemp: u16,
    /// Critical Composite Temperature Threshold
    pub cctemp: u16,
    pub _rsvd270: [u8; 242],
    /// Submission Queue Entry Size (required/maximum nibbles)
    pub sqes: u8,
    /// Completion Queue Entry Size
    pub cqes: u8,
    pub _rsvd514: u16,
    /// Number of Namespaces
    pub nn: u32,
    /// Optional NVM Command Support
    pub oncs: u16,
    /// Fused Operation Support
    pub fuses: u16,
    /// Format NVM Attributes
    pub fna: u8,
    /// Volatile Write Cache
    pub vwc: u8,
    /// Atomic Write Unit Normal
    pub awun: u16,
    /// Atomic Write Unit Power Fail
    pub awupf: u16,
    /// NVM Vendor Specific Command Configuration
    pub nvscc: u8,
    pub _rsvd531: u8,
}

impl IdentifyController {
    /// Copy the structure out of a raw IDENTIFY buffer.
    pub fn parse(buf: &[u8]) -> Option<IdentifyController> {
        if buf.len() < core::mem::size_of::<IdentifyController>() {
            return None;
        }
        Some(unsafe { core::ptr::read_unaligned(buf.as_ptr() as *const IdentifyController) })
    }
}

/// One LBA format descriptor.
#[repr(C)]
#[derive(Clone, Copy, Default, Debug)]
pub struct LbaFormat {
    /// Metadata size in bytes
    pub ms: u16,
    /// LBA data size as a power of two
    pub lbads: u8,
    /// Relative performance
    pub rp: u8,
}

/// Subset of the IDENTIFY NAMESPACE data structure (NVMe 1.x).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct IdentifyNamespace {
    /// Namespace Size in logical blocks
    pub nsze: u64,
    /// Namespace Capacity
    pub ncap: u64,
    /// Namespace Utilization
    pub nuse: u64,
    /// Namespace Features
    pub nsfeat: u8,
    /// Number of LBA Formats (0-based)
    pub nlbaf: u8,
    /// Formatted LBA Size: format index in [3:0], metadata-inline in [4]
    pub flbas: u8,
    /// Metadata Capabilities
    pub mc: u8,
    /// End-to-end Data Protection Capabilities
    pub dpc: u8,
    /// End-to-end Data Protection Type Settings
    pub dps: u8,
    /// Multi-path I/O and Namespace Sharing Capabilities
    pub nmic: u8,
    /// Reservation Capabilities
    pub rescap: u8,
    /// Format Progress Indicator
    pub fpi: u8,
    /// Deallocate Logical Block Features
    pub dlfeat: u8,
    pub nawun: u16,
    pub nawupf: u16,
    pub nacwu: u16,
    pub nabsn: u16,
    pub nabo: u16,
    pub nabspf: u16,
    /// Namespace Optimal I/O Boundary
    pub noiob: u16,
    /// NVM Capacity (128-bit, bytes)
    pub nvmcap: [u8; 16],
    pub _rsvd64: [u8; 40],
    /// Namespace Globally Unique Identifier
    pub nguid: [u8; 16],
    /// IEEE Extended Unique Identifier
    pub eui64: [u8; 8],
    /// LBA Format Support
    pub lbaf: [LbaFormat; 16],
}

impl IdentifyNamespace {
    pub fn parse(buf: &[u8]) -> Option<IdentifyNamespace> {
        if buf.len() < core::mem::size_of::<IdentifyNamespace>() {
            return None;
        }
        Some(unsafe { core::ptr::read_unaligned(buf.as_ptr() as *const IdentifyNamespace) })
    }

    /// Index of the LBA format currently in use.
    #[inline]
    pub fn format_index(&self) -> usize {
        (self.flbas & 0x0F) as usize
    }

    /// Shift of the formatted LBA data size.
    pub fn lba_shift(&self) -> u8 {
        self.lbaf[self.format_index()].lbads
    }

    /// Metadata bytes per block in the selected format.
    pub fn metadata_size(&self) -> u16 {
        self.lbaf[self.format_index()].ms
    }
}

/// Sanitize a fixed-width ASCII identity field (serial, model, firmware):
/// everything from the first NUL becomes spaces, ':' becomes a space
/// (it collides with path separators in device names downstream), other
/// non-printable bytes become spaces, and outer padding is trimmed.
pub fn sanitize_ascii(raw: &[u8]) -> String {
    let mut bytes: Vec<u8> = raw.to_vec();
    if let Some(pos) = bytes.iter().position(|&b| b == 0) {
        for b in &mut bytes[pos..] {
            *b = b' ';
        }
    }
    for b in &mut bytes {
        if *b == b':' || !(b.is_ascii_graphic() || *b == b' ') {
            *b = b' ';
        }
    }
    let s = core::str::from_utf8(&bytes).unwrap_or("");
    String::from(s.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controller_field_offsets() {
        assert_eq!(core::mem::offset_of!(IdentifyController, sn), 4);
        assert_eq!(core::mem::offset_of!(IdentifyController, mn), 24);
        assert_eq!(core::mem::offset_of!(IdentifyController, fr), 64);
        assert_eq!(core::mem::offset_of!(IdentifyController, ieee), 73);
        assert_eq!(core::mem::offset_of!(IdentifyController, mdts), 77);
        assert_eq!(core::mem::offset_of!(IdentifyController, oacs), 256);
        assert_eq!(core::mem::offset_of!(IdentifyController, aerl), 259);
        assert_eq!(core::mem::offset_of!(IdentifyController, lpa), 261);
        assert_eq!(core::mem::offset_of!(IdentifyController, avscc), 264);
        assert_eq!(core::mem::offset_of!(IdentifyController, sqes), 512);
        assert_eq!(core::mem::offset_of!(IdentifyController, nn), 516);
        assert_eq!(core::mem::offset_of!(IdentifyController, nvscc), 530);
    }

    #[test]
    fn test_namespace_field_offsets() {
        assert_eq!(core::mem::offset_of!(IdentifyNamespace, nsfeat), 24);
        assert_eq!(core::mem::offset_of!(IdentifyNamespace, flbas), 26);
        assert_eq!(core::mem::offset_of!(IdentifyNamespace, dps), 29);
        assert_eq!(core::mem::offset_of!(IdentifyNamespace, noiob), 46);
        assert_eq!(core::mem::offset_of!(IdentifyNamespace, nguid), 104);
        assert_eq!(core::mem::offset_of!(IdentifyNamespace, eui64), 120);
        assert_eq!(core::mem::offset_of!(IdentifyNamespace, lbaf), 128);
    }

    #[test]
    fn test_namespace_format_selection() {
        let mut ns: IdentifyNamespace = unsafe { core::mem::zeroed() };
        ns.lbaf[0] = LbaFormat { ms: 0, lbads: 9, rp: 0 };
        ns.lbaf[1] = LbaFormat { ms: 8, lbads: 12, rp: 0 };
        ns.flbas = 0;
        assert_eq!(ns.lba_shift(), 9);
        assert_eq!(ns.metadata_size(), 0);
        ns.flbas = 1;
        assert_eq!(ns.lba_shift(), 12);
        assert_eq!(ns.metadata_size(), 8);
    }

    #[test]
    fn test_parse_rejects_short_buffer() {
        let buf = [0u8; 100];
        assert!(IdentifyController::parse(&buf).is_none());
        assert!(IdentifyNamespace::parse(&buf).is_none());
    }

    #[test]
    fn test_parse_reads_fields() {
        let mut buf = [0u8; 4096];
        buf[0] = 0x86;
        buf[1] = 0x80; // vid = 0x8086
        buf[516] = 4; // nn = 4
        buf[259] = 3; // aerl
        let id = IdentifyController::parse(&buf).unwrap();
        assert_eq!(id.vid, 0x8086);
        assert_eq!(id.nn, 4);
        assert_eq!(id.aerl, 3);
    }

    #[test]
    fn test_sanitize_ascii() {
        assert_eq!(sanitize_ascii(b"Samsung SSD 970\0\0\0\0\0"), "Samsung SSD 970");
        // Embedded NUL wipes the tail
        assert_eq!(sanitize_ascii(b"ABC\0DEF"), "ABC");
        // ':' is replaced
        assert_eq!(sanitize_ascii(b"SN:12345  "), "SN 12345");
        assert_eq!(sanitize_ascii(b"   padded   "), "padded");
    }
}
