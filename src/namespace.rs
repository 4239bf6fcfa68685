//! Namespace records and validation.

use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use spin::Mutex;

use crate::error::{Result, Status};
use crate::ident::IdentifyNamespace;

/// The only logical block size the upper layer consumes.
pub const SECTOR_SIZE: u32 = 512;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NsFlags: u32 {
        const ONLINE = 1 << 0;
        const FLUSHING = 1 << 1;
        const READONLY = 1 << 2;
    }
}

/// One namespace of a controller.
///
/// Shared between the controller's namespace list and upper-layer path
/// bindings; the reference count tracks the path bindings, and the record
/// is dropped from the controller list only after the last binding is
/// released while the controller is no longer operational.
pub struct Namespace {
    /// Namespace identifier
    pub id: u32,
    /// Size in logical blocks
    pub block_count: u64,
    /// log2 of the logical block size
    pub lba_shift: u8,
    /// Metadata bytes per block in the active format
    pub meta_size: u16,
    /// Namespace features byte
    pub feature: u8,
    /// Raw formatted-LBA-size byte
    pub fmt_lba_size: u8,
    /// End-to-end protection capabilities
    pub data_prot_cap: u8,
    /// End-to-end protection settings; non-zero means PI is enabled
    pub data_prot_set: u8,
    /// IEEE extended unique identifier
    pub eui64: u64,
    flags: Mutex<NsFlags>,
    refcount: AtomicU64,
}

impl Namespace {
    /// Build a namespace record from IDENTIFY NAMESPACE data. The record
    /// starts online; `validate` may force it offline later.
    pub fn from_identify(nsid: u32, ident: &IdentifyNamespace) -> Namespace {
        Namespace {
            id: nsid,
            block_count: ident.nsze,
            lba_shift: ident.lba_shift(),
            meta_size: ident.metadata_size(),
            feature: ident.nsfeat,
            fmt_lba_size: ident.flbas,
            data_prot_cap: ident.dpc,
            data_prot_set: ident.dps,
            eui64: u64::from_le_bytes(ident.eui64),
            flags: Mutex::new(NsFlags::ONLINE),
            refcount: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn block_size(&self) -> u32 {
        1u32 << self.lba_shift
    }

    pub fn is_online(&self) -> bool {
        self.flags.lock().contains(NsFlags::ONLINE)
    }

    pub fn set_online(&self, online: bool) {
        let mut flags = self.flags.lock();
        if online {
            flags.insert(NsFlags::ONLINE);
        } else {
            flags.remove(NsFlags::ONLINE);
        }
    }

    pub fn is_readonly(&self) -> bool {
        self.flags.lock().contains(NsFlags::READONLY)
    }

    /// Check the namespace against what the upper layer supports. Any
    /// rejection forces the namespace offline.
    ///
    /// Supported: online, non-empty, 512-byte logical blocks, no
    /// metadata, protection information disabled.
    pub fn validate(&self) -> Result<()> {
        if !self.is_online() {
            return Err(Status::NsOffline);
        }

        let reason = if self.block_count == 0 {
            Some("empty namespace")
        } else if self.block_size() != SECTOR_SIZE {
            Some("unsupported logical block size")
        } else if self.meta_size != 0 {
            Some("metadata not supported")
        } else if self.data_prot_set != 0 {
            Some("protection information not supported")
        } else {
            None
        };

        if let Some(reason) = reason {
            log::error!(
                "ns {}: {} (blocks {}, lba size {}, meta {}, dps {:#x})",
                self.id,
                reason,
                self.block_count,
                self.block_size(),
                self.meta_size,
                self.data_prot_set
            );
            self.set_online(false);
            return Err(Status::InvalidNsOrFormat);
        }
        Ok(())
    }

    /// Take a path reference.
    pub fn get(&self) -> u64 {
        self.refcount.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drop a path reference; returns the remaining count.
    pub fn put(&self) -> u64 {
        let prior = self.refcount.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prior > 0);
        prior - 1
    }

    pub fn refcount(&self) -> u64 {
        self.refcount.load(Ordering::Acquire)
    }
}
