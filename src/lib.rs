//! Host-side driver core for NVM Express (NVMe) block storage
//! controllers attached over PCIe.
//!
//! The crate drives a standards-conformant controller through its
//! lifecycle, translates block-shaped requests into submission-queue
//! entries, rides the completion queues to acknowledge them, and keeps
//! the device usable under errors, timeouts, hot-plug, and reset.
//!
//! ## Architecture
//!
//! ```text
//! +----------------------+
//! |     Block Layer      |  (external)
//! +----------------------+
//!           |
//! +----------------------+
//! |     driver.rs        |  (requests, queue selection, registry)
//! +----------------------+
//!           |
//! +----------------------+
//! | controller.rs        |  (lifecycle, admin commands, namespaces)
//! | recovery.rs          |  (reset, task management, timeouts)
//! +----------------------+
//!           |
//! +----------------------+
//! |     queue.rs         |  (submission/completion rings, slots)
//! |     prp.rs           |  (scatter-gather to PRP translation)
//! +----------------------+
//!           |
//! +----------------------+
//! |  cmd.rs / regs.rs    |  (wire formats, register layout)
//! +----------------------+
//!           |
//! +----------------------+
//! |      hal.rs          |  (MMIO, DMA, time -- platform supplied)
//! +----------------------+
//! ```
//!
//! The platform integration implements [`hal::Hal`]; everything above it
//! is portable. No I/O is accepted until the controller has been taken
//! through `attach` → `start` → `set_operational`.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod cmd;
pub mod cmdinfo;
pub mod controller;
pub mod driver;
pub mod error;
pub mod hal;
pub mod ident;
pub mod namespace;
pub mod prp;
pub mod queue;
pub mod recovery;
pub mod regs;
pub mod sg;
pub mod state;

pub use controller::{Config, Controller, Identity};
pub use driver::{IoDoneFn, IoOp, IoRequest, Registry};
pub use error::{Result, Status};
pub use hal::{DmaDirection, DmaEntry, Hal};
pub use namespace::Namespace;
pub use recovery::{AbortOutcome, ResetKind};
pub use state::CtrlrState;
