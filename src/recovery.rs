//! Error recovery: controller reset, task management, the timeout
//! sweeper, and hot-removal handling.
//!
//! Every recovery path funnels through [`Controller::hw_reset`]: suspend
//! everything, stop the hardware, flush and reset all queues, bring the
//! controller back up, and re-register the I/O queues. Concurrent resets
//! are excluded by the InReset state itself.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::controller::Controller;
use crate::driver::IoRequest;
use crate::error::{Result, Status};
use crate::hal::Hal;
use crate::queue::{FinishedIo, QueuePair};
use crate::regs::{Csts, REG_CSTS, REG_GONE};
use crate::state::CtrlrState;

/// Grace period before an abort scan, giving in-flight commands a chance
/// to complete on their own.
const ABORT_DELAY_US: u64 = 100_000;

/// Task management request kinds understood by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetKind {
    LunReset,
    DeviceReset,
    BusReset,
}

/// Result of a task-management abort scan.
#[derive(Debug, Clone, Copy, Default)]
pub struct AbortOutcome {
    /// Commands matching the abort predicate
    pub found: usize,
    /// Unrelated commands that a reset would disturb
    pub collateral: usize,
    /// Whether a controller reset was performed
    pub did_reset: bool,
}

impl<H: Hal> Controller<H> {
    /// Full controller reset. In-flight I/O commands complete with
    /// `status` (or are reissued, policy permitting); admin commands
    /// complete with `InReset`.
    pub fn hw_reset(&self, status: Status) -> Result<()> {
        let prior = self.state.set(CtrlrState::InReset);
        if prior == CtrlrState::InReset {
            return Err(Status::Busy);
        }
        log::warn!("{}: controller reset, in-flight status {}", self.name, status);

        let queues: Vec<Arc<QueuePair<H>>> = self.io_queues.lock().clone();
        let _ = self.admin.suspend(0);
        for qp in &queues {
            let _ = qp.suspend(0);
        }

        let _ = self.hw_stop();

        let mut finished: Vec<FinishedIo> = Vec::new();
        let mut reissue: Vec<IoRequest> = Vec::new();

        match self.admin.flush(Status::InReset, false) {
            Ok(res) => finished.extend(res.finished),
            Err(e) => log::error!("{}: admin flush failed: {}", self.name, e),
        }
        let _ = self.admin.reset();

        for qp in &queues {
            match qp.flush(status, self.config.reissue_on_reset) {
                Ok(res) => {
                    finished.extend(res.finished);
                    reissue.extend(res.reissue);
                }
                Err(e) => log::error!("{}: queue {} flush failed: {}", self.name, qp.id, e),
            }
            let _ = qp.reset();
        }

        self.cur_aen.store(0, core::sync::atomic::Ordering::Release);

        let restart = (|| {
            self.hw_start()?;
            self.admin.resume()?;

            // The controller may have changed identity across the reset;
            // re-read it and make sure the queue topology still matches.
            self.get_identify()?;
            let expected = queues.len() as u16;
            let granted = self.request_io_queues(expected.max(1))?;
            if granted != expected {
                log::error!(
                    "{}: I/O queue count changed across reset ({} -> {})",
                    self.name,
                    expected,
                    granted
                );
                return Err(Status::Failure);
            }
            self.restart_io_queues()?;
            Ok(())
        })();

        let result = match restart {
            Ok(()) => {
                self.state.set(CtrlrState::Operational);
                self.submit_aens();

                // Reissue survivors now that the queues are live again.
                for req in reissue.drain(..) {
                    log::info!("{}: reissuing flushed request", self.name);
                    if let Err((e, req)) = self.submit_io(req) {
                        finished.push((req, e, 0));
                    }
                }
                log::info!("{}: reset complete", self.name);
                Ok(())
            }
            Err(e) => {
                log::error!("{}: reset failed: {}, offlining controller", self.name, e);
                if e == Status::DeviceMissing {
                    self.state.set(CtrlrState::Missing);
                } else {
                    self.state.set(CtrlrState::Failed);
                }
                for req in reissue.drain(..) {
                    finished.push((req, Status::Failure, 0));
                }
                Err(e)
            }
        };

        for (req, status, bytes) in finished {
            req.complete(status, bytes);
        }
        result
    }

    /// Task-management abort: find in-flight commands matching
    /// `predicate` and, if any exist, reset the controller to clear them
    /// (the only reliable abort mechanism on many controllers).
    pub fn task_mgmt_abort<F>(&self, predicate: F) -> Result<AbortOutcome>
    where
        F: Fn(&IoRequest) -> bool,
    {
        let _serial = self.task_mgmt.lock();

        let state = self.state.get();
        if state != CtrlrState::Operational {
            log::warn!(
                "{}: task-management abort in state {}, busy",
                self.name,
                state
            );
            return Err(Status::Busy);
        }

        // Let stragglers complete before the disruptive part.
        self.hal.delay_us(ABORT_DELAY_US);

        self.state.set(CtrlrState::Suspend);
        let queues: Vec<Arc<QueuePair<H>>> = self.io_queues.lock().clone();
        for qp in &queues {
            let _ = qp.suspend(self.timeout_id.load(core::sync::atomic::Ordering::Acquire));
        }

        let mut outcome = AbortOutcome::default();
        let mut finished: Vec<FinishedIo> = Vec::new();
        for qp in &queues {
            let (found, collateral, fin) = qp.scan_active(&predicate);
            outcome.found += found;
            outcome.collateral += collateral;
            finished.extend(fin);
        }
        for (req, status, bytes) in finished {
            req.complete(status, bytes);
        }

        if outcome.found > 0 {
            log::warn!(
                "{}: abort scan matched {} commands ({} collateral), resetting",
                self.name,
                outcome.found,
                outcome.collateral
            );
            outcome.did_reset = true;
            self.hw_reset(Status::Aborted)?;
        } else {
            // Nothing matched; the hardware already finished the work.
            for qp in &queues {
                let _ = qp.resume();
            }
            self.state.set(CtrlrState::Operational);
        }

        Ok(outcome)
    }

    /// Task-management reset: LUN, device, and bus resets all map onto a
    /// controller reset with `Reset` status for in-flight commands.
    pub fn task_mgmt_reset(&self, kind: ResetKind) -> Result<()> {
        let _serial = self.task_mgmt.lock();
        log::info!("{}: task-management {:?}", self.name, kind);
        match kind {
            ResetKind::LunReset | ResetKind::DeviceReset | ResetKind::BusReset => {
                self.hw_reset(Status::Reset)
            }
        }
    }

    /// Periodic timeout scan, driven by a host timer every
    /// `config.tick_ms`. Advances the bucket cursor and fires a reset
    /// when the oldest bucket still holds outstanding commands. Returns
    /// true when recovery was triggered.
    pub fn timeout_tick(&self) -> bool {
        let csts = self.regs.read32(REG_CSTS);
        if csts == REG_GONE {
            self.set_missing();
            return true;
        }

        if self.state.get() != CtrlrState::Operational {
            return false;
        }

        if Csts::from_bits_truncate(csts).contains(Csts::CFS) {
            log::error!("{}: controller fatal status, resetting", self.name);
            let _ = self.hw_reset(Status::Reset);
            return true;
        }

        let buckets = self.timeout_buckets as u16;
        let current = self.timeout_id.load(core::sync::atomic::Ordering::Acquire);
        let expired = (current + 1) % buckets;

        let queues: Vec<Arc<QueuePair<H>>> = self.io_queues.lock().clone();
        let mut stuck = self.admin.bucket_pending(expired);
        for qp in &queues {
            stuck += qp.bucket_pending(expired);
        }
        if stuck > 0 {
            log::error!(
                "{}: {} commands exceeded the {}s timeout, resetting",
                self.name,
                stuck,
                self.config.timeout_sec
            );
            let _ = self.hw_reset(Status::Timeout);
            return true;
        }

        // The expired bucket is empty; reuse it as the new current one.
        self.timeout_id
            .store(expired, core::sync::atomic::Ordering::Release);
        self.admin.set_timeout_bucket(expired);
        for qp in &queues {
            qp.set_timeout_bucket(expired);
        }
        false
    }

    /// Hot-removal: mark the controller missing, complete all in-flight
    /// commands with `DeviceMissing`, and stop touching the (vanished)
    /// register window.
    pub fn set_missing(&self) {
        let prior = self.state.set(CtrlrState::Missing);
        if prior == CtrlrState::Missing {
            return;
        }
        log::error!("{}: controller hot-removed", self.name);

        let queues: Vec<Arc<QueuePair<H>>> = self.io_queues.lock().clone();
        let mut finished: Vec<FinishedIo> = Vec::new();

        self.admin.mark_dead();
        let _ = self.admin.suspend(0);
        if let Ok(res) = self.admin.flush(Status::DeviceMissing, false) {
            finished.extend(res.finished);
        }

        for qp in &queues {
            qp.mark_dead();
            let _ = qp.suspend(0);
            if let Ok(res) = qp.flush(Status::DeviceMissing, false) {
                finished.extend(res.finished);
            }
        }

        for ns in self.namespaces() {
            ns.set_online(false);
        }

        for (req, status, bytes) in finished {
            req.complete(status, bytes);
        }
    }
}
