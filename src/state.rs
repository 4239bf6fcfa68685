//! Controller state machine.

use core::fmt;

use spin::Mutex;

/// Global controller state.
///
/// Init → Started → Operational ⇄ Suspend, Operational → InReset →
/// Operational (or Failed), any → Missing (terminal for I/O),
/// Operational → Quiesced → Detached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtrlrState {
    Init,
    Started,
    Operational,
    Suspend,
    InReset,
    Missing,
    Quiesced,
    Detached,
    Failed,
}

impl CtrlrState {
    pub fn as_str(self) -> &'static str {
        match self {
            CtrlrState::Init => "Init",
            CtrlrState::Started => "Started",
            CtrlrState::Operational => "Operational",
            CtrlrState::Suspend => "Suspend",
            CtrlrState::InReset => "InReset",
            CtrlrState::Missing => "Missing",
            CtrlrState::Quiesced => "Quiesced",
            CtrlrState::Detached => "Detached",
            CtrlrState::Failed => "Failed",
        }
    }
}

impl fmt::Display for CtrlrState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Atomic holder for the controller state, enforcing the terminal-state
/// rules: once Missing, only Detached may follow; once Failed, only
/// Missing.
pub struct StateMachine {
    state: Mutex<CtrlrState>,
}

impl StateMachine {
    pub fn new() -> StateMachine {
        StateMachine {
            state: Mutex::new(CtrlrState::Init),
        }
    }

    pub fn get(&self) -> CtrlrState {
        *self.state.lock()
    }

    /// Transition to `new`, returning the prior state for CAS-style
    /// callers. Illegal transitions leave the state unchanged (the prior
    /// state still tells the caller what happened).
    pub fn set(&self, new: CtrlrState) -> CtrlrState {
        let mut state = self.state.lock();
        let prior = *state;
        let legal = match prior {
            CtrlrState::Missing => new == CtrlrState::Detached,
            CtrlrState::Failed => new == CtrlrState::Missing,
            _ => true,
        };
        if legal {
            *state = new;
        } else {
            log::warn!("illegal state transition {} -> {}", prior, new);
        }
        log::debug!("controller state {} -> {}", prior, *state);
        prior
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        StateMachine::new()
    }
}
