//! Device mode state machine.
//!
//! ```text
//!  Setup ──CredentialsAccepted──▶ Connecting ──JoinSucceeded──▶ Operational
//!                                   ▲     │
//!               CredentialsAccepted │     │ JoinFailed
//!                                   │     ▼
//!                                SetupFallback
//! ```
//!
//! Window expiry and explicit resets are not transitions: they end the boot
//! cycle and the next cycle starts in [`Mode::Setup`].

use crate::error::{ProvisioningError, ProvisioningResult};
use log::info;
use serde::Serialize;
use std::{fmt, time::Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Mode {
    Setup,
    Connecting,
    Operational,
    SetupFallback,
}

impl Mode {
    /// Setup network is up and new credentials are accepted.
    pub fn is_provisioning_open(self) -> bool {
        matches!(self, Mode::Setup | Mode::SetupFallback)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Mode::Setup => "setup",
            Mode::Connecting => "connecting",
            Mode::Operational => "operational",
            Mode::SetupFallback => "setup fallback",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModeEvent {
    CredentialsAccepted,
    JoinSucceeded,
    JoinFailed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModeChange {
    pub from: Mode,
    pub to: Mode,
    pub event: ModeEvent,
    pub at: Instant,
}

pub struct ModeStateMachine {
    mode: Mode,
    history: Vec<ModeChange>,
}

impl Default for ModeStateMachine {
    fn default() -> Self {
        Self {
            mode: Mode::Setup,
            history: Vec::new(),
        }
    }
}

impl ModeStateMachine {
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Every change applied in this boot cycle, oldest first.
    pub fn history(&self) -> &[ModeChange] {
        &self.history
    }

    /// Apply `event`. Rejected events leave the mode untouched.
    pub fn apply(&mut self, event: ModeEvent, now: Instant) -> ProvisioningResult<Mode> {
        let next = match (self.mode, event) {
            (Mode::Setup | Mode::SetupFallback, ModeEvent::CredentialsAccepted) => {
                Mode::Connecting
            }
            (Mode::Connecting, ModeEvent::JoinSucceeded) => Mode::Operational,
            (Mode::Connecting, ModeEvent::JoinFailed) => Mode::SetupFallback,
            (from, event) => return Err(ProvisioningError::InvalidTransition { from, event }),
        };

        info!("mode changed: {} -> {next} ({event:?})", self.mode);

        self.history.push(ModeChange {
            from: self.mode,
            to: next,
            event,
            at: now,
        });
        self.mode = next;

        Ok(next)
    }
}
