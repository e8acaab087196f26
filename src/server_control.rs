use log::{error, info};
use std::fmt;
use tokio::sync::broadcast;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestartReason {
    WindowExpired,
    ResetRequested,
}

impl fmt::Display for RestartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartReason::WindowExpired => write!(f, "setup window expired"),
            RestartReason::ResetRequested => write!(f, "reset requested"),
        }
    }
}

/// Ends the current boot cycle.
///
/// The receiving side (`main`) tears the server down and boots a fresh
/// provisioning cycle, which regenerates all secrets and re-enters setup.
#[derive(Clone)]
pub struct RestartSignal {
    tx: broadcast::Sender<RestartReason>,
}

impl RestartSignal {
    pub fn channel() -> (Self, broadcast::Receiver<RestartReason>) {
        let (tx, rx) = broadcast::channel(1);
        (Self { tx }, rx)
    }

    pub fn trigger(&self, reason: RestartReason) {
        info!("restart triggered: {reason}");

        if let Err(e) = self.tx.send(reason) {
            error!("failed to trigger restart: {e:#}");
        }
    }
}
