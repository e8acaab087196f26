//! Error kinds surfaced by the provisioning core.
//!
//! Each variant maps to exactly one HTTP status in [`crate::api`]. Only
//! [`ProvisioningError::WindowExpired`] has a side effect beyond the
//! response: the core has already requested a restart when it is returned.

use crate::services::mode::{Mode, ModeEvent};
use thiserror::Error;

pub type ProvisioningResult<T> = Result<T, ProvisioningError>;

#[derive(Debug, Error)]
pub enum ProvisioningError {
    /// Missing, empty or wrong device token.
    #[error("invalid or missing token")]
    Unauthorized,

    /// Credential submission ceiling reached for the current window.
    #[error("too many attempts, wait {retry_after_secs} seconds before trying again")]
    RateLimited { retry_after_secs: u64 },

    /// A required field was empty or out of range.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The network join did not complete.
    ///
    /// Recovered in place by falling back to setup mode. Only logged, never
    /// returned to callers.
    #[error("failed to join network {ssid}")]
    JoinFailed { ssid: String },

    /// The provisioning deadline passed; a restart has been requested.
    #[error("setup window expired, restarting")]
    WindowExpired,

    /// The operation is not meaningful in the current mode.
    #[error("operation not available while {0}")]
    InvalidState(Mode),

    /// An event arrived that the mode state machine does not accept.
    #[error("invalid transition from {from} on {event:?}")]
    InvalidTransition { from: Mode, event: ModeEvent },

    /// A restart is pending; nothing else is served in this boot cycle.
    #[error("device is restarting")]
    Restarting,

    /// A collaborator call failed.
    #[error("device operation failed: {0:#}")]
    Device(#[from] anyhow::Error),
}
