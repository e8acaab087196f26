//! Token validation for privileged requests.

use crate::services::{mode::Mode, secret::DeviceToken};
use log::info;
use subtle::ConstantTimeEq;

/// Sole authority for whether a privileged request may proceed.
pub struct AccessController {
    token: DeviceToken,
}

impl AccessController {
    pub fn new(token: DeviceToken) -> Self {
        Self { token }
    }

    /// Check a presented token against the current device token.
    ///
    /// Empty tokens never validate. Comparison runs in constant time for
    /// equal-length inputs.
    pub fn validate(&self, presented: &str, mode: Mode) -> bool {
        if presented.is_empty() {
            return false;
        }

        match mode {
            Mode::Setup | Mode::SetupFallback | Mode::Connecting => self.matches(presented),
            Mode::Operational => self.matches(presented),
        }
    }

    /// Replace the device token. Only the rotation policy calls this.
    pub fn rotate(&mut self, token: DeviceToken) {
        info!("device token rotated");
        self.token = token;
    }

    pub fn token(&self) -> &DeviceToken {
        &self.token
    }

    fn matches(&self, presented: &str) -> bool {
        presented
            .as_bytes()
            .ct_eq(self.token.as_str().as_bytes())
            .into()
    }
}
