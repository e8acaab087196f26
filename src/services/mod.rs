//! Provisioning core
//!
//! Everything in here is independent of HTTP. Time is passed in explicitly so
//! the deadline and rate limit logic can be driven from tests.

pub mod access;
pub mod limiter;
pub mod mode;
pub mod provisioning;
pub mod secret;
pub mod window;

pub use provisioning::{ProvisioningService, ProvisioningSettings, TokenPolicy};
