//! One-time secrets issued at boot.
//!
//! The setup network password and the device token are drawn from the same
//! generator but are never interchangeable: the password protects the setup
//! network, the token authorizes privileged requests.

use rand::{Rng, SeedableRng, rngs::StdRng};
use std::{fmt, time::Instant};

const ALPHABET: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

pub const DEFAULT_PASSWORD_LENGTH: usize = 8;
pub const DEFAULT_TOKEN_LENGTH: usize = 12;

/// Random string source, created once per boot cycle.
pub struct SecretGenerator {
    rng: StdRng,
}

impl SecretGenerator {
    /// Seed from OS entropy mixed with the boot instant.
    ///
    /// Two boots of the same device never share a seed even if the entropy
    /// source is weak early in boot.
    pub fn from_entropy(boot: Instant) -> Self {
        let mut rng = StdRng::from_entropy();
        let jitter = u64::from(boot.elapsed().subsec_nanos());
        let mixed = rng.r#gen::<u64>() ^ jitter;

        Self {
            rng: StdRng::seed_from_u64(mixed),
        }
    }

    /// Deterministic generator for tests and reproducible tooling.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Draw `length` symbols uniformly from `0-9A-Z`.
    pub fn generate(&mut self, length: usize) -> String {
        debug_assert!(length >= 1, "secret length must be at least 1");

        (0..length)
            .map(|_| char::from(ALPHABET[self.rng.gen_range(0..ALPHABET.len())]))
            .collect()
    }

    pub fn setup_password(&mut self, length: usize) -> SetupPassword {
        SetupPassword(self.generate(length.max(1)))
    }

    pub fn device_token(&mut self, length: usize) -> DeviceToken {
        DeviceToken(self.generate(length.max(1)))
    }

    /// Draw both boot secrets, password first.
    pub fn boot_secrets(&mut self, password_length: usize, token_length: usize) -> BootSecrets {
        BootSecrets {
            setup_password: self.setup_password(password_length),
            device_token: self.device_token(token_length),
        }
    }
}

/// The pair of secrets issued once per boot cycle.
#[derive(Clone, Debug)]
pub struct BootSecrets {
    pub setup_password: SetupPassword,
    pub device_token: DeviceToken,
}

/// Secret required for privileged requests.
#[derive(Clone, PartialEq, Eq)]
pub struct DeviceToken(String);

impl DeviceToken {
    /// Wrap an externally chosen token, rejecting the empty string.
    pub fn new(token: impl Into<String>) -> Option<Self> {
        let token = token.into();
        (!token.is_empty()).then_some(Self(token))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for DeviceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DeviceToken(***)")
    }
}

/// Password of the device-hosted setup network.
#[derive(Clone, PartialEq, Eq)]
pub struct SetupPassword(String);

impl SetupPassword {
    pub fn new(password: impl Into<String>) -> Option<Self> {
        let password = password.into();
        (!password.is_empty()).then_some(Self(password))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SetupPassword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SetupPassword(***)")
    }
}
