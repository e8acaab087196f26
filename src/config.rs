use crate::services::{
    limiter, secret,
    provisioning::{ProvisioningSettings, TokenPolicy},
    window,
};
use anyhow::{Context, Result, bail};
use std::{env, str::FromStr, sync::OnceLock, time::Duration};

/// Application configuration loaded and validated at startup
#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Portal HTTP server configuration
    pub portal: PortalConfig,

    /// Setup network, secrets and rate limiting
    pub provisioning: ProvisioningSettings,

    /// Hardware daemon client configuration
    pub device_service: DeviceServiceConfig,

    /// Interval of the cooperative polling tick
    pub tick_interval: Duration,
}

#[derive(Clone, Debug)]
pub struct PortalConfig {
    pub port: u16,
    /// Address the captive portal redirects to
    pub host: String,
}

#[derive(Clone, Debug)]
pub struct DeviceServiceConfig {
    pub url: String,
    pub request_timeout: Duration,
    pub join_attempts: u32,
    pub join_interval: Duration,
    pub actuator_steps: u32,
    pub actuator_speed: u32,
}

impl AppConfig {
    /// Get or load the application configuration
    ///
    /// Returns a reference to the cached configuration. On first call, it loads
    /// and validates all configuration from environment variables.
    ///
    /// # Panics
    /// Panics if configuration loading fails. The portal cannot run without a
    /// valid configuration.
    pub fn get() -> &'static Self {
        static APP_CONFIG: OnceLock<AppConfig> = OnceLock::new();
        APP_CONFIG.get_or_init(|| Self::load().expect("failed to load application configuration"))
    }

    /// Load and validate all configuration from environment variables
    pub fn load() -> Result<Self> {
        Ok(Self {
            portal: PortalConfig::load()?,
            provisioning: load_provisioning()?,
            device_service: DeviceServiceConfig::load()?,
            tick_interval: Duration::from_millis(parse_var("TICK_INTERVAL_MS", 500)?),
        })
    }
}

impl PortalConfig {
    fn load() -> Result<Self> {
        Ok(Self {
            port: parse_var("PORTAL_PORT", 80)?,
            host: env::var("PORTAL_HOST").unwrap_or_else(|_| "192.168.4.1".to_string()),
        })
    }
}

impl DeviceServiceConfig {
    fn load() -> Result<Self> {
        let url = env::var("DEVICE_SERVICE_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8081".to_string())
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            url,
            request_timeout: Duration::from_secs(parse_var("DEVICE_REQUEST_TIMEOUT_SECS", 10)?),
            join_attempts: parse_var("JOIN_ATTEMPTS", 30)?,
            join_interval: Duration::from_millis(parse_var("JOIN_INTERVAL_MS", 500)?),
            actuator_steps: parse_var("ACTUATOR_STEPS", 1024)?,
            actuator_speed: parse_var("ACTUATOR_SPEED", 300)?,
        })
    }
}

fn load_provisioning() -> Result<ProvisioningSettings> {
    let password_length: usize =
        parse_var("SETUP_PASSWORD_LENGTH", secret::DEFAULT_PASSWORD_LENGTH)?;
    let token_length: usize = parse_var("DEVICE_TOKEN_LENGTH", secret::DEFAULT_TOKEN_LENGTH)?;

    // WPA2 requires at least 8 characters for the setup network
    if password_length < 8 {
        bail!("failed to parse SETUP_PASSWORD_LENGTH: must be at least 8");
    }
    if token_length == 0 {
        bail!("failed to parse DEVICE_TOKEN_LENGTH: must not be 0");
    }

    let max_attempts = parse_var("CONNECT_MAX_ATTEMPTS", limiter::DEFAULT_MAX_ATTEMPTS)?;
    if max_attempts == 0 {
        bail!("failed to parse CONNECT_MAX_ATTEMPTS: must not be 0");
    }

    Ok(ProvisioningSettings {
        setup_ssid: env::var("SETUP_SSID").unwrap_or_else(|_| "MTG_Scanner_Setup".to_string()),
        password_length,
        token_length,
        window_budget: Duration::from_secs(parse_var(
            "SETUP_WINDOW_SECS",
            window::DEFAULT_BUDGET.as_secs(),
        )?),
        attempt_window: Duration::from_secs(parse_var(
            "CONNECT_WINDOW_SECS",
            limiter::DEFAULT_WINDOW.as_secs(),
        )?),
        max_attempts,
        token_policy: parse_var("TOKEN_POLICY", TokenPolicy::Shared)?,
    })
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .context(format!("failed to parse {name}: invalid format")),
        Err(_) => Ok(default),
    }
}
