use crate::{
    config::DeviceServiceConfig,
    http_client::{device_client, handle_http_response, parse_json_body},
};
use anyhow::{Context, Result};
use log::{debug, error, info};
#[cfg(any(test, feature = "mock"))]
use mockall::automock;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_valid::Validate;
use std::{fmt, net::IpAddr, thread::sleep, time::Duration};

/// Network join credentials, transient for one connection attempt.
#[derive(Clone, Deserialize, Serialize, Validate)]
pub struct Credentials {
    #[validate(min_length = 1)]
    #[validate(max_length = 32)]
    pub ssid: String,
    #[validate(max_length = 63)]
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("ssid", &self.ssid)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined { address: IpAddr },
    Failed,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct VisibleNetwork {
    pub ssid: String,
    pub rssi: i32,
}

/// Hardware capabilities the provisioning core drives.
///
/// All calls block. `join_network` runs the bounded retry loop itself and
/// may take several seconds.
#[cfg_attr(any(test, feature = "mock"), automock)]
pub trait DeviceControl: Send + Sync {
    fn join_network(&self, credentials: &Credentials) -> Result<JoinOutcome>;
    fn start_setup_network(&self, ssid: &str, password: &str) -> Result<()>;
    fn stop_setup_network(&self) -> Result<()>;
    fn scan_networks(&self) -> Result<Vec<VisibleNetwork>>;
    fn notify_operator(&self, lines: &[String]);
    fn trigger_actuator(&self);
    fn button_pressed(&self) -> bool;
}

#[derive(Debug, Serialize)]
struct ApConfig<'a> {
    ssid: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct WifiStatus {
    connected: bool,
    address: Option<IpAddr>,
}

#[derive(Debug, Serialize)]
struct DisplayLines<'a> {
    lines: &'a [String],
}

#[derive(Debug, Serialize)]
struct ActuatorRun {
    steps: u32,
    speed: u32,
}

#[derive(Debug, Deserialize)]
struct ButtonState {
    pressed: bool,
}

/// Client for the local hardware daemon (radio, display, stepper, button).
pub struct DeviceServiceClient {
    client: Client,
    base_url: String,
    join_attempts: u32,
    join_interval: Duration,
    actuator: ActuatorRun,
}

impl DeviceServiceClient {
    // API endpoint constants
    const WIFI_CONNECT_ENDPOINT: &str = "/wifi/connect/v1";
    const WIFI_STATUS_ENDPOINT: &str = "/wifi/status/v1";
    const WIFI_SCAN_ENDPOINT: &str = "/wifi/scan/v1";
    const AP_START_ENDPOINT: &str = "/wifi/ap/start/v1";
    const AP_STOP_ENDPOINT: &str = "/wifi/ap/stop/v1";
    const DISPLAY_ENDPOINT: &str = "/display/v1";
    const ACTUATOR_ENDPOINT: &str = "/actuator/run/v1";
    const BUTTON_ENDPOINT: &str = "/button/v1";

    pub fn new(config: &DeviceServiceConfig) -> Result<Self> {
        Ok(DeviceServiceClient {
            client: device_client(config.request_timeout)?,
            base_url: config.url.clone(),
            join_attempts: config.join_attempts.max(1),
            join_interval: config.join_interval,
            actuator: ActuatorRun {
                steps: config.actuator_steps,
                speed: config.actuator_speed,
            },
        })
    }

    fn build_url(&self, path: &str) -> String {
        let normalized_path = path.trim_start_matches('/');
        format!("{}/{normalized_path}", self.base_url)
    }

    fn get(&self, path: &str) -> Result<String> {
        let url = self.build_url(path);
        debug!("GET {url}");

        let res = self
            .client
            .get(&url)
            .send()
            .context(format!("failed to send GET request to {url}"))?;

        handle_http_response(res, &format!("GET {url}"))
    }

    fn post_json<T: Serialize>(&self, path: &str, body: &T) -> Result<String> {
        let url = self.build_url(path);
        debug!("POST {url}");

        let res = self
            .client
            .post(&url)
            .json(body)
            .send()
            .context(format!("failed to send POST request to {url}"))?;

        handle_http_response(res, &format!("POST {url}"))
    }

    fn post(&self, path: &str) -> Result<String> {
        let url = self.build_url(path);
        debug!("POST {url}");

        let res = self
            .client
            .post(&url)
            .send()
            .context(format!("failed to send POST request to {url}"))?;

        handle_http_response(res, &format!("POST {url}"))
    }

    fn wifi_status(&self) -> Result<WifiStatus> {
        let body = self.get(Self::WIFI_STATUS_ENDPOINT)?;
        parse_json_body(&body, Self::WIFI_STATUS_ENDPOINT)
    }
}

impl DeviceControl for DeviceServiceClient {
    fn join_network(&self, credentials: &Credentials) -> Result<JoinOutcome> {
        info!("joining network {}", credentials.ssid);

        self.post_json(Self::WIFI_CONNECT_ENDPOINT, credentials)
            .context("failed to start network join")?;

        for attempt in 1..=self.join_attempts {
            match self.wifi_status() {
                Ok(WifiStatus {
                    connected: true,
                    address: Some(address),
                }) => {
                    info!("joined {} after {attempt} polls", credentials.ssid);
                    return Ok(JoinOutcome::Joined { address });
                }
                Ok(status) => debug!("join poll {attempt}: {status:?}"),
                Err(e) => debug!("join poll {attempt} failed: {e:#}"),
            }

            sleep(self.join_interval);
        }

        info!(
            "giving up on {} after {} polls",
            credentials.ssid, self.join_attempts
        );
        Ok(JoinOutcome::Failed)
    }

    fn start_setup_network(&self, ssid: &str, password: &str) -> Result<()> {
        self.post_json(Self::AP_START_ENDPOINT, &ApConfig { ssid, password })
            .context("failed to start setup network")?;
        Ok(())
    }

    fn stop_setup_network(&self) -> Result<()> {
        self.post(Self::AP_STOP_ENDPOINT)
            .context("failed to stop setup network")?;
        Ok(())
    }

    fn scan_networks(&self) -> Result<Vec<VisibleNetwork>> {
        let body = self.get(Self::WIFI_SCAN_ENDPOINT)?;
        parse_json_body(&body, Self::WIFI_SCAN_ENDPOINT)
    }

    fn notify_operator(&self, lines: &[String]) {
        if let Err(e) = self.post_json(Self::DISPLAY_ENDPOINT, &DisplayLines { lines }) {
            error!("notify operator failed: {e:#}");
        }
    }

    fn trigger_actuator(&self) {
        if let Err(e) = self.post_json(Self::ACTUATOR_ENDPOINT, &self.actuator) {
            error!("trigger actuator failed: {e:#}");
        }
    }

    fn button_pressed(&self) -> bool {
        match self
            .get(Self::BUTTON_ENDPOINT)
            .and_then(|body| parse_json_body::<ButtonState>(&body, Self::BUTTON_ENDPOINT))
        {
            Ok(state) => state.pressed,
            Err(e) => {
                debug!("button poll failed: {e:#}");
                false
            }
        }
    }
}
