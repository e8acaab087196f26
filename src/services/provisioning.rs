//! Provisioning orchestration
//!
//! Drives the mode state machine from inbound requests and the polling tick.
//! All state of a boot cycle (mode, device token, attempt record and window)
//! lives in one [`ProvisioningService`]; callers serialize access to it.

use crate::{
    device_service_client::{Credentials, DeviceControl, JoinOutcome, VisibleNetwork},
    error::{ProvisioningError, ProvisioningResult},
    server_control::{RestartReason, RestartSignal},
    services::{
        access::AccessController,
        limiter::{self, AttemptLimiter},
        mode::{Mode, ModeChange, ModeEvent, ModeStateMachine},
        secret::{self, BootSecrets, DeviceToken, SecretGenerator, SetupPassword},
        window::{self, ProvisioningWindow},
    },
};
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_valid::Validate;
use std::{
    collections::HashSet,
    net::IpAddr,
    str::FromStr,
    sync::Arc,
    time::{Duration, Instant},
};
use thiserror::Error;

/// Whether the device token survives the switch to operational mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TokenPolicy {
    /// One token per boot cycle, shared by setup and operational mode.
    #[default]
    Shared,
    /// Issue a fresh token once the device is operational.
    RotateOnOperational,
}

#[derive(Debug, Error)]
#[error("unknown token policy '{0}', expected 'shared' or 'rotate'")]
pub struct UnknownTokenPolicy(String);

impl FromStr for TokenPolicy {
    type Err = UnknownTokenPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "shared" => Ok(TokenPolicy::Shared),
            "rotate" | "rotate-on-operational" => Ok(TokenPolicy::RotateOnOperational),
            _ => Err(UnknownTokenPolicy(s.to_string())),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ProvisioningSettings {
    pub setup_ssid: String,
    pub password_length: usize,
    pub token_length: usize,
    pub window_budget: Duration,
    pub attempt_window: Duration,
    pub max_attempts: u32,
    pub token_policy: TokenPolicy,
}

impl Default for ProvisioningSettings {
    fn default() -> Self {
        Self {
            setup_ssid: "MTG_Scanner_Setup".to_string(),
            password_length: secret::DEFAULT_PASSWORD_LENGTH,
            token_length: secret::DEFAULT_TOKEN_LENGTH,
            window_budget: window::DEFAULT_BUDGET,
            attempt_window: limiter::DEFAULT_WINDOW,
            max_attempts: limiter::DEFAULT_MAX_ATTEMPTS,
            token_policy: TokenPolicy::Shared,
        }
    }
}

/// Accepted credentials waiting for the join worker.
#[derive(Debug)]
pub struct JoinTicket {
    pub id: u64,
    pub credentials: Credentials,
}

/// Snapshot for status pages and the polling endpoint. Never carries secrets.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortalStatus {
    pub mode: Mode,
    pub setup_ssid: String,
    pub remaining_secs: u64,
    pub network: Option<String>,
    pub address: Option<IpAddr>,
    pub restarting: bool,
}

/// What the index page needs to render.
#[derive(Clone, Debug)]
pub struct PortalView {
    pub status: PortalStatus,
    /// Only set while provisioning is open; the setup form carries it.
    pub setup_token: Option<String>,
}

pub struct ProvisioningService<D: DeviceControl> {
    device: Arc<D>,
    settings: ProvisioningSettings,
    secrets: SecretGenerator,
    setup_password: SetupPassword,
    access: AccessController,
    limiter: AttemptLimiter,
    window: ProvisioningWindow,
    mode: ModeStateMachine,
    restart: RestartSignal,
    next_ticket: u64,
    pending_ticket: Option<u64>,
    network: Option<String>,
    address: Option<IpAddr>,
    restarting: bool,
}

impl<D: DeviceControl> ProvisioningService<D> {
    /// Start a boot cycle: issue secrets, open the window and bring up the
    /// setup network.
    pub fn boot(
        device: Arc<D>,
        settings: ProvisioningSettings,
        mut secrets: SecretGenerator,
        restart: RestartSignal,
        now: Instant,
    ) -> ProvisioningResult<Self> {
        let boot = secrets.boot_secrets(settings.password_length, settings.token_length);
        Self::boot_with_secrets(device, settings, secrets, boot, restart, now)
    }

    /// Like [`ProvisioningService::boot`] with externally issued secrets.
    pub fn boot_with_secrets(
        device: Arc<D>,
        settings: ProvisioningSettings,
        secrets: SecretGenerator,
        boot: BootSecrets,
        restart: RestartSignal,
        now: Instant,
    ) -> ProvisioningResult<Self> {
        device.start_setup_network(&settings.setup_ssid, boot.setup_password.as_str())?;

        info!(
            "setup network {} started, setup expires in {}s",
            settings.setup_ssid,
            settings.window_budget.as_secs()
        );
        debug!(
            "setup password: {}, device token: {}",
            boot.setup_password.as_str(),
            boot.device_token.as_str()
        );

        let service = Self {
            limiter: AttemptLimiter::new(settings.attempt_window, settings.max_attempts, now),
            window: ProvisioningWindow::start(now, settings.window_budget),
            access: AccessController::new(boot.device_token),
            setup_password: boot.setup_password,
            mode: ModeStateMachine::default(),
            device,
            settings,
            secrets,
            restart,
            next_ticket: 0,
            pending_ticket: None,
            network: None,
            address: None,
            restarting: false,
        };

        service.notify(&[
            "SECURE Setup".to_string(),
            format!("Pass:{}", service.setup_password.as_str()),
            format!("{}min timeout", service.settings.window_budget.as_secs() / 60),
        ]);

        Ok(service)
    }

    pub fn mode(&self) -> Mode {
        self.mode.mode()
    }

    pub fn history(&self) -> &[ModeChange] {
        self.mode.history()
    }

    pub fn device(&self) -> Arc<D> {
        Arc::clone(&self.device)
    }

    /// Current device token, for operator-facing channels only.
    pub fn device_token(&self) -> &DeviceToken {
        self.access.token()
    }

    pub fn is_restarting(&self) -> bool {
        self.restarting
    }

    /// Accept network credentials and hand out a join ticket.
    ///
    /// The attempt is counted before the token is checked, so a flood of bad
    /// tokens exhausts the window just like a flood of good ones.
    pub fn submit_credentials(
        &mut self,
        token: &str,
        credentials: Credentials,
        now: Instant,
    ) -> ProvisioningResult<JoinTicket> {
        self.check_deadline(now)?;

        if !self.limiter.allow(now) {
            let retry_after = self.limiter.retry_after(now);
            warn!("credential submission rate limited");
            return Err(ProvisioningError::RateLimited {
                retry_after_secs: ceil_secs(retry_after),
            });
        }
        self.limiter.record_attempt(now);

        let mode = self.mode.mode();

        if !self.access.validate(token, mode) {
            warn!("credential submission with invalid token");
            return Err(ProvisioningError::Unauthorized);
        }

        if !mode.is_provisioning_open() {
            return Err(ProvisioningError::InvalidState(mode));
        }

        if credentials.ssid.is_empty() {
            return Err(ProvisioningError::InvalidInput("WiFi name required".to_string()));
        }
        credentials
            .validate()
            .map_err(|e| ProvisioningError::InvalidInput(e.to_string()))?;

        self.mode.apply(ModeEvent::CredentialsAccepted, now)?;

        self.next_ticket += 1;
        self.pending_ticket = Some(self.next_ticket);
        self.network = Some(credentials.ssid.clone());
        self.address = None;

        info!("credentials accepted for {}", credentials.ssid);
        self.notify(&["Connecting...".to_string(), credentials.ssid.clone()]);

        Ok(JoinTicket {
            id: self.next_ticket,
            credentials,
        })
    }

    /// Apply the result of the join worker for `ticket`.
    ///
    /// A failed join is recovered here: the setup network comes back and new
    /// credentials are accepted. Results for superseded tickets are dropped.
    pub fn complete_join(
        &mut self,
        ticket: u64,
        outcome: anyhow::Result<JoinOutcome>,
        now: Instant,
    ) -> ProvisioningResult<Mode> {
        if self.restarting {
            debug!("ignoring join result {ticket} while restarting");
            return Err(ProvisioningError::Restarting);
        }

        if self.pending_ticket != Some(ticket) {
            warn!("ignoring stale join result {ticket}");
            return Ok(self.mode.mode());
        }
        self.pending_ticket = None;

        let ssid = self.network.clone().unwrap_or_default();

        let address = match outcome {
            Ok(JoinOutcome::Joined { address }) => address,
            Ok(JoinOutcome::Failed) => return self.fall_back(ssid, now),
            Err(e) => {
                error!("join worker failed: {e:#}");
                return self.fall_back(ssid, now);
            }
        };

        self.mode.apply(ModeEvent::JoinSucceeded, now)?;
        self.address = Some(address);

        info!("joined {ssid} with address {address}, setup mode disabled");

        let mut lines = vec![
            "Connected!".to_string(),
            address.to_string(),
            "Token required".to_string(),
        ];

        if self.settings.token_policy == TokenPolicy::RotateOnOperational {
            let token = self.secrets.device_token(self.settings.token_length);
            lines.push(format!("Token:{}", token.as_str()));
            self.access.rotate(token);
        }

        self.notify(&lines);

        Ok(Mode::Operational)
    }

    /// Run the actuator on behalf of an authorized request.
    pub fn trigger_privileged_action(&mut self, token: &str, now: Instant) -> ProvisioningResult<()> {
        self.check_deadline(now)?;

        if !self.access.validate(token, self.mode.mode()) {
            warn!("actuator request with invalid token");
            return Err(ProvisioningError::Unauthorized);
        }

        info!("actuator triggered via http");
        self.notify(&["HTTP Trigger!".to_string()]);
        self.device.trigger_actuator();
        self.notify(&["Done!".to_string()]);

        Ok(())
    }

    /// End the boot cycle on behalf of an authorized request.
    pub fn request_reset(&mut self, token: &str, now: Instant) -> ProvisioningResult<()> {
        self.check_deadline(now)?;

        if !self.access.validate(token, self.mode.mode()) {
            warn!("reset request with invalid token");
            return Err(ProvisioningError::Unauthorized);
        }

        self.force_restart(
            RestartReason::ResetRequested,
            &["WiFi Reset".to_string(), "Rebooting...".to_string()],
        );

        Ok(())
    }

    /// Polling tick: enforces the provisioning deadline.
    pub fn tick(&mut self, now: Instant) -> ProvisioningResult<()> {
        self.check_deadline(now)
    }

    /// Physical button on the device. Presence at the device stands in for
    /// the token.
    pub fn press_button(&mut self, now: Instant) -> ProvisioningResult<()> {
        self.check_deadline(now)?;

        info!("button pressed, running actuator");
        self.notify(&["Button Pushed!".to_string()]);
        self.device.trigger_actuator();

        Ok(())
    }

    /// Visible networks, strongest first. Only while provisioning is open.
    pub fn scan_networks(&mut self, now: Instant) -> ProvisioningResult<Vec<VisibleNetwork>> {
        self.check_deadline(now)?;

        let mode = self.mode.mode();
        if !mode.is_provisioning_open() {
            return Err(ProvisioningError::InvalidState(mode));
        }

        let mut networks = self.device.scan_networks()?;
        networks.retain(|network| !network.ssid.is_empty());
        networks.sort_by(|a, b| b.rssi.cmp(&a.rssi));

        // strongest access point per network name
        let mut seen = HashSet::new();
        networks.retain(|network| seen.insert(network.ssid.clone()));

        Ok(networks)
    }

    /// Snapshot for the polling endpoint. Still enforces the deadline, but a
    /// pending restart is reported instead of returned as an error.
    pub fn status(&mut self, now: Instant) -> PortalStatus {
        if let Err(e) = self.check_deadline(now) {
            debug!("status during shutdown: {e}");
        }

        PortalStatus {
            mode: self.mode.mode(),
            setup_ssid: self.settings.setup_ssid.clone(),
            remaining_secs: self.window.remaining(now).as_secs(),
            network: self.network.clone(),
            address: self.address,
            restarting: self.restarting,
        }
    }

    /// Everything the index page shows.
    pub fn view(&mut self, now: Instant) -> ProvisioningResult<PortalView> {
        self.check_deadline(now)?;

        let status = self.status(now);
        let setup_token = status
            .mode
            .is_provisioning_open()
            .then(|| self.access.token().as_str().to_string());

        Ok(PortalView {
            status,
            setup_token,
        })
    }

    /// Fails once a restart is pending and forces one when the window ran out
    /// before the device became operational.
    fn check_deadline(&mut self, now: Instant) -> ProvisioningResult<()> {
        if self.restarting {
            return Err(ProvisioningError::Restarting);
        }

        if self.mode.mode() != Mode::Operational && self.window.expired(now) {
            warn!(
                "setup window of {}s expired in {} mode",
                self.window.budget().as_secs(),
                self.mode.mode()
            );
            self.force_restart(
                RestartReason::WindowExpired,
                &["Setup Timeout".to_string(), "Rebooting...".to_string()],
            );
            return Err(ProvisioningError::WindowExpired);
        }

        Ok(())
    }

    fn fall_back(&mut self, ssid: String, now: Instant) -> ProvisioningResult<Mode> {
        self.mode.apply(ModeEvent::JoinFailed, now)?;
        self.network = None;

        warn!("{}, reopening setup network", ProvisioningError::JoinFailed { ssid });

        if let Err(e) = self
            .device
            .start_setup_network(&self.settings.setup_ssid, self.setup_password.as_str())
        {
            error!("failed to restart setup network: {e:#}");
        }

        self.notify(&[
            "WiFi Failed!".to_string(),
            "Check settings".to_string(),
            self.settings.setup_ssid.clone(),
        ]);

        Ok(Mode::SetupFallback)
    }

    fn force_restart(&mut self, reason: RestartReason, lines: &[String]) {
        self.restarting = true;
        self.pending_ticket = None;
        self.notify(lines);
        self.restart.trigger(reason);
    }

    fn notify(&self, lines: &[String]) {
        self.device.notify_operator(lines);
    }
}

fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs() + u64::from(duration.subsec_nanos() > 0);
    secs.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_service_client::MockDeviceControl;
    use std::{net::Ipv4Addr, sync::Mutex};
    use tokio::sync::broadcast::{Receiver, error::TryRecvError};

    const TOKEN: &str = "AB12CD34EF56";
    const PASSWORD: &str = "PW12QR34";

    fn mock_device(actuator_calls: usize) -> MockDeviceControl {
        let mut device = MockDeviceControl::new();
        device
            .expect_start_setup_network()
            .returning(|_, _| Ok(()));
        device.expect_stop_setup_network().returning(|| Ok(()));
        device.expect_notify_operator().return_const(());
        device
            .expect_trigger_actuator()
            .times(actuator_calls)
            .return_const(());
        device
    }

    fn boot_secrets() -> BootSecrets {
        BootSecrets {
            setup_password: SetupPassword::new(PASSWORD).unwrap(),
            device_token: DeviceToken::new(TOKEN).unwrap(),
        }
    }

    fn boot_with(
        device: MockDeviceControl,
        settings: ProvisioningSettings,
        now: Instant,
    ) -> (ProvisioningService<MockDeviceControl>, Receiver<RestartReason>) {
        let (restart, rx) = RestartSignal::channel();
        let service = ProvisioningService::boot_with_secrets(
            Arc::new(device),
            settings,
            SecretGenerator::seeded(3),
            boot_secrets(),
            restart,
            now,
        )
        .unwrap();

        (service, rx)
    }

    fn boot(
        device: MockDeviceControl,
        now: Instant,
    ) -> (ProvisioningService<MockDeviceControl>, Receiver<RestartReason>) {
        boot_with(device, ProvisioningSettings::default(), now)
    }

    fn home() -> Credentials {
        Credentials {
            ssid: "Home".to_string(),
            password: "secret".to_string(),
        }
    }

    fn joined() -> anyhow::Result<JoinOutcome> {
        Ok(JoinOutcome::Joined {
            address: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 42)),
        })
    }

    #[test]
    fn boot_starts_setup_network_with_generated_password() {
        let mut device = MockDeviceControl::new();
        device
            .expect_start_setup_network()
            .withf(|ssid, password| {
                ssid == "MTG_Scanner_Setup"
                    && password.len() == 8
                    && password.chars().all(|c| c.is_ascii_alphanumeric())
            })
            .times(1)
            .returning(|_, _| Ok(()));
        device.expect_notify_operator().return_const(());

        let (restart, _rx) = RestartSignal::channel();
        let service = ProvisioningService::boot(
            Arc::new(device),
            ProvisioningSettings::default(),
            SecretGenerator::seeded(9),
            restart,
            Instant::now(),
        )
        .unwrap();

        assert_eq!(service.mode(), Mode::Setup);
        assert_eq!(service.device_token().as_str().len(), 12);
    }

    #[test]
    fn boot_fails_when_setup_network_cannot_start() {
        let mut device = MockDeviceControl::new();
        device
            .expect_start_setup_network()
            .returning(|_, _| Err(anyhow::anyhow!("radio busy")));

        let (restart, _rx) = RestartSignal::channel();
        let result = ProvisioningService::boot(
            Arc::new(device),
            ProvisioningSettings::default(),
            SecretGenerator::seeded(9),
            restart,
            Instant::now(),
        );

        assert!(matches!(result, Err(ProvisioningError::Device(_))));
    }

    #[test]
    fn valid_submission_and_join_success_becomes_operational() {
        let now = Instant::now();
        let (mut service, _rx) = boot(mock_device(0), now);

        let ticket = service.submit_credentials(TOKEN, home(), now).unwrap();
        assert_eq!(service.mode(), Mode::Connecting);
        assert_eq!(ticket.credentials.ssid, "Home");

        let mode = service.complete_join(ticket.id, joined(), now).unwrap();

        assert_eq!(mode, Mode::Operational);
        assert_eq!(service.mode(), Mode::Operational);
        assert_eq!(
            service.status(now).address,
            Some(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 42)))
        );
    }

    #[test]
    fn join_failure_reopens_setup_network() {
        let now = Instant::now();
        let mut device = MockDeviceControl::new();
        device
            .expect_start_setup_network()
            .withf(|ssid, password| ssid == "MTG_Scanner_Setup" && password == PASSWORD)
            .times(2)
            .returning(|_, _| Ok(()));
        device.expect_notify_operator().return_const(());
        let (mut service, _rx) = boot(device, now);

        let ticket = service.submit_credentials(TOKEN, home(), now).unwrap();
        let mode = service
            .complete_join(ticket.id, Ok(JoinOutcome::Failed), now)
            .unwrap();

        assert_eq!(mode, Mode::SetupFallback);
        assert!(service.status(now).network.is_none());
    }

    #[test]
    fn join_worker_error_counts_as_failure() {
        let now = Instant::now();
        let (mut service, _rx) = boot(mock_device(0), now);

        let ticket = service.submit_credentials(TOKEN, home(), now).unwrap();
        let mode = service
            .complete_join(ticket.id, Err(anyhow::anyhow!("daemon unreachable")), now)
            .unwrap();

        assert_eq!(mode, Mode::SetupFallback);
    }

    #[test]
    fn fallback_accepts_new_credentials() {
        let now = Instant::now();
        let (mut service, _rx) = boot(mock_device(0), now);

        let first = service.submit_credentials(TOKEN, home(), now).unwrap();
        service
            .complete_join(first.id, Ok(JoinOutcome::Failed), now)
            .unwrap();

        let second = service
            .submit_credentials(TOKEN, home(), now + Duration::from_secs(1))
            .unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(service.mode(), Mode::Connecting);
    }

    #[test]
    fn invalid_token_never_changes_mode() {
        let now = Instant::now();
        let (mut service, _rx) = boot(mock_device(0), now);

        for token in ["", "WRONGTOKEN12", "ab12cd34ef56"] {
            let result = service.submit_credentials(token, home(), now);
            assert!(matches!(result, Err(ProvisioningError::Unauthorized)));
        }

        assert_eq!(service.mode(), Mode::Setup);
        assert!(service.history().is_empty());
    }

    #[test]
    fn empty_network_name_is_rejected() {
        let now = Instant::now();
        let (mut service, _rx) = boot(mock_device(0), now);

        let credentials = Credentials {
            ssid: String::new(),
            password: "secret".to_string(),
        };
        let result = service.submit_credentials(TOKEN, credentials, now);

        assert!(matches!(result, Err(ProvisioningError::InvalidInput(_))));
        assert_eq!(service.mode(), Mode::Setup);
    }

    #[test]
    fn fourth_submission_in_window_is_rate_limited_regardless_of_token() {
        let now = Instant::now();
        let (mut service, _rx) = boot(mock_device(0), now);

        let first = service.submit_credentials(TOKEN, home(), now);
        assert!(first.is_ok());

        let second = service.submit_credentials("WRONGTOKEN12", home(), now + Duration::from_secs(1));
        assert!(matches!(second, Err(ProvisioningError::Unauthorized)));

        let third = service.submit_credentials(TOKEN, home(), now + Duration::from_secs(2));
        assert!(matches!(
            third,
            Err(ProvisioningError::InvalidState(Mode::Connecting))
        ));

        for token in [TOKEN, "WRONGTOKEN12"] {
            let fourth = service.submit_credentials(token, home(), now + Duration::from_secs(4));
            assert!(matches!(
                fourth,
                Err(ProvisioningError::RateLimited {
                    retry_after_secs: 6
                })
            ));
        }
    }

    #[test]
    fn submissions_resume_after_rate_limit_window() {
        let now = Instant::now();
        let (mut service, _rx) = boot(mock_device(0), now);

        for offset in 0..3 {
            let _ = service.submit_credentials("WRONGTOKEN12", home(), now + Duration::from_secs(offset));
        }
        assert!(matches!(
            service.submit_credentials(TOKEN, home(), now + Duration::from_secs(5)),
            Err(ProvisioningError::RateLimited { .. })
        ));

        let later = now + Duration::from_secs(10);
        assert!(service.submit_credentials(TOKEN, home(), later).is_ok());
    }

    #[test]
    fn submission_in_operational_mode_is_rejected() {
        let now = Instant::now();
        let (mut service, _rx) = boot(mock_device(0), now);

        let ticket = service.submit_credentials(TOKEN, home(), now).unwrap();
        service.complete_join(ticket.id, joined(), now).unwrap();

        let result = service.submit_credentials(TOKEN, home(), now + Duration::from_secs(20));
        assert!(matches!(
            result,
            Err(ProvisioningError::InvalidState(Mode::Operational))
        ));
    }

    #[test]
    fn stale_join_result_is_ignored() {
        let now = Instant::now();
        let (mut service, _rx) = boot(mock_device(0), now);

        let ticket = service.submit_credentials(TOKEN, home(), now).unwrap();
        let mode = service.complete_join(ticket.id + 7, joined(), now).unwrap();

        assert_eq!(mode, Mode::Connecting);
        assert_eq!(service.mode(), Mode::Connecting);
    }

    #[test]
    fn each_authorized_trigger_runs_actuator_once() {
        let now = Instant::now();
        let (mut service, _rx) = boot(mock_device(3), now);

        for offset in 0..3 {
            service
                .trigger_privileged_action(TOKEN, now + Duration::from_secs(offset))
                .unwrap();
        }
    }

    #[test]
    fn unauthorized_trigger_never_runs_actuator() {
        let now = Instant::now();
        let (mut service, _rx) = boot(mock_device(0), now);

        for token in ["", "WRONGTOKEN12"] {
            assert!(matches!(
                service.trigger_privileged_action(token, now),
                Err(ProvisioningError::Unauthorized)
            ));
        }
    }

    #[test]
    fn trigger_works_in_operational_mode_with_same_token() {
        let now = Instant::now();
        let (mut service, _rx) = boot(mock_device(1), now);

        let ticket = service.submit_credentials(TOKEN, home(), now).unwrap();
        service.complete_join(ticket.id, joined(), now).unwrap();

        service
            .trigger_privileged_action(TOKEN, now + Duration::from_secs(700))
            .unwrap();
    }

    #[test]
    fn rotation_policy_replaces_token_on_operational() {
        let now = Instant::now();
        let shown = Arc::new(Mutex::new(Vec::<Vec<String>>::new()));
        let recorder = Arc::clone(&shown);

        let mut device = MockDeviceControl::new();
        device.expect_start_setup_network().returning(|_, _| Ok(()));
        device.expect_stop_setup_network().returning(|| Ok(()));
        device
            .expect_notify_operator()
            .returning(move |lines| recorder.lock().unwrap().push(lines.to_vec()));
        device.expect_trigger_actuator().times(1).return_const(());

        let settings = ProvisioningSettings {
            token_policy: TokenPolicy::RotateOnOperational,
            ..Default::default()
        };
        let (mut service, _rx) = boot_with(device, settings, now);

        let ticket = service.submit_credentials(TOKEN, home(), now).unwrap();
        service.complete_join(ticket.id, joined(), now).unwrap();

        let rotated = service.device_token().as_str().to_string();
        assert_ne!(rotated, TOKEN);
        assert!(matches!(
            service.trigger_privileged_action(TOKEN, now),
            Err(ProvisioningError::Unauthorized)
        ));
        service.trigger_privileged_action(&rotated, now).unwrap();

        let shown = shown.lock().unwrap();
        assert!(
            shown
                .iter()
                .any(|lines| lines.contains(&format!("Token:{rotated}")))
        );
    }

    #[test]
    fn window_expiry_in_setup_forces_restart() {
        let now = Instant::now();
        let (mut service, mut rx) = boot(mock_device(0), now);

        assert!(service.tick(now + Duration::from_secs(599)).is_ok());
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        let result = service.tick(now + Duration::from_secs(601));

        assert!(matches!(result, Err(ProvisioningError::WindowExpired)));
        assert_eq!(rx.try_recv().unwrap(), RestartReason::WindowExpired);
        assert!(service.is_restarting());
    }

    #[test]
    fn expired_window_blocks_submission_and_restarts_once() {
        let now = Instant::now();
        let (mut service, mut rx) = boot(mock_device(0), now);
        let late = now + Duration::from_secs(600);

        assert!(matches!(
            service.submit_credentials(TOKEN, home(), late),
            Err(ProvisioningError::WindowExpired)
        ));
        assert!(matches!(
            service.submit_credentials(TOKEN, home(), late),
            Err(ProvisioningError::Restarting)
        ));
        assert!(matches!(
            service.trigger_privileged_action(TOKEN, late),
            Err(ProvisioningError::Restarting)
        ));

        assert_eq!(rx.try_recv().unwrap(), RestartReason::WindowExpired);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn window_expiry_while_connecting_restarts_and_drops_late_join() {
        let now = Instant::now();
        let (mut service, mut rx) = boot(mock_device(0), now);

        let ticket = service
            .submit_credentials(TOKEN, home(), now + Duration::from_secs(590))
            .unwrap();
        assert_eq!(service.mode(), Mode::Connecting);

        let result = service.tick(now + Duration::from_secs(600));

        assert!(matches!(result, Err(ProvisioningError::WindowExpired)));
        assert_eq!(rx.try_recv().unwrap(), RestartReason::WindowExpired);
        assert!(matches!(
            service.complete_join(ticket.id, joined(), now + Duration::from_secs(605)),
            Err(ProvisioningError::Restarting)
        ));
        assert_eq!(service.mode(), Mode::Connecting);
        assert!(service.status(now + Duration::from_secs(605)).address.is_none());
    }

    #[test]
    fn scan_keeps_strongest_entry_when_duplicates_are_not_adjacent() {
        let now = Instant::now();
        let mut device = mock_device(0);
        device.expect_scan_networks().returning(|| {
            Ok(vec![
                VisibleNetwork {
                    ssid: "Home".to_string(),
                    rssi: -40,
                },
                VisibleNetwork {
                    ssid: "Cafe".to_string(),
                    rssi: -50,
                },
                VisibleNetwork {
                    ssid: "Home".to_string(),
                    rssi: -60,
                },
            ])
        });
        let (mut service, _rx) = boot(device, now);

        let networks = service.scan_networks(now).unwrap();

        assert_eq!(
            networks,
            vec![
                VisibleNetwork {
                    ssid: "Home".to_string(),
                    rssi: -40,
                },
                VisibleNetwork {
                    ssid: "Cafe".to_string(),
                    rssi: -50,
                },
            ]
        );
    }

    #[test]
    fn window_expiry_in_fallback_still_restarts() {
        let now = Instant::now();
        let (mut service, mut rx) = boot(mock_device(0), now);

        let ticket = service.submit_credentials(TOKEN, home(), now).unwrap();
        service
            .complete_join(ticket.id, Ok(JoinOutcome::Failed), now)
            .unwrap();

        assert!(service.tick(now + Duration::from_secs(610)).is_err());
        assert_eq!(rx.try_recv().unwrap(), RestartReason::WindowExpired);
    }

    #[test]
    fn operational_mode_is_not_bound_by_window() {
        let now = Instant::now();
        let (mut service, mut rx) = boot(mock_device(0), now);

        let ticket = service.submit_credentials(TOKEN, home(), now).unwrap();
        service.complete_join(ticket.id, joined(), now).unwrap();

        assert!(service.tick(now + Duration::from_secs(3_600)).is_ok());
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn authorized_reset_restarts() {
        let now = Instant::now();
        let (mut service, mut rx) = boot(mock_device(0), now);

        assert!(matches!(
            service.request_reset("WRONGTOKEN12", now),
            Err(ProvisioningError::Unauthorized)
        ));
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        service.request_reset(TOKEN, now).unwrap();

        assert_eq!(rx.try_recv().unwrap(), RestartReason::ResetRequested);
        assert!(matches!(
            service.tick(now),
            Err(ProvisioningError::Restarting)
        ));
    }

    #[test]
    fn join_result_after_restart_is_ignored() {
        let now = Instant::now();
        let (mut service, _rx) = boot(mock_device(0), now);

        let ticket = service.submit_credentials(TOKEN, home(), now).unwrap();
        service.request_reset(TOKEN, now).unwrap();

        assert!(matches!(
            service.complete_join(ticket.id, joined(), now),
            Err(ProvisioningError::Restarting)
        ));
        assert_eq!(service.mode(), Mode::Connecting);
    }

    #[test]
    fn button_runs_actuator_without_token() {
        let now = Instant::now();
        let (mut service, _rx) = boot(mock_device(1), now);

        service.press_button(now).unwrap();
    }

    #[test]
    fn scan_sorts_by_signal_and_drops_duplicates() {
        let now = Instant::now();
        let mut device = mock_device(0);
        device.expect_scan_networks().returning(|| {
            Ok(vec![
                VisibleNetwork {
                    ssid: "Cafe".to_string(),
                    rssi: -80,
                },
                VisibleNetwork {
                    ssid: "Home".to_string(),
                    rssi: -40,
                },
                VisibleNetwork {
                    ssid: String::new(),
                    rssi: -30,
                },
                VisibleNetwork {
                    ssid: "Home".to_string(),
                    rssi: -60,
                },
            ])
        });
        let (mut service, _rx) = boot(device, now);

        let networks = service.scan_networks(now).unwrap();
        let names: Vec<_> = networks.iter().map(|n| n.ssid.as_str()).collect();

        assert_eq!(names, vec!["Home", "Cafe"]);
        assert_eq!(networks[0].rssi, -40);
    }

    #[test]
    fn view_exposes_token_only_while_provisioning_is_open() {
        let now = Instant::now();
        let (mut service, _rx) = boot(mock_device(0), now);

        let view = service.view(now).unwrap();
        assert_eq!(view.setup_token.as_deref(), Some(TOKEN));
        assert_eq!(view.status.remaining_secs, 600);

        let ticket = service.submit_credentials(TOKEN, home(), now).unwrap();
        assert!(service.view(now).unwrap().setup_token.is_none());

        service.complete_join(ticket.id, joined(), now).unwrap();
        assert!(service.view(now).unwrap().setup_token.is_none());
    }

    #[test]
    fn token_policy_parses_from_config_values() {
        assert_eq!("shared".parse::<TokenPolicy>().unwrap(), TokenPolicy::Shared);
        assert_eq!(
            "Rotate".parse::<TokenPolicy>().unwrap(),
            TokenPolicy::RotateOnOperational
        );
        assert!("sometimes".parse::<TokenPolicy>().is_err());
    }
}
