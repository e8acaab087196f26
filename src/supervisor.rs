//! Shared portal state and the background task driving it.
//!
//! Handlers and the supervisor share one [`ProvisioningService`] behind a
//! mutex. Collaborator calls block, so every access runs on the blocking
//! pool. The network join is the one long-running call: it runs without the
//! lock held and reports back through [`PortalEvent`].

use crate::{
    device_service_client::{DeviceControl, JoinOutcome},
    error::{ProvisioningError, ProvisioningResult},
    services::{ProvisioningService, provisioning::JoinTicket},
};
use log::{debug, info, warn};
use std::{
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};
use tokio::{
    sync::mpsc,
    time::{MissedTickBehavior, interval},
};

#[derive(Debug)]
pub enum PortalEvent {
    JoinFinished {
        ticket: u64,
        outcome: anyhow::Result<JoinOutcome>,
    },
}

pub struct PortalState<D: DeviceControl> {
    service: Arc<Mutex<ProvisioningService<D>>>,
    device: Arc<D>,
    events: mpsc::UnboundedSender<PortalEvent>,
    portal_host: String,
}

impl<D: DeviceControl> Clone for PortalState<D> {
    fn clone(&self) -> Self {
        Self {
            service: Arc::clone(&self.service),
            device: Arc::clone(&self.device),
            events: self.events.clone(),
            portal_host: self.portal_host.clone(),
        }
    }
}

impl<D: DeviceControl + 'static> PortalState<D> {
    pub fn new(
        service: ProvisioningService<D>,
        portal_host: impl Into<String>,
    ) -> (Self, mpsc::UnboundedReceiver<PortalEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();

        let state = Self {
            device: service.device(),
            service: Arc::new(Mutex::new(service)),
            events,
            portal_host: portal_host.into(),
        };

        (state, events_rx)
    }

    /// Address the captive portal answers on.
    pub fn portal_host(&self) -> &str {
        &self.portal_host
    }

    /// Lock the service on the current thread.
    ///
    /// Only for calls that never reach a collaborator.
    pub fn with_service<T>(&self, f: impl FnOnce(&mut ProvisioningService<D>) -> T) -> T {
        let mut service = self
            .service
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        f(&mut service)
    }

    /// Run `f` against the service on the blocking pool.
    ///
    /// `now` is taken after the lock is acquired so queued requests are
    /// judged by the time they actually run.
    pub async fn run<T, F>(&self, f: F) -> ProvisioningResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut ProvisioningService<D>, Instant) -> ProvisioningResult<T> + Send + 'static,
    {
        let service = Arc::clone(&self.service);

        tokio::task::spawn_blocking(move || {
            let mut service = service.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut service, Instant::now())
        })
        .await
        .map_err(|e| ProvisioningError::Device(anyhow::anyhow!("service task failed: {e}")))?
    }

    /// Hand accepted credentials to the join worker.
    pub fn dispatch_join(&self, ticket: JoinTicket) {
        let device = Arc::clone(&self.device);
        let events = self.events.clone();

        tokio::task::spawn_blocking(move || run_join(device.as_ref(), ticket, &events));
    }

    async fn button_pressed(&self) -> bool {
        let device = Arc::clone(&self.device);

        tokio::task::spawn_blocking(move || device.button_pressed())
            .await
            .unwrap_or_else(|e| {
                warn!("button poll task failed: {e}");
                false
            })
    }
}

fn run_join<D: DeviceControl>(
    device: &D,
    ticket: JoinTicket,
    events: &mpsc::UnboundedSender<PortalEvent>,
) {
    // the radio cannot host the setup network and join another one at once
    if let Err(e) = device.stop_setup_network() {
        warn!("failed to stop setup network: {e:#}");
    }

    let outcome = device.join_network(&ticket.credentials);

    if events
        .send(PortalEvent::JoinFinished {
            ticket: ticket.id,
            outcome,
        })
        .is_err()
    {
        debug!("join {} finished after portal shut down", ticket.id);
    }
}

/// Cooperative polling loop of one boot cycle.
///
/// Applies join results, enforces the provisioning deadline and reacts to
/// the physical button. Returns once a restart is pending.
pub async fn run_supervisor<D: DeviceControl + 'static>(
    state: PortalState<D>,
    mut events: mpsc::UnboundedReceiver<PortalEvent>,
    tick_interval: Duration,
) {
    let mut ticker = interval(tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut button_was_pressed = false;

    loop {
        let result = tokio::select! {
            Some(event) = events.recv() => match event {
                PortalEvent::JoinFinished { ticket, outcome } => state
                    .run(move |service, now| service.complete_join(ticket, outcome, now))
                    .await
                    .map(|mode| debug!("join {ticket} applied, mode is {mode}")),
            },
            _ = ticker.tick() => {
                match state.run(|service, now| service.tick(now)).await {
                    Ok(()) => {
                        let pressed = state.button_pressed().await;
                        let edge = pressed && !button_was_pressed;
                        button_was_pressed = pressed;

                        if edge {
                            state.run(|service, now| service.press_button(now)).await
                        } else {
                            Ok(())
                        }
                    }
                    Err(e) => Err(e),
                }
            },
        };

        match result {
            Ok(()) => {}
            Err(ProvisioningError::WindowExpired | ProvisioningError::Restarting) => {
                info!("supervisor stopped, restart pending");
                return;
            }
            Err(e) => warn!("supervisor: {e}"),
        }
    }
}
