use actix_server::ServerHandle;
use actix_web::{App, HttpServer, web::Data};
use anyhow::{Context, Result};
use env_logger::{Builder, Env, Target};
use log::{debug, error, info};
use setup_portal::{
    api::Api,
    config::AppConfig,
    device_service_client::DeviceServiceClient,
    server_control::RestartSignal,
    services::{ProvisioningService, secret::SecretGenerator},
    supervisor::{PortalState, run_supervisor},
};
use std::{
    io::Write,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{
    signal::unix::{Signal, SignalKind, signal},
    time::sleep,
};

// lets the reset or timeout page reach the client before the server stops
const RESTART_GRACE: Duration = Duration::from_secs(2);

type PortalApi = Api<DeviceServiceClient>;

enum ShutdownReason {
    Restart,
    Shutdown,
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownReason::Restart => write!(f, "restarting provisioning"),
            ShutdownReason::Shutdown => write!(f, "shutting down"),
        }
    }
}

#[actix_web::main]
async fn main() {
    if let Err(e) = run().await {
        error!("application error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let started = Instant::now();

    initialize()?;

    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

    let device_config = AppConfig::get().device_service.clone();
    let device = tokio::task::spawn_blocking(move || DeviceServiceClient::new(&device_config))
        .await
        .context("failed to join device service client task")?
        .context("failed to create device service client")?;
    let device = Arc::new(device);

    while let ShutdownReason::Restart =
        run_until_shutdown(&device, started, &mut sigterm).await?
    {}

    Ok(())
}

fn initialize() -> Result<()> {
    log_panics::init();

    let mut builder = if cfg!(debug_assertions) {
        Builder::from_env(Env::default().default_filter_or("debug"))
    } else {
        Builder::from_env(Env::default().default_filter_or("info"))
    };

    builder.format(|f, record| match record.level() {
        log::Level::Error => {
            eprintln!("{}", record.args());
            Ok(())
        }
        _ => {
            writeln!(f, "{}", record.args())
        }
    });

    builder.target(Target::Stdout).init();

    info!("module version: {}", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::load().context("failed to load configuration")?;
    debug!("configuration: {config:?}");

    Ok(())
}

/// One boot cycle: fresh secrets, setup network, portal and supervisor.
async fn run_until_shutdown(
    device: &Arc<DeviceServiceClient>,
    started: Instant,
    sigterm: &mut Signal,
) -> Result<ShutdownReason> {
    info!("starting provisioning cycle");

    let config = AppConfig::get();
    let (restart, mut restart_rx) = RestartSignal::channel();

    let boot_device = Arc::clone(device);
    let settings = config.provisioning.clone();
    let service = tokio::task::spawn_blocking(move || {
        ProvisioningService::boot(
            boot_device,
            settings,
            SecretGenerator::from_entropy(started),
            restart,
            Instant::now(),
        )
    })
    .await
    .context("failed to join boot task")?
    .context("failed to boot provisioning")?;

    let (state, events_rx) = PortalState::new(service, config.portal.host.clone());
    let supervisor = tokio::spawn(run_supervisor(
        state.clone(),
        events_rx,
        config.tick_interval,
    ));
    let (server_handle, server_task) = run_server(state)?;

    let reason = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            debug!("ctrl-c received");
            ShutdownReason::Shutdown
        },
        _ = sigterm.recv() => {
            debug!("SIGTERM received");
            ShutdownReason::Shutdown
        },
        restart = restart_rx.recv() => {
            match restart {
                Ok(restart) => debug!("restart requested: {restart}"),
                Err(e) => error!("restart channel failed: {e}"),
            }
            ShutdownReason::Restart
        },
        result = server_task => {
            match result {
                Ok(Ok(())) => debug!("server stopped normally"),
                Ok(Err(e)) => error!("server stopped with error: {e}"),
                Err(e) => error!("server task panicked: {e}"),
            }
            ShutdownReason::Shutdown
        },
    };

    info!("{reason}");

    if matches!(reason, ShutdownReason::Restart) {
        sleep(RESTART_GRACE).await;
    }

    supervisor.abort();
    server_handle.stop(true).await;

    if matches!(reason, ShutdownReason::Shutdown) {
        info!("shutdown complete");
    }

    Ok(reason)
}

fn run_server(
    state: PortalState<DeviceServiceClient>,
) -> Result<(
    ServerHandle,
    tokio::task::JoinHandle<Result<(), std::io::Error>>,
)> {
    let api = PortalApi::new(state);
    let port = AppConfig::get().portal.port;

    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(api.clone()))
            .configure(PortalApi::configure)
    })
    .bind(("0.0.0.0", port))
    .context("failed to bind server")?
    .disable_signals()
    .run();

    info!("portal listening on port {port}");

    Ok((server.handle(), tokio::spawn(server)))
}
