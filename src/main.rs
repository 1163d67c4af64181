use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};

use fleetd::adapters::docker::DockerAdapter;
use fleetd::adapters::ports::PortAllocator;
use fleetd::adapters::registry::{HttpRegistry, InMemoryRegistry, RegistryGateway};
use fleetd::adapters::runtime::ContainerRuntime;
use fleetd::api::facade::CloudApi;
use fleetd::api::server::ApiServer;
use fleetd::config::{AppConfig, FleetConfig};
use fleetd::core::controller::FleetController;
use fleetd::core::lifecycle::{FleetService, Subsystem};
use fleetd::telemetry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = AppConfig::load();
    telemetry::init(&cfg)?;

    info!(
        event = "SYSTEM_STARTUP",
        service.version = env!("CARGO_PKG_VERSION"),
        node.name = %cfg.node_name,
        env = %cfg.env,
        "fleetd booting"
    );

    let fleet_cfg = FleetConfig::from_file(&cfg.fleet_config)
        .with_context(|| format!("loading {}", cfg.fleet_config.display()))?;
    info!(
        event = "CONFIG_LOADED",
        groups = fleet_cfg.groups.len(),
        port_range = %fleet_cfg.port_range,
        interval_secs = fleet_cfg.check_interval.as_secs(),
        "Fleet config loaded"
    );

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerAdapter::new(
        &fleet_cfg.docker_host,
        fleet_cfg.local_ip.clone(),
        PortAllocator::new(fleet_cfg.port_range),
    )?);

    let registry: Arc<dyn RegistryGateway> = match &cfg.registry_url {
        Some(url) => {
            info!(event = "REGISTRY_REMOTE", url = %url, "Using proxy registry API");
            Arc::new(HttpRegistry::new(url)?)
        }
        None => {
            warn!(event = "REGISTRY_EMBEDDED", "REGISTRY_URL not set, using in-memory registry");
            Arc::new(InMemoryRegistry::new())
        }
    };

    let controller = FleetController::new(
        fleet_cfg.groups.clone(),
        runtime,
        registry,
        fleet_cfg.controller_settings(),
    );

    let fleet = FleetService::new(controller.clone(), fleet_cfg.check_interval);
    let api = ApiServer::new(format!("{}:{}", cfg.host, cfg.http_port), CloudApi::new(controller));

    fleet.start().await?;
    if let Err(e) = api.start().await {
        error!(event = "SUBSYSTEM_START_FAILED", subsystem = api.name(), error = %e, "Start failed, tearing down");
        fleet.stop().await?;
        return Err(e);
    }

    shutdown_signal().await;
    info!(event = "SYSTEM_SHUTDOWN", "Shutdown signal received");

    let subsystems: [&dyn Subsystem; 2] = [&api, &fleet];
    let mut clean = true;
    for subsystem in subsystems {
        if let Err(e) = subsystem.stop().await {
            error!(event = "SUBSYSTEM_STOP_FAILED", subsystem = subsystem.name(), error = %e, "Stop failed");
            clean = false;
        }
    }

    if !clean {
        anyhow::bail!("shutdown incomplete");
    }
    info!(event = "SYSTEM_STOPPED", "fleetd stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(event = "SIGNAL_HANDLER_FAILED", error = %e, "Ctrl-C handler failed");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(event = "SIGNAL_HANDLER_FAILED", error = %e, "SIGTERM handler failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
