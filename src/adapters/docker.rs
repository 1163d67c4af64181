use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    PruneContainersOptions, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerStateStatusEnum, HostConfig, PortBinding};
use bollard::Docker;
use futures_util::StreamExt;
use tracing::{debug, error, info, warn};

use crate::adapters::ports::{bound_ports, PortAllocator};
use crate::adapters::runtime::{ContainerRuntime, RuntimeError, RuntimeResult};
use crate::core::domain::{ContainerDescriptor, ContainerState, CreatedContainer, Endpoint};

const CONNECT_TIMEOUT_SECS: u64 = 120;
const STOP_GRACE_SECS: i64 = 10;

pub const LABEL_INSTANCE: &str = "fleetd.instance";
pub const LABEL_IMAGE: &str = "fleetd.image";

#[derive(Clone)]
pub struct DockerAdapter {
    client: Docker,
    local_ip: String,
    ports: PortAllocator,
}

impl DockerAdapter {
    /// `host` accepts `unix:///path`, a bare socket path, `tcp://host:port` or `http://host:port`.
    pub fn new(host: &str, local_ip: String, ports: PortAllocator) -> RuntimeResult<Self> {
        let client = connect(host)
            .or_else(|_| Docker::connect_with_local_defaults())
            .map_err(|e| RuntimeError::Unavailable(format!("docker connection failed: {e}")))?;

        info!(event = "DOCKER_CONNECTED", docker.host = %host, ports = %ports.range(), "Docker client ready");
        Ok(Self { client, local_ip, ports })
    }

    fn container_config(&self, image: &str, name: &str, port: u16) -> Config<String> {
        let exposed = format!("{port}/tcp");

        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(exposed.clone(), HashMap::new());

        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            exposed,
            Some(vec![PortBinding {
                host_ip: None,
                host_port: Some(port.to_string()),
            }]),
        );

        let mut labels = HashMap::new();
        labels.insert(LABEL_INSTANCE.to_string(), name.to_string());
        labels.insert(LABEL_IMAGE.to_string(), image.to_string());

        Config {
            image: Some(image.to_string()),
            env: Some(vec![format!("SERVER_PORT={port}")]),
            exposed_ports: Some(exposed_ports),
            labels: Some(labels),
            host_config: Some(HostConfig {
                port_bindings: Some(port_bindings),
                network_mode: Some("bridge".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    async fn create(&self, image: &str, name: &str, port: u16) -> RuntimeResult<String> {
        let container_name = format!("{name}_{port}");
        let options = || {
            Some(CreateContainerOptions {
                name: container_name.clone(),
                platform: None,
            })
        };

        match self
            .client
            .create_container(options(), self.container_config(image, name, port))
            .await
        {
            Ok(resp) => Ok(resp.id),
            Err(DockerError::DockerResponseServerError { status_code: 404, .. }) => {
                self.pull(image).await?;
                self.client
                    .create_container(options(), self.container_config(image, name, port))
                    .await
                    .map(|resp| resp.id)
                    .map_err(classify)
            }
            Err(e) => Err(classify(e)),
        }
    }

    async fn pull(&self, image: &str) -> RuntimeResult<()> {
        info!(event = "IMAGE_PULL", image = %image, "Pulling missing image");
        let mut stream = self.client.create_image(
            Some(CreateImageOptions {
                from_image: image.to_string(),
                ..Default::default()
            }),
            None,
            None,
        );

        while let Some(res) = stream.next().await {
            if let Err(e) = res {
                error!(event = "IMAGE_PULL_FAILED", image = %image, error = %e, "Image pull failed");
                return Err(classify(e));
            }
        }
        Ok(())
    }

    async fn start(&self, id: &str, port: u16) -> RuntimeResult<()> {
        match self
            .client
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(()),
            Err(DockerError::DockerResponseServerError { message, .. }) if is_port_conflict(&message) => {
                Err(RuntimeError::PortConflict(port))
            }
            Err(e) => Err(classify(e)),
        }
    }

    async fn inspect_status(&self, id: &str) -> RuntimeResult<Option<ContainerStateStatusEnum>> {
        let inspect = self
            .client
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(classify)?;
        Ok(inspect.state.and_then(|s| s.status))
    }
}

#[async_trait]
impl ContainerRuntime for DockerAdapter {
    async fn create_and_start(&self, image: &str, name: &str) -> RuntimeResult<CreatedContainer> {
        let range = self.ports.range();
        let mut tried = BTreeSet::new();

        loop {
            // Live query on every attempt: other processes create containers too.
            let bound = bound_ports(&self.list().await?);
            let lease = self
                .ports
                .reserve(&bound, &tried)
                .ok_or(RuntimeError::ResourceExhausted {
                    low: range.low,
                    high: range.high,
                })?;
            let port = lease.port();
            tried.insert(port);

            let id = self.create(image, name, port).await?;
            debug!(event = "CONTAINER_CREATED", instance = %name, container.id = %id, port, "Container created");

            match self.start(&id, port).await {
                Ok(()) => {
                    info!(event = "CONTAINER_STARTED", instance = %name, container.id = %id, port, "Container started");
                    return Ok(CreatedContainer {
                        id,
                        endpoint: Endpoint::new(self.local_ip.clone(), port),
                    });
                }
                Err(RuntimeError::PortConflict(port)) => {
                    warn!(event = "PORT_BIND_CONFLICT", instance = %name, port, "Port taken at bind time, trying next candidate");
                    if let Err(e) = self.remove(&id, true).await {
                        warn!(event = "CONTAINER_REMOVE_FAILED", container.id = %id, error = %e, "Could not discard half-created container");
                    }
                }
                Err(e) => {
                    if let Err(rm) = self.remove(&id, true).await {
                        warn!(event = "CONTAINER_REMOVE_FAILED", container.id = %id, error = %rm, "Could not discard half-created container");
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn stop(&self, id: &str) -> RuntimeResult<()> {
        match self
            .client
            .stop_container(id, Some(StopContainerOptions { t: STOP_GRACE_SECS }))
            .await
        {
            Ok(()) => Ok(()),
            // 304: already stopped, 404: already gone.
            Err(DockerError::DockerResponseServerError { status_code: 304 | 404, .. }) => Ok(()),
            Err(e) => Err(classify(e)),
        }
    }

    async fn remove(&self, id: &str, force: bool) -> RuntimeResult<()> {
        match self
            .client
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(DockerError::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
            Err(DockerError::DockerResponseServerError { status_code: 409, message })
                if message.contains("already in progress") =>
            {
                Ok(())
            }
            Err(e) => Err(classify(e)),
        }
    }

    async fn exists(&self, id: &str) -> RuntimeResult<bool> {
        match self.inspect_status(id).await {
            Ok(_) => Ok(true),
            Err(RuntimeError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn state(&self, id: &str) -> RuntimeResult<ContainerState> {
        Ok(map_status(self.inspect_status(id).await?))
    }

    async fn list(&self) -> RuntimeResult<Vec<ContainerDescriptor>> {
        let containers = self
            .client
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                ..Default::default()
            }))
            .await
            .map_err(classify)?;

        Ok(containers
            .into_iter()
            .map(|c| ContainerDescriptor {
                id: c.id.unwrap_or_default(),
                name: c
                    .names
                    .unwrap_or_default()
                    .first()
                    .cloned()
                    .unwrap_or_default()
                    .trim_start_matches('/')
                    .to_string(),
                image: c.image.unwrap_or_default(),
                state: ContainerState::from_status(c.state.as_deref().unwrap_or_default()),
                public_ports: c
                    .ports
                    .unwrap_or_default()
                    .iter()
                    .filter_map(|p| p.public_port)
                    .collect(),
            })
            .collect())
    }

    async fn prune(&self) {
        match self
            .client
            .prune_containers(None::<PruneContainersOptions<String>>)
            .await
        {
            Ok(resp) => {
                let deleted = resp.containers_deleted.map(|d| d.len()).unwrap_or(0);
                info!(
                    event = "CONTAINERS_PRUNED",
                    deleted,
                    space_reclaimed = resp.space_reclaimed.unwrap_or(0),
                    "Stopped containers pruned"
                );
            }
            Err(e) => {
                warn!(event = "CONTAINER_PRUNE_FAILED", error = %e, "Container prune failed");
            }
        }
    }
}

fn connect(host: &str) -> Result<Docker, DockerError> {
    if let Some(path) = host.strip_prefix("unix://") {
        Docker::connect_with_unix(path, CONNECT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
    } else if host.starts_with("tcp://") || host.starts_with("http://") {
        Docker::connect_with_http(host, CONNECT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
    } else {
        Docker::connect_with_unix(host, CONNECT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
    }
}

fn classify(err: DockerError) -> RuntimeError {
    match err {
        DockerError::DockerResponseServerError { status_code: 404, message } => {
            RuntimeError::NotFound(message)
        }
        DockerError::DockerResponseServerError { status_code, message } => {
            RuntimeError::Api(format!("{status_code}: {message}"))
        }
        other => RuntimeError::Unavailable(other.to_string()),
    }
}

fn is_port_conflict(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("port is already allocated") || message.contains("address already in use")
}

fn map_status(status: Option<ContainerStateStatusEnum>) -> ContainerState {
    match status {
        Some(ContainerStateStatusEnum::CREATED) => ContainerState::Created,
        Some(ContainerStateStatusEnum::RUNNING) => ContainerState::Running,
        Some(ContainerStateStatusEnum::PAUSED) => ContainerState::Paused,
        Some(ContainerStateStatusEnum::RESTARTING) => ContainerState::Restarting,
        Some(ContainerStateStatusEnum::REMOVING) => ContainerState::Removing,
        Some(ContainerStateStatusEnum::EXITED) => ContainerState::Exited,
        Some(ContainerStateStatusEnum::DEAD) => ContainerState::Dead,
        _ => ContainerState::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::ports::PortRange;

    #[test]
    fn port_conflict_messages_are_recognised() {
        assert!(is_port_conflict(
            "driver failed programming external connectivity: Bind for 0.0.0.0:30001 failed: port is already allocated"
        ));
        assert!(is_port_conflict("listen tcp4 0.0.0.0:30001: bind: Address already in use"));
        assert!(!is_port_conflict("No such image: lobby:latest"));
    }

    #[test]
    fn not_found_is_classified_separately() {
        let err = classify(DockerError::DockerResponseServerError {
            status_code: 404,
            message: "No such container: abc".into(),
        });
        assert!(matches!(err, RuntimeError::NotFound(_)));

        let err = classify(DockerError::DockerResponseServerError {
            status_code: 500,
            message: "boom".into(),
        });
        assert!(matches!(err, RuntimeError::Api(m) if m.starts_with("500")));
    }

    #[test]
    fn status_enum_maps_to_container_state() {
        assert_eq!(map_status(Some(ContainerStateStatusEnum::RUNNING)), ContainerState::Running);
        assert_eq!(map_status(Some(ContainerStateStatusEnum::EXITED)), ContainerState::Exited);
        assert_eq!(map_status(Some(ContainerStateStatusEnum::EMPTY)), ContainerState::Unknown);
        assert_eq!(map_status(None), ContainerState::Unknown);
    }

    #[test]
    fn container_config_binds_single_port() {
        let ports = PortAllocator::new(PortRange::new(30000, 30010).unwrap());
        // Connecting is lazy; no daemon is contacted here.
        let adapter = DockerAdapter::new("tcp://127.0.0.1:2375", "10.0.0.5".into(), ports).unwrap();
        let config = adapter.container_config("lobby:latest", "lobby-1a2b3c4d", 30003);

        let host = config.host_config.unwrap();
        let bindings = host.port_bindings.unwrap();
        let binding = bindings["30003/tcp"].as_ref().unwrap();
        assert_eq!(binding[0].host_port.as_deref(), Some("30003"));
        assert_eq!(host.network_mode.as_deref(), Some("bridge"));
        assert_eq!(config.labels.unwrap()[LABEL_INSTANCE], "lobby-1a2b3c4d");
    }
}
