//! Container runtime contract.
//!
//! The controller only ever talks to a runtime through this trait. It knows
//! nothing about game servers; it creates, inspects and removes containers.

use async_trait::async_trait;
use thiserror::Error;

use crate::core::domain::{ContainerDescriptor, ContainerState, CreatedContainer};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),

    #[error("no free port in range {low}:{high}")]
    ResourceExhausted { low: u16, high: u16 },

    /// The candidate port was taken between the live check and the bind.
    /// Handled inside `create_and_start`, never returned to callers.
    #[error("port {0} is already bound")]
    PortConflict(u16),

    #[error("container not found: {0}")]
    NotFound(String),

    #[error("runtime api error: {0}")]
    Api(String),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create a container from `image`, bind it to one free host port from the
    /// configured range and start it. Safe to call concurrently.
    async fn create_and_start(&self, image: &str, name: &str) -> RuntimeResult<CreatedContainer>;

    /// Stop a container. Missing or already stopped containers are not an error.
    async fn stop(&self, id: &str) -> RuntimeResult<()>;

    /// Remove a container. Missing containers are not an error.
    async fn remove(&self, id: &str, force: bool) -> RuntimeResult<()>;

    async fn exists(&self, id: &str) -> RuntimeResult<bool>;

    /// Current state; `RuntimeError::NotFound` if the container is gone.
    async fn state(&self, id: &str) -> RuntimeResult<ContainerState>;

    /// Every container on the host, including stopped ones and ones we did not create.
    async fn list(&self) -> RuntimeResult<Vec<ContainerDescriptor>>;

    /// Best-effort removal of stopped containers. Failures are logged.
    async fn prune(&self);
}
