//! Fleet controller error types.

use thiserror::Error;

use crate::adapters::registry::RegistryError;
use crate::adapters::runtime::RuntimeError;
use crate::core::domain::ContainerState;

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("no free port in range {low}:{high}")]
    ResourceExhausted { low: u16, high: u16 },

    #[error("instance not found: {0}")]
    NotFound(String),

    #[error("{failed} of {total} operations failed")]
    PartialFailure { failed: usize, total: usize },

    #[error("unknown group: {0}")]
    UnknownGroup(String),

    #[error("instance name already in use: {0}")]
    NameTaken(String),

    #[error("instance {name} did not come up (state: {state})")]
    NotReady { name: String, state: ContainerState },

    #[error("runtime error: {0}")]
    Runtime(RuntimeError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
}

impl From<RuntimeError> for FleetError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Unavailable(msg) => FleetError::RuntimeUnavailable(msg),
            RuntimeError::ResourceExhausted { low, high } => FleetError::ResourceExhausted { low, high },
            other => FleetError::Runtime(other),
        }
    }
}

pub type FleetResult<T> = Result<T, FleetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_errors_map_onto_taxonomy() {
        let e: FleetError = RuntimeError::Unavailable("socket closed".into()).into();
        assert!(matches!(e, FleetError::RuntimeUnavailable(_)));

        let e: FleetError = RuntimeError::ResourceExhausted { low: 1, high: 2 }.into();
        assert_eq!(e.to_string(), "no free port in range 1:2");

        let e: FleetError = RuntimeError::Api("500: boom".into()).into();
        assert!(matches!(e, FleetError::Runtime(RuntimeError::Api(_))));
    }
}
