use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One logical server group (game mode / map rotation). Immutable after startup.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct GroupSpec {
    pub name_prefix: String,
    pub image: String,
    pub image_tag: String,
    pub min_instances: u32,
    pub max_instances: u32,
    pub max_players_per_instance: u32,
    pub downscale_if_empty: bool,
}

impl GroupSpec {
    /// Full image reference handed to the runtime, e.g. `itzg/minecraft-server:latest`.
    pub fn image_ref(&self) -> String {
        format!("{}:{}", self.image, self.image_tag)
    }

    /// Prefix every instance name of this group starts with (`lobby-`).
    pub fn instance_prefix(&self) -> String {
        format!("{}-", self.name_prefix)
    }

    pub fn owns(&self, instance_name: &str) -> bool {
        instance_name.starts_with(&self.instance_prefix())
    }

    /// Instances strictly below this player count are down-scale candidates.
    pub fn downscale_threshold(&self) -> u32 {
        self.max_players_per_instance / 2
    }

    /// Player count the current fleet can hold before a new instance is warranted.
    pub fn capacity(&self, live: u32) -> u64 {
        u64::from(live) * u64::from(self.max_players_per_instance)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Provisioning,
    Running,
    Unhealthy,
    Terminating,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceState::Provisioning => "provisioning",
            InstanceState::Running => "running",
            InstanceState::Unhealthy => "unhealthy",
            InstanceState::Terminating => "terminating",
        };
        f.write_str(s)
    }
}

/// Reachable address of an instance (local host + allocated port).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A live container tracked by the controller.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct Instance {
    pub name: String,
    pub container_id: String,
    /// `name_prefix` of the owning group. Lookup only: removing a group does not
    /// cascade to its running instances.
    pub group: String,
    pub endpoint: Endpoint,
    pub state: InstanceState,
    pub created_at: DateTime<Utc>,
}

impl Instance {
    pub fn short_id(&self) -> String {
        self.container_id.chars().take(12).collect()
    }
}

/// Runtime-reported container status, independent of the runtime's own vocabulary.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    Unknown,
}

impl ContainerState {
    pub fn from_status(status: &str) -> Self {
        match status.trim().to_ascii_lowercase().as_str() {
            "created" => ContainerState::Created,
            "running" => ContainerState::Running,
            "paused" => ContainerState::Paused,
            "restarting" => ContainerState::Restarting,
            "removing" => ContainerState::Removing,
            "exited" => ContainerState::Exited,
            "dead" => ContainerState::Dead,
            _ => ContainerState::Unknown,
        }
    }

    /// Terminal failure: the container stopped and is never restarted by the controller.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ContainerState::Exited)
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContainerState::Created => "created",
            ContainerState::Running => "running",
            ContainerState::Paused => "paused",
            ContainerState::Restarting => "restarting",
            ContainerState::Removing => "removing",
            ContainerState::Exited => "exited",
            ContainerState::Dead => "dead",
            ContainerState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Read-only view of any container on the host, ours or not.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct ContainerDescriptor {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: ContainerState,
    pub public_ports: Vec<u16>,
}

/// Result of a successful `create_and_start`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreatedContainer {
    pub id: String,
    pub endpoint: Endpoint,
}

/// Outcome of one reconciliation tick.
#[derive(Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    pub created: u32,
    pub stopped: u32,
    pub healed: u32,
    pub failures: u32,
    /// Another tick held the single-flight guard; nothing was done.
    pub skipped: bool,
}

/// Group row plus its live instance count, as served by the facade.
#[derive(Serialize, Clone, Debug)]
pub struct GroupStatus {
    #[serde(flatten)]
    pub spec: GroupSpec,
    pub live: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lobby() -> GroupSpec {
        GroupSpec {
            name_prefix: "lobby".into(),
            image: "itzg/minecraft-server".into(),
            image_tag: "latest".into(),
            min_instances: 1,
            max_instances: 3,
            max_players_per_instance: 20,
            downscale_if_empty: true,
        }
    }

    #[test]
    fn owns_requires_dash_separator() {
        let g = lobby();
        assert!(g.owns("lobby-1a2b3c4d"));
        assert!(!g.owns("lobbyx-1a2b3c4d"));
        assert!(!g.owns("lobby"));
    }

    #[test]
    fn threshold_is_half_capacity_rounded_down() {
        let mut g = lobby();
        assert_eq!(g.downscale_threshold(), 10);
        g.max_players_per_instance = 21;
        assert_eq!(g.downscale_threshold(), 10);
        g.max_players_per_instance = 1;
        assert_eq!(g.downscale_threshold(), 0);
    }

    #[test]
    fn status_strings_map_to_states() {
        assert_eq!(ContainerState::from_status("running"), ContainerState::Running);
        assert_eq!(ContainerState::from_status("Exited"), ContainerState::Exited);
        assert_eq!(ContainerState::from_status("bogus"), ContainerState::Unknown);
        assert!(ContainerState::Exited.is_terminal());
        assert!(!ContainerState::Dead.is_terminal());
    }

    #[test]
    fn image_ref_joins_tag() {
        assert_eq!(lobby().image_ref(), "itzg/minecraft-server:latest");
        assert_eq!(Endpoint::new("10.0.0.2", 25566).to_string(), "10.0.0.2:25566");
    }
}
