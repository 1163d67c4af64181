use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

use crate::adapters::ports::PortRange;
use crate::core::controller::ControllerSettings;
use crate::core::domain::GroupSpec;

lazy_static! {
    static ref PORT_RANGE_RE: Regex = Regex::new(r"^\s*(\d{1,5})\s*:\s*(\d{1,5})\s*$").expect("port range regex");
    static ref DURATION_RE: Regex = Regex::new(r"^\s*(\d+)\s*(ms|s|m|h)?\s*$").expect("duration regex");
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed fleet config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid fleet config: {0}")]
    Invalid(String),
}

/// Process settings from the environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub env: String,
    pub node_name: String,
    pub host: String,
    pub http_port: u16,
    pub log_format: String,
    pub fleet_config: PathBuf,
    pub registry_url: Option<String>,
}

impl AppConfig {
    pub fn load() -> Self {
        Self {
            env: env::var("ENV").unwrap_or_else(|_| "production".into()),
            node_name: env::var("NODE_NAME")
                .unwrap_or_else(|_| {
                    hostname::get()
                        .map(|h| h.to_string_lossy().into_owned())
                        .unwrap_or_else(|_| "FLEET-NODE".into())
                })
                .to_uppercase(),
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            http_port: env::var("HTTP_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(11080),
            log_format: env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string()),
            fleet_config: env::var("FLEET_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("config.toml")),
            registry_url: env::var("REGISTRY_URL").ok().filter(|u| !u.trim().is_empty()),
        }
    }
}

/// Validated fleet settings: runtime connection, ports, reconcile cadence and groups.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub docker_host: String,
    pub local_ip: String,
    pub port_range: PortRange,
    pub check_interval: Duration,
    pub prune_containers: bool,
    pub auto_add_servers: bool,
    pub registration_delay: Duration,
    pub worker_pool_size: usize,
    pub groups: Vec<GroupSpec>,
}

impl FleetConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let parsed: RawConfig = toml::from_str(raw)?;
        parsed.validate()
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            registration_delay: self.registration_delay,
            auto_register: self.auto_add_servers,
            prune_on_startup: self.prune_containers,
            worker_pool_size: self.worker_pool_size,
        }
    }
}

/// Bare integers are minutes, the historical unit of this key.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum IntervalValue {
    Minutes(u64),
    Text(String),
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    docker: RawDocker,
    #[serde(default)]
    server: Vec<RawServer>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
struct RawDocker {
    host: String,
    local_ip: String,
    port_range: String,
    server_check_interval: IntervalValue,
    prune_containers: bool,
    auto_add_servers: bool,
    registration_delay: String,
    worker_pool_size: usize,
}

impl Default for RawDocker {
    fn default() -> Self {
        Self {
            host: "tcp://127.0.0.1:2375".into(),
            local_ip: "127.0.0.1".into(),
            port_range: "25566:25600".into(),
            server_check_interval: IntervalValue::Minutes(1),
            prune_containers: false,
            auto_add_servers: true,
            registration_delay: "2s".into(),
            worker_pool_size: 10,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawServer {
    prefix_name: String,
    docker_image: String,
    #[serde(default = "default_tag")]
    docker_tag: String,
    #[serde(default = "default_one")]
    min_concurrent_servers: u32,
    #[serde(default = "default_one")]
    max_concurrent_servers: u32,
    #[serde(default = "default_max_players")]
    max_players: u32,
    #[serde(default = "default_true")]
    downscale_if_empty: bool,
}

fn default_tag() -> String {
    "latest".into()
}

fn default_one() -> u32 {
    1
}

fn default_max_players() -> u32 {
    10
}

fn default_true() -> bool {
    true
}

impl RawConfig {
    fn validate(self) -> Result<FleetConfig, ConfigError> {
        let d = self.docker;
        let port_range = parse_port_range(&d.port_range)?;
        let check_interval = match &d.server_check_interval {
            IntervalValue::Minutes(m) => Duration::from_secs(m.saturating_mul(60)),
            IntervalValue::Text(t) => parse_duration(t)?,
        };
        if check_interval.is_zero() {
            return Err(ConfigError::Invalid("server-check-interval must be positive".into()));
        }
        let registration_delay = parse_duration(&d.registration_delay)?;
        if d.local_ip.trim().is_empty() {
            return Err(ConfigError::Invalid("local-ip must not be empty".into()));
        }

        let mut seen = HashSet::new();
        let mut groups = Vec::with_capacity(self.server.len());
        for s in self.server {
            let group = s.into_group()?;
            if !seen.insert(group.name_prefix.clone()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate prefix-name '{}'",
                    group.name_prefix
                )));
            }
            groups.push(group);
        }

        Ok(FleetConfig {
            docker_host: d.host,
            local_ip: d.local_ip,
            port_range,
            check_interval,
            prune_containers: d.prune_containers,
            auto_add_servers: d.auto_add_servers,
            registration_delay,
            worker_pool_size: d.worker_pool_size.max(1),
            groups,
        })
    }
}

impl RawServer {
    fn into_group(self) -> Result<GroupSpec, ConfigError> {
        let prefix = self.prefix_name.trim().to_string();
        if prefix.is_empty() {
            return Err(ConfigError::Invalid("prefix-name must not be empty".into()));
        }
        if self.docker_image.trim().is_empty() {
            return Err(ConfigError::Invalid(format!("[{prefix}] docker-image must not be empty")));
        }
        if self.min_concurrent_servers > self.max_concurrent_servers {
            return Err(ConfigError::Invalid(format!(
                "[{prefix}] min-concurrent-servers ({}) exceeds max-concurrent-servers ({})",
                self.min_concurrent_servers, self.max_concurrent_servers
            )));
        }
        if self.max_players == 0 {
            return Err(ConfigError::Invalid(format!("[{prefix}] max-players must be positive")));
        }

        Ok(GroupSpec {
            name_prefix: prefix,
            image: self.docker_image.trim().to_string(),
            image_tag: self.docker_tag,
            min_instances: self.min_concurrent_servers,
            max_instances: self.max_concurrent_servers,
            max_players_per_instance: self.max_players,
            downscale_if_empty: self.downscale_if_empty,
        })
    }
}

fn parse_port_range(raw: &str) -> Result<PortRange, ConfigError> {
    let invalid = || ConfigError::Invalid(format!("port-range '{raw}' is not low:high"));
    let caps = PORT_RANGE_RE.captures(raw).ok_or_else(invalid)?;
    let low: u16 = caps[1].parse().map_err(|_| invalid())?;
    let high: u16 = caps[2].parse().map_err(|_| invalid())?;
    PortRange::new(low, high).ok_or_else(invalid)
}

/// `"30s"`, `"5m"`, `"1h"`, `"500ms"` or bare seconds.
fn parse_duration(raw: &str) -> Result<Duration, ConfigError> {
    let caps = DURATION_RE
        .captures(raw)
        .ok_or_else(|| ConfigError::Invalid(format!("'{raw}' is not a duration")))?;
    let n: u64 = caps[1]
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("'{raw}' is out of range")))?;
    Ok(match caps.get(2).map(|m| m.as_str()) {
        Some("ms") => Duration::from_millis(n),
        Some("m") => Duration::from_secs(n.saturating_mul(60)),
        Some("h") => Duration::from_secs(n.saturating_mul(3600)),
        _ => Duration::from_secs(n),
    })
}
