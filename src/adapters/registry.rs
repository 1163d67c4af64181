//! Routing registry gateway.
//!
//! The proxy must know an instance's endpoint before players can be routed
//! to it. The controller registers/unregisters endpoints and reads the live
//! player counts back as its load signal.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::core::domain::Endpoint;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry unavailable: {0}")]
    Unavailable(String),

    #[error("registry rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// Connected-player count of one registered server.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ServerLoad {
    pub name: String,
    pub players: u32,
}

#[async_trait]
pub trait RegistryGateway: Send + Sync {
    /// `listed = false` registers a raw backend the proxy does not advertise.
    async fn register(&self, name: &str, endpoint: &Endpoint, listed: bool) -> RegistryResult<()>;

    /// Unknown names are not an error.
    async fn unregister(&self, name: &str) -> RegistryResult<()>;

    /// Zero for names that are not registered.
    async fn connected_players(&self, name: &str) -> RegistryResult<u32>;

    async fn list_matching_prefix(&self, prefix: &str) -> RegistryResult<Vec<ServerLoad>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredServer {
    pub endpoint: Endpoint,
    pub listed: bool,
    pub players: u32,
}

/// Embedded registry, used when the proxy's registry is in-process and by tests.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    servers: RwLock<HashMap<String, RegisteredServer>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Updates the player count of a registered server. Returns false if unknown.
    pub fn set_players(&self, name: &str, players: u32) -> bool {
        match self.write().get_mut(name) {
            Some(server) => {
                server.players = players;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, name: &str) -> Option<RegisteredServer> {
        self.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, RegisteredServer>> {
        self.servers.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, RegisteredServer>> {
        self.servers.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl RegistryGateway for InMemoryRegistry {
    async fn register(&self, name: &str, endpoint: &Endpoint, listed: bool) -> RegistryResult<()> {
        self.write().insert(
            name.to_string(),
            RegisteredServer {
                endpoint: endpoint.clone(),
                listed,
                players: 0,
            },
        );
        debug!(instance = %name, endpoint = %endpoint, listed, "server registered");
        Ok(())
    }

    async fn unregister(&self, name: &str) -> RegistryResult<()> {
        if self.write().remove(name).is_some() {
            debug!(instance = %name, "server unregistered");
        }
        Ok(())
    }

    async fn connected_players(&self, name: &str) -> RegistryResult<u32> {
        Ok(self.read().get(name).map(|s| s.players).unwrap_or(0))
    }

    async fn list_matching_prefix(&self, prefix: &str) -> RegistryResult<Vec<ServerLoad>> {
        let mut loads: Vec<_> = self
            .read()
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(name, s)| ServerLoad {
                name: name.clone(),
                players: s.players,
            })
            .collect();
        loads.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(loads)
    }
}

#[derive(Serialize)]
struct RegisterRequest<'a> {
    name: &'a str,
    address: String,
    listed: bool,
}

/// Client for the proxy's registry admin API.
#[derive(Clone)]
pub struct HttpRegistry {
    client: Client,
    base_url: String,
}

impl HttpRegistry {
    pub fn new(base_url: &str) -> RegistryResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| RegistryError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn server_url(&self, name: &str) -> String {
        format!("{}/servers/{}", self.base_url, name)
    }
}

async fn check(resp: reqwest::Response) -> RegistryResult<reqwest::Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status().as_u16();
    let message = resp.text().await.unwrap_or_default();
    Err(RegistryError::Rejected { status, message })
}

fn unavailable(e: reqwest::Error) -> RegistryError {
    RegistryError::Unavailable(e.to_string())
}

#[async_trait]
impl RegistryGateway for HttpRegistry {
    async fn register(&self, name: &str, endpoint: &Endpoint, listed: bool) -> RegistryResult<()> {
        let body = RegisterRequest {
            name,
            address: endpoint.to_string(),
            listed,
        };
        let resp = self
            .client
            .post(format!("{}/servers", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(unavailable)?;
        check(resp).await.map(|_| ())
    }

    async fn unregister(&self, name: &str) -> RegistryResult<()> {
        let resp = self
            .client
            .delete(self.server_url(name))
            .send()
            .await
            .map_err(unavailable)?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check(resp).await.map(|_| ())
    }

    async fn connected_players(&self, name: &str) -> RegistryResult<u32> {
        let resp = self
            .client
            .get(self.server_url(name))
            .send()
            .await
            .map_err(unavailable)?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(0);
        }
        let load: ServerLoad = check(resp).await?.json().await.map_err(unavailable)?;
        Ok(load.players)
    }

    async fn list_matching_prefix(&self, prefix: &str) -> RegistryResult<Vec<ServerLoad>> {
        let resp = self
            .client
            .get(format!("{}/servers", self.base_url))
            .query(&[("prefix", prefix)])
            .send()
            .await
            .map_err(unavailable)?;
        let loads: Vec<ServerLoad> = check(resp).await?.json().await.map_err(unavailable)?;
        // The server may match loosely; the prefix contract is ours to enforce.
        Ok(loads.into_iter().filter(|l| l.name.starts_with(prefix)).collect())
    }
}
