//! In-process container runtime for tests and local development.
//!
//! Behaves like the Docker adapter at the contract level (port allocation,
//! idempotent stop/remove, `NotFound` on inspect of missing containers) and
//! lets tests inject drift: external deletion, crashed or stuck containers,
//! foreign containers, bind conflicts and an unreachable runtime.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::adapters::ports::{bound_ports, PortAllocator, PortRange};
use crate::adapters::runtime::{ContainerRuntime, RuntimeError, RuntimeResult};
use crate::core::domain::{ContainerDescriptor, ContainerState, CreatedContainer, Endpoint};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockContainer {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: ContainerState,
    pub port: Option<u16>,
}

#[derive(Clone)]
pub struct MockRuntime {
    inner: Arc<MockRuntimeInner>,
}

struct MockRuntimeInner {
    host: String,
    ports: PortAllocator,
    containers: Mutex<HashMap<String, MockContainer>>,
    /// Ports that fail once at bind time, as if grabbed out-of-band.
    bind_conflicts: Mutex<BTreeSet<u16>>,
    create_delay: Mutex<Duration>,
    /// State new containers report right after start.
    start_state: Mutex<ContainerState>,
    next_id: AtomicU64,
    fail_creates: AtomicBool,
    unavailable: AtomicBool,
    creates: AtomicU32,
    stops: AtomicU32,
    removes: AtomicU32,
}

impl MockRuntime {
    pub fn new(range: PortRange) -> Self {
        Self {
            inner: Arc::new(MockRuntimeInner {
                host: "127.0.0.1".to_string(),
                ports: PortAllocator::new(range),
                containers: Mutex::new(HashMap::new()),
                bind_conflicts: Mutex::new(BTreeSet::new()),
                create_delay: Mutex::new(Duration::ZERO),
                start_state: Mutex::new(ContainerState::Running),
                next_id: AtomicU64::new(1),
                fail_creates: AtomicBool::new(false),
                unavailable: AtomicBool::new(false),
                creates: AtomicU32::new(0),
                stops: AtomicU32::new(0),
                removes: AtomicU32::new(0),
            }),
        }
    }

    pub fn set_fail_creates(&self, fail: bool) {
        self.inner.fail_creates.store(fail, Ordering::SeqCst);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Suspends every create between port reservation and bind.
    pub fn set_create_delay(&self, delay: Duration) {
        *lock(&self.inner.create_delay) = delay;
    }

    pub fn set_start_state(&self, state: ContainerState) {
        *lock(&self.inner.start_state) = state;
    }

    pub fn conflict_on_bind(&self, port: u16) {
        lock(&self.inner.bind_conflicts).insert(port);
    }

    /// Simulates the container's process changing state on its own.
    pub fn set_state(&self, id: &str, state: ContainerState) -> bool {
        match lock(&self.inner.containers).get_mut(id) {
            Some(c) => {
                c.state = state;
                true
            }
            None => false,
        }
    }

    /// Simulates an operator removing the container behind the controller's back.
    pub fn delete_externally(&self, id: &str) -> bool {
        lock(&self.inner.containers).remove(id).is_some()
    }

    /// Adds a container the controller did not create.
    pub fn add_foreign(&self, name: &str, image: &str, state: ContainerState, port: Option<u16>) -> String {
        let id = self.next_id();
        lock(&self.inner.containers).insert(
            id.clone(),
            MockContainer {
                id: id.clone(),
                name: name.to_string(),
                image: image.to_string(),
                state,
                port,
            },
        );
        id
    }

    pub fn container(&self, id: &str) -> Option<MockContainer> {
        lock(&self.inner.containers).get(id).cloned()
    }

    pub fn containers(&self) -> Vec<MockContainer> {
        let mut all: Vec<_> = lock(&self.inner.containers).values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn running_count(&self) -> usize {
        lock(&self.inner.containers)
            .values()
            .filter(|c| c.state == ContainerState::Running)
            .count()
    }

    pub fn creates(&self) -> u32 {
        self.inner.creates.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> u32 {
        self.inner.stops.load(Ordering::SeqCst)
    }

    pub fn removes(&self) -> u32 {
        self.inner.removes.load(Ordering::SeqCst)
    }

    fn next_id(&self) -> String {
        let n = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        format!("mock{n:012x}")
    }

    fn check_available(&self) -> RuntimeResult<()> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(RuntimeError::Unavailable("mock runtime offline".to_string()));
        }
        Ok(())
    }

    fn take_bind_conflict(&self, port: u16) -> bool {
        lock(&self.inner.bind_conflicts).remove(&port)
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn create_and_start(&self, image: &str, name: &str) -> RuntimeResult<CreatedContainer> {
        self.check_available()?;
        if self.inner.fail_creates.load(Ordering::SeqCst) {
            return Err(RuntimeError::Api("mock runtime configured to fail creates".to_string()));
        }

        let range = self.inner.ports.range();
        let mut tried = BTreeSet::new();
        loop {
            let bound = bound_ports(&self.list().await?);
            let lease = self
                .inner
                .ports
                .reserve(&bound, &tried)
                .ok_or(RuntimeError::ResourceExhausted {
                    low: range.low,
                    high: range.high,
                })?;
            let port = lease.port();
            tried.insert(port);

            let delay = *lock(&self.inner.create_delay);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            if self.take_bind_conflict(port) {
                debug!(instance = %name, port, "[MOCK] bind conflict, retrying");
                continue;
            }

            let id = self.next_id();
            let state = *lock(&self.inner.start_state);
            lock(&self.inner.containers).insert(
                id.clone(),
                MockContainer {
                    id: id.clone(),
                    name: format!("{name}_{port}"),
                    image: image.to_string(),
                    state,
                    port: Some(port),
                },
            );
            self.inner.creates.fetch_add(1, Ordering::SeqCst);
            info!(instance = %name, container.id = %id, port, "[MOCK] container started");

            return Ok(CreatedContainer {
                id,
                endpoint: Endpoint::new(self.inner.host.clone(), port),
            });
        }
    }

    async fn stop(&self, id: &str) -> RuntimeResult<()> {
        self.check_available()?;
        self.inner.stops.fetch_add(1, Ordering::SeqCst);
        if let Some(c) = lock(&self.inner.containers).get_mut(id) {
            c.state = ContainerState::Exited;
        }
        Ok(())
    }

    async fn remove(&self, id: &str, force: bool) -> RuntimeResult<()> {
        self.check_available()?;
        let mut containers = lock(&self.inner.containers);
        match containers.get(id) {
            None => Ok(()),
            Some(c) if c.state == ContainerState::Running && !force => Err(RuntimeError::Api(
                format!("409: cannot remove running container {id}, stop it first"),
            )),
            Some(_) => {
                containers.remove(id);
                self.inner.removes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
    }

    async fn exists(&self, id: &str) -> RuntimeResult<bool> {
        self.check_available()?;
        Ok(lock(&self.inner.containers).contains_key(id))
    }

    async fn state(&self, id: &str) -> RuntimeResult<ContainerState> {
        self.check_available()?;
        lock(&self.inner.containers)
            .get(id)
            .map(|c| c.state)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
    }

    async fn list(&self) -> RuntimeResult<Vec<ContainerDescriptor>> {
        self.check_available()?;
        Ok(lock(&self.inner.containers)
            .values()
            .map(|c| ContainerDescriptor {
                id: c.id.clone(),
                name: c.name.clone(),
                image: c.image.clone(),
                state: c.state,
                public_ports: c.port.into_iter().collect(),
            })
            .collect())
    }

    async fn prune(&self) {
        if self.check_available().is_err() {
            return;
        }
        lock(&self.inner.containers).retain(|_, c| {
            !matches!(c.state, ContainerState::Exited | ContainerState::Dead | ContainerState::Created)
        });
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
