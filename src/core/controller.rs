//! Fleet controller: owns the instance table and reconciles it against the
//! container runtime and the routing registry.
//!
//! # Tick
//!
//! ```text
//! reconcile()                       single-flight: overlapping ticks are skipped
//!   scale phase   (snapshot: live counts + registry demand, per group)
//!     registry drift                     -> withdraw untracked names, re-register lost ones
//!     live < min                         -> launch one
//!     live < max && demand > live * cap  -> launch one
//!     live > min && downscale_if_empty   -> stop instances below cap / 2
//!   heal phase    (snapshot of the table after scaling)
//!     container gone       -> drop entry, unregister, re-check up-sizing once per group
//!     container exited     -> unregister, remove, drop entry
//!     any other non-running state -> unregister, stop, remove, drop entry, launch replacement
//! ```
//!
//! Every table mutation happens under the one `state` mutex, so scale, heal,
//! pool workers and facade commands can interleave without lost updates.
//! Runtime and registry calls are never made while holding it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::adapters::registry::RegistryGateway;
use crate::adapters::runtime::{ContainerRuntime, RuntimeError};
use crate::core::domain::{
    ContainerDescriptor, ContainerState, GroupSpec, GroupStatus, Instance, InstanceState, TickReport,
};
use crate::core::error::{FleetError, FleetResult};
use crate::core::pool::WorkerPool;
use crate::core::state::FleetState;

const SHORT_ID_LEN: usize = 8;

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Wait between container start and endpoint confirmation.
    pub registration_delay: Duration,
    /// Advertise new instances in the proxy's server list.
    pub auto_register: bool,
    pub prune_on_startup: bool,
    pub worker_pool_size: usize,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            registration_delay: Duration::from_secs(2),
            auto_register: true,
            prune_on_startup: false,
            worker_pool_size: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    Up,
    Down,
    Hold,
}

/// Scale decision for one group from a consistent (live, demand) observation.
pub fn decide(group: &GroupSpec, live: u32, demand: u64) -> ScaleDecision {
    if live < group.min_instances {
        return ScaleDecision::Up;
    }
    if live < group.max_instances && demand > group.capacity(live) {
        return ScaleDecision::Up;
    }
    if live > group.min_instances && group.downscale_if_empty {
        return ScaleDecision::Down;
    }
    ScaleDecision::Hold
}

/// Names to stop for a `Down` decision, emptiest first.
///
/// Only registered (`Running`) instances below half capacity qualify. Stops
/// end at `min_instances`, and before the remaining fleet could no longer
/// hold `demand` (which would make the next tick scale straight back up).
/// Threshold policy: not every qualifying instance is stopped, only as many
/// as those two bounds allow.
pub fn downscale_candidates(
    group: &GroupSpec,
    instances: &[Instance],
    players: &HashMap<String, u32>,
    live: u32,
    demand: u64,
) -> Vec<String> {
    let threshold = group.downscale_threshold();
    let mut candidates: Vec<(u32, &str)> = instances
        .iter()
        .filter(|i| i.state == InstanceState::Running && group.owns(&i.name))
        .filter_map(|i| players.get(&i.name).map(|p| (*p, i.name.as_str())))
        .filter(|(p, _)| *p < threshold)
        .collect();
    candidates.sort();

    let mut remaining = live;
    let mut out = Vec::new();
    for (_, name) in candidates {
        if remaining <= group.min_instances || demand > group.capacity(remaining - 1) {
            break;
        }
        remaining -= 1;
        out.push(name.to_string());
    }
    out
}

struct GroupLoad {
    demand: u64,
    players: HashMap<String, u32>,
}

enum Observed {
    Healthy,
    Gone,
    Failed(ContainerState),
}

#[derive(Clone)]
pub struct FleetController {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    groups: Vec<GroupSpec>,
    runtime: Arc<dyn ContainerRuntime>,
    registry: Arc<dyn RegistryGateway>,
    settings: ControllerSettings,
    state: Mutex<FleetState>,
    tick_guard: Mutex<()>,
    pool: WorkerPool,
}

impl FleetController {
    pub fn new(
        groups: Vec<GroupSpec>,
        runtime: Arc<dyn ContainerRuntime>,
        registry: Arc<dyn RegistryGateway>,
        settings: ControllerSettings,
    ) -> Self {
        let pool = WorkerPool::new(settings.worker_pool_size);
        Self {
            inner: Arc::new(ControllerInner {
                groups,
                runtime,
                registry,
                settings,
                state: Mutex::new(FleetState::new()),
                tick_guard: Mutex::new(()),
                pool,
            }),
        }
    }

    pub fn groups(&self) -> &[GroupSpec] {
        &self.inner.groups
    }

    pub fn group(&self, prefix: &str) -> Option<&GroupSpec> {
        self.inner.groups.iter().find(|g| g.name_prefix == prefix)
    }

    // ── Startup & shutdown ──────────────────────────────────────────

    /// Initial fill to `min_instances` for every group, optional prune, then
    /// the dangling cleanup. Cleanup runs last so freshly started instances
    /// are already tracked and never mistaken for leftovers.
    pub async fn start(&self) -> FleetResult<()> {
        {
            let mut state = self.inner.state.lock().await;
            for group in &self.inner.groups {
                state.add_known_image(group.image_ref());
            }
        }

        let jobs: Vec<_> = self
            .inner
            .groups
            .iter()
            .flat_map(|g| (0..g.min_instances).map(move |_| g.clone()))
            .map(|group| {
                let controller = self.clone();
                async move { controller.launch(&group).await }
            })
            .collect();
        let total = jobs.len();
        let failed = self
            .inner
            .pool
            .run_all(jobs)
            .await
            .iter()
            .filter(|r| r.is_err())
            .count();

        info!(
            event = "FLEET_INITIAL_FILL",
            groups = self.inner.groups.len(),
            launched = total - failed,
            failed,
            "Initial fill finished"
        );

        if self.inner.settings.prune_on_startup {
            self.inner.runtime.prune().await;
        }

        if let Err(e) = self.cleanup_dangling().await {
            warn!(event = "DANGLING_CLEANUP_FAILED", error = %e, "Startup dangling cleanup incomplete");
        }

        if failed > 0 {
            return Err(FleetError::PartialFailure { failed, total });
        }
        Ok(())
    }

    /// Waits for any in-flight tick, stops and removes every instance, then
    /// runs a final dangling cleanup. Ticks attempted meanwhile are skipped.
    ///
    /// Facade commands are not excluded: stop the API before calling this, or
    /// a `restart` whose container is not yet tracked is swept as dangling.
    pub async fn shutdown(&self) -> FleetResult<()> {
        let _tick = self.inner.tick_guard.lock().await;

        let names = self.inner.state.lock().await.names();
        info!(event = "FLEET_TEARDOWN", instances = names.len(), "Tearing down fleet");

        let mut total = names.len();
        let jobs: Vec<_> = names
            .into_iter()
            .map(|name| {
                let controller = self.clone();
                async move { controller.terminate(&name).await }
            })
            .collect();
        let mut failed = self
            .inner
            .pool
            .run_all(jobs)
            .await
            .iter()
            .filter(|r| matches!(r, Err(e) if !matches!(e, FleetError::NotFound(_))))
            .count();

        match self.cleanup_dangling().await {
            Ok(_) => {}
            Err(FleetError::PartialFailure { failed: f, total: t }) => {
                failed += f;
                total += t;
            }
            Err(e) => {
                warn!(event = "DANGLING_CLEANUP_FAILED", error = %e, "Final dangling cleanup failed");
                failed += 1;
                total += 1;
            }
        }

        if failed > 0 {
            return Err(FleetError::PartialFailure { failed, total });
        }
        info!(event = "FLEET_TEARDOWN_DONE", "Fleet torn down");
        Ok(())
    }

    /// Removes containers whose image belongs to a known group but whose ID is
    /// not in the table. Unrelated containers on the host are never touched.
    pub async fn cleanup_dangling(&self) -> FleetResult<usize> {
        debug!(event = "DANGLING_SCAN", "Checking for dangling containers");
        let containers = self.inner.runtime.list().await?;

        let dangling: Vec<ContainerDescriptor> = {
            let state = self.inner.state.lock().await;
            let tracked = state.container_ids();
            containers
                .into_iter()
                .filter(|c| state.is_known_image(&c.image) && !tracked.contains(&c.id))
                .collect()
        };

        let total = dangling.len();
        let mut failed = 0;
        for c in &dangling {
            warn!(
                event = "DANGLING_CONTAINER",
                container.id = %c.id,
                container.name = %c.name,
                image = %c.image,
                "Removing dangling container"
            );
            if let Err(e) = self.inner.runtime.remove(&c.id, true).await {
                error!(event = "DANGLING_REMOVE_FAILED", container.id = %c.id, error = %e, "Dangling container removal failed");
                failed += 1;
            }
        }

        if failed > 0 {
            return Err(FleetError::PartialFailure { failed, total });
        }
        if total > 0 {
            info!(event = "DANGLING_CLEANUP_DONE", removed = total, "Dangling containers removed");
        }
        Ok(total)
    }

    // ── Instance lifecycle ──────────────────────────────────────────

    /// Creates, starts, confirms and registers one new instance of `group`.
    /// Any failure after the container exists rolls it back completely.
    pub async fn launch(&self, group: &GroupSpec) -> FleetResult<Instance> {
        let image = group.image_ref();
        let name = self.fresh_name(group).await;
        info!(event = "INSTANCE_LAUNCH", instance = %name, group = %group.name_prefix, image = %image, "Starting instance");

        let created = match self.inner.runtime.create_and_start(&image, &name).await {
            Ok(created) => created,
            Err(e) => {
                error!(event = "INSTANCE_LAUNCH_FAILED", instance = %name, error = %e, "Container create failed");
                return Err(e.into());
            }
        };

        let instance = Instance {
            name: name.clone(),
            container_id: created.id,
            group: group.name_prefix.clone(),
            endpoint: created.endpoint,
            state: InstanceState::Provisioning,
            created_at: Utc::now(),
        };

        let inserted = {
            let mut state = self.inner.state.lock().await;
            state.add_known_image(image);
            state.insert(instance.clone())
        };
        if !inserted {
            error!(event = "INSTANCE_LAUNCH_FAILED", instance = %name, "Instance name collided with a live entry");
            self.discard_container(&instance.container_id).await;
            return Err(FleetError::NameTaken(name));
        }

        match self.confirm_and_register(&instance).await {
            Ok(running) => {
                info!(
                    event = "INSTANCE_RUNNING",
                    instance = %running.name,
                    container.id = %running.short_id(),
                    endpoint = %running.endpoint,
                    "Instance registered"
                );
                Ok(running)
            }
            Err(e) => {
                error!(event = "INSTANCE_LAUNCH_FAILED", instance = %name, error = %e, "Instance did not come up, rolling back");
                self.rollback(&instance).await;
                Err(e)
            }
        }
    }

    async fn confirm_and_register(&self, instance: &Instance) -> FleetResult<Instance> {
        let delay = self.inner.settings.registration_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let state = self.inner.runtime.state(&instance.container_id).await?;
        if state != ContainerState::Running {
            return Err(FleetError::NotReady {
                name: instance.name.clone(),
                state,
            });
        }

        self.inner
            .registry
            .register(&instance.name, &instance.endpoint, self.inner.settings.auto_register)
            .await?;

        let promoted = self.inner.state.lock().await.transition(
            &instance.name,
            &instance.container_id,
            &[InstanceState::Provisioning],
            InstanceState::Running,
        );
        if !promoted {
            // Stopped or healed away while we were confirming.
            return Err(FleetError::NotFound(instance.name.clone()));
        }

        let mut running = instance.clone();
        running.state = InstanceState::Running;
        Ok(running)
    }

    async fn rollback(&self, instance: &Instance) {
        self.inner
            .state
            .lock()
            .await
            .remove_if_container(&instance.name, &instance.container_id);
        if let Err(e) = self.inner.registry.unregister(&instance.name).await {
            warn!(event = "REGISTRY_UNREGISTER_FAILED", instance = %instance.name, error = %e, "Unregister failed");
        }
        self.discard_container(&instance.container_id).await;
    }

    async fn discard_container(&self, container_id: &str) {
        if let Err(e) = self.inner.runtime.stop(container_id).await {
            warn!(event = "CONTAINER_STOP_FAILED", container.id = %container_id, error = %e, "Stop failed");
        }
        if let Err(e) = self.inner.runtime.remove(container_id, true).await {
            warn!(
                event = "CONTAINER_REMOVE_FAILED",
                container.id = %container_id,
                error = %e,
                "Remove failed, left for dangling cleanup"
            );
        }
    }

    /// Drops the entry and unregisters it first, then stops and removes the
    /// container. Routing correctness wins over teardown ordering.
    pub async fn terminate(&self, name: &str) -> FleetResult<Instance> {
        let mut instance = self
            .inner
            .state
            .lock()
            .await
            .remove(name)
            .ok_or_else(|| FleetError::NotFound(name.to_string()))?;
        instance.state = InstanceState::Terminating;
        info!(event = "INSTANCE_TERMINATE", instance = %name, container.id = %instance.short_id(), "Stopping instance");

        if let Err(e) = self.inner.registry.unregister(name).await {
            warn!(event = "REGISTRY_UNREGISTER_FAILED", instance = %name, error = %e, "Unregister failed");
        }

        if let Err(e) = self.inner.runtime.stop(&instance.container_id).await {
            error!(event = "INSTANCE_STOP_FAILED", instance = %name, error = %e, "Container stop failed");
            return Err(e.into());
        }
        if let Err(e) = self.inner.runtime.remove(&instance.container_id, false).await {
            error!(event = "INSTANCE_REMOVE_FAILED", instance = %name, error = %e, "Container remove failed");
            return Err(e.into());
        }

        info!(event = "INSTANCE_TERMINATED", instance = %name, "Instance stopped and removed");
        Ok(instance)
    }

    /// Stops `name` and launches a fresh instance of the group it belonged to.
    pub async fn restart(&self, name: &str) -> FleetResult<Instance> {
        let prefix = self
            .inner
            .state
            .lock()
            .await
            .get(name)
            .map(|i| i.group.clone())
            .ok_or_else(|| FleetError::NotFound(name.to_string()))?;
        let group = self
            .group(&prefix)
            .cloned()
            .ok_or(FleetError::UnknownGroup(prefix))?;

        info!(event = "INSTANCE_RESTART", instance = %name, group = %group.name_prefix, "Restarting instance");
        self.terminate(name).await?;
        self.launch(&group).await
    }

    async fn fresh_name(&self, group: &GroupSpec) -> String {
        let state = self.inner.state.lock().await;
        loop {
            let id = Uuid::new_v4().simple().to_string();
            let name = format!("{}{}", group.instance_prefix(), &id[..SHORT_ID_LEN]);
            if !state.contains(&name) {
                return name;
            }
        }
    }

    // ── Reconciliation ──────────────────────────────────────────────

    /// One reconciliation tick: scale, then heal. Returns immediately with
    /// `skipped = true` if another tick is still running.
    pub async fn reconcile(&self) -> TickReport {
        let Ok(_tick) = self.inner.tick_guard.try_lock() else {
            debug!(event = "RECONCILE_SKIPPED", "Previous tick still in flight");
            return TickReport {
                skipped: true,
                ..TickReport::default()
            };
        };

        let mut report = TickReport::default();
        self.scale_phase(&mut report).await;
        self.heal_phase(&mut report).await;

        if report.created + report.stopped + report.healed + report.failures > 0 {
            info!(
                event = "RECONCILE_TICK",
                created = report.created,
                stopped = report.stopped,
                healed = report.healed,
                failures = report.failures,
                "Reconciliation tick finished"
            );
        } else {
            debug!(event = "RECONCILE_TICK", "Fleet converged, nothing to do");
        }
        report
    }

    async fn scale_phase(&self, report: &mut TickReport) {
        let (live, members): (HashMap<String, u32>, HashMap<String, Vec<Instance>>) = {
            let state = self.inner.state.lock().await;
            self.inner
                .groups
                .iter()
                .map(|g| {
                    (
                        (g.name_prefix.clone(), state.live_count(&g.name_prefix)),
                        (g.name_prefix.clone(), state.instances_of(&g.name_prefix)),
                    )
                })
                .unzip()
        };

        let mut loads = HashMap::new();
        for group in &self.inner.groups {
            match self.observe_load(group, report).await {
                Ok(load) => {
                    loads.insert(group.name_prefix.clone(), load);
                }
                Err(e) => {
                    warn!(event = "LOAD_QUERY_FAILED", group = %group.name_prefix, error = %e, "Could not read demand, skipping group this tick");
                    report.failures += 1;
                }
            }
        }

        for group in &self.inner.groups {
            let Some(load) = loads.get(&group.name_prefix) else {
                continue;
            };
            let live = live.get(&group.name_prefix).copied().unwrap_or(0);

            match decide(group, live, load.demand) {
                ScaleDecision::Up => {
                    debug!(
                        event = "SCALE_UP",
                        group = %group.name_prefix,
                        live,
                        demand = load.demand,
                        capacity = group.capacity(live),
                        "Scaling up"
                    );
                    match self.launch(group).await {
                        Ok(_) => report.created += 1,
                        Err(_) => report.failures += 1,
                    }
                }
                ScaleDecision::Down => {
                    let instances = members.get(&group.name_prefix).map(Vec::as_slice).unwrap_or(&[]);
                    let victims = downscale_candidates(group, instances, &load.players, live, load.demand);
                    if !victims.is_empty() {
                        debug!(event = "SCALE_DOWN", group = %group.name_prefix, live, demand = load.demand, stopping = victims.len(), "Scaling down");
                    }
                    for name in victims {
                        match self.terminate(&name).await {
                            Ok(_) => report.stopped += 1,
                            // Already gone through another path.
                            Err(FleetError::NotFound(_)) => {}
                            Err(_) => report.failures += 1,
                        }
                    }
                }
                ScaleDecision::Hold => {}
            }
        }
    }

    /// Reads the group's registry listing and repairs drift against the table.
    /// Registrations with no entry are withdrawn and `Running` entries the
    /// registry lost are registered again. Demand counts tracked instances only.
    async fn observe_load(&self, group: &GroupSpec, report: &mut TickReport) -> FleetResult<GroupLoad> {
        let listed = self
            .inner
            .registry
            .list_matching_prefix(&group.instance_prefix())
            .await?;

        let (stale, lost, mut players) = {
            let state = self.inner.state.lock().await;
            let listed_names: HashSet<&str> = listed.iter().map(|l| l.name.as_str()).collect();
            let stale: Vec<String> = listed
                .iter()
                .filter(|l| !state.contains(&l.name))
                .map(|l| l.name.clone())
                .collect();
            let lost: Vec<Instance> = state
                .instances_of(&group.name_prefix)
                .into_iter()
                .filter(|i| i.state == InstanceState::Running && !listed_names.contains(i.name.as_str()))
                .collect();
            let players: HashMap<String, u32> = listed
                .iter()
                .filter(|l| state.get(&l.name).is_some_and(|i| i.group == group.name_prefix))
                .map(|l| (l.name.clone(), l.players))
                .collect();
            (stale, lost, players)
        };

        for name in stale {
            warn!(event = "REGISTRY_STALE_ENTRY", instance = %name, group = %group.name_prefix, "Registered server has no instance, unregistering");
            match self.inner.registry.unregister(&name).await {
                Ok(()) => report.healed += 1,
                Err(e) => {
                    warn!(event = "REGISTRY_UNREGISTER_FAILED", instance = %name, error = %e, "Unregister failed");
                    report.failures += 1;
                }
            }
        }

        for instance in lost {
            warn!(event = "REGISTRY_ENTRY_LOST", instance = %instance.name, endpoint = %instance.endpoint, "Running instance missing from registry, registering again");
            if let Err(e) = self
                .inner
                .registry
                .register(&instance.name, &instance.endpoint, self.inner.settings.auto_register)
                .await
            {
                warn!(event = "REGISTRY_REGISTER_FAILED", instance = %instance.name, error = %e, "Re-register failed");
                report.failures += 1;
                continue;
            }

            let still_tracked = self
                .inner
                .state
                .lock()
                .await
                .get(&instance.name)
                .is_some_and(|i| i.container_id == instance.container_id);
            if !still_tracked {
                // Terminated while we were registering it.
                if let Err(e) = self.inner.registry.unregister(&instance.name).await {
                    warn!(event = "REGISTRY_UNREGISTER_FAILED", instance = %instance.name, error = %e, "Unregister failed");
                }
                continue;
            }
            report.healed += 1;
            players.insert(instance.name, 0);
        }

        let demand = players.values().map(|p| u64::from(*p)).sum();
        Ok(GroupLoad { demand, players })
    }

    async fn heal_phase(&self, report: &mut TickReport) {
        // Snapshot: replacements launched below are not re-examined this tick.
        let snapshot = self.inner.state.lock().await.snapshot();
        let mut refilled = HashSet::new();

        for instance in snapshot {
            if instance.state == InstanceState::Terminating {
                continue;
            }

            let observed = match self.observe(&instance).await {
                Ok(observed) => observed,
                Err(e) => {
                    warn!(event = "HEALTH_CHECK_FAILED", instance = %instance.name, error = %e, "Could not inspect container");
                    report.failures += 1;
                    continue;
                }
            };

            match observed {
                Observed::Healthy => {}
                Observed::Gone => {
                    if !self.forget(&instance).await {
                        continue;
                    }
                    report.healed += 1;
                    if refilled.insert(instance.group.clone()) {
                        self.refill(&instance.group, report).await;
                    }
                }
                Observed::Failed(state) => match self.retire(&instance, state).await {
                    Ok(false) => {}
                    Ok(true) => {
                        report.healed += 1;
                        if state.is_terminal() {
                            continue;
                        }
                        let Some(group) = self.group(&instance.group).cloned() else {
                            continue;
                        };
                        match self.launch(&group).await {
                            Ok(_) => report.created += 1,
                            Err(_) => report.failures += 1,
                        }
                    }
                    Err(_) => report.failures += 1,
                },
            }
        }
    }

    async fn observe(&self, instance: &Instance) -> FleetResult<Observed> {
        if !self.inner.runtime.exists(&instance.container_id).await? {
            return Ok(Observed::Gone);
        }
        // Provisioning entries belong to their in-flight launch; existence is all we check.
        if instance.state == InstanceState::Provisioning {
            return Ok(Observed::Healthy);
        }

        match self.inner.runtime.state(&instance.container_id).await {
            Ok(ContainerState::Running) if instance.state == InstanceState::Running => Ok(Observed::Healthy),
            Ok(state) => Ok(Observed::Failed(state)),
            Err(RuntimeError::NotFound(_)) => Ok(Observed::Gone),
            Err(e) => Err(e.into()),
        }
    }

    /// Drops an entry whose container vanished. False if another path already did.
    async fn forget(&self, instance: &Instance) -> bool {
        let removed = self
            .inner
            .state
            .lock()
            .await
            .remove_if_container(&instance.name, &instance.container_id)
            .is_some();
        if !removed {
            return false;
        }

        error!(
            event = "INSTANCE_VANISHED",
            instance = %instance.name,
            container.id = %instance.short_id(),
            "Container no longer exists, dropping instance"
        );
        if let Err(e) = self.inner.registry.unregister(&instance.name).await {
            warn!(event = "REGISTRY_UNREGISTER_FAILED", instance = %instance.name, error = %e, "Unregister failed");
        }
        true
    }

    /// The up-sizing half of the scale phase, re-run for one group after
    /// capacity was lost to an external deletion.
    async fn refill(&self, prefix: &str, report: &mut TickReport) {
        let Some(group) = self.group(prefix).cloned() else {
            return;
        };
        let live = self.inner.state.lock().await.live_count(prefix);
        let load = match self.observe_load(&group, report).await {
            Ok(load) => load,
            Err(e) => {
                warn!(event = "LOAD_QUERY_FAILED", group = %prefix, error = %e, "Could not read demand for refill");
                report.failures += 1;
                return;
            }
        };

        if decide(&group, live, load.demand) == ScaleDecision::Up {
            info!(event = "CAPACITY_REFILL", group = %prefix, live, demand = load.demand, "Replacing lost capacity");
            match self.launch(&group).await {
                Ok(_) => report.created += 1,
                Err(_) => report.failures += 1,
            }
        }
    }

    /// Marks the entry unhealthy, unregisters it, tears the container down and
    /// drops the entry. On teardown failure the entry stays `Unhealthy` for the
    /// next tick. Returns false if the entry changed under us.
    async fn retire(&self, instance: &Instance, observed: ContainerState) -> FleetResult<bool> {
        let marked = self.inner.state.lock().await.transition(
            &instance.name,
            &instance.container_id,
            &[InstanceState::Running, InstanceState::Unhealthy],
            InstanceState::Unhealthy,
        );
        if !marked {
            return Ok(false);
        }

        if observed.is_terminal() {
            error!(event = "INSTANCE_EXITED", instance = %instance.name, state = %observed, "Instance exited, removing");
        } else {
            warn!(event = "INSTANCE_UNHEALTHY", instance = %instance.name, state = %observed, "Instance unhealthy, replacing");
        }

        if let Err(e) = self.inner.registry.unregister(&instance.name).await {
            warn!(event = "REGISTRY_UNREGISTER_FAILED", instance = %instance.name, error = %e, "Unregister failed");
        }

        let teardown = async {
            if !observed.is_terminal() {
                self.inner.runtime.stop(&instance.container_id).await?;
            }
            self.inner.runtime.remove(&instance.container_id, false).await
        };
        if let Err(e) = teardown.await {
            error!(
                event = "INSTANCE_REMOVE_FAILED",
                instance = %instance.name,
                error = %e,
                "Teardown failed, keeping entry for next tick"
            );
            return Err(e.into());
        }

        self.inner
            .state
            .lock()
            .await
            .remove_if_container(&instance.name, &instance.container_id);
        Ok(true)
    }

    // ── Read side (facade) ──────────────────────────────────────────

    pub async fn running_instance_names(&self) -> Vec<String> {
        self.inner.state.lock().await.names_in_state(InstanceState::Running)
    }

    pub async fn is_known(&self, name: &str) -> bool {
        self.inner.state.lock().await.contains(name)
    }

    pub async fn instance(&self, name: &str) -> Option<Instance> {
        self.inner.state.lock().await.get(name).cloned()
    }

    pub async fn instances(&self) -> Vec<Instance> {
        self.inner.state.lock().await.snapshot()
    }

    pub async fn known_images(&self) -> Vec<String> {
        let mut images: Vec<_> = self.inner.state.lock().await.known_images().iter().cloned().collect();
        images.sort();
        images
    }

    pub async fn group_statuses(&self) -> Vec<GroupStatus> {
        let state = self.inner.state.lock().await;
        self.inner
            .groups
            .iter()
            .map(|g| GroupStatus {
                spec: g.clone(),
                live: state.live_count(&g.name_prefix),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::domain::Endpoint;

    fn lobby() -> GroupSpec {
        GroupSpec {
            name_prefix: "lobby".into(),
            image: "lobby".into(),
            image_tag: "latest".into(),
            min_instances: 1,
            max_instances: 3,
            max_players_per_instance: 20,
            downscale_if_empty: true,
        }
    }

    fn running(name: &str) -> Instance {
        Instance {
            name: name.into(),
            container_id: format!("c-{name}"),
            group: "lobby".into(),
            endpoint: Endpoint::new("127.0.0.1", 30000),
            state: InstanceState::Running,
            created_at: Utc::now(),
        }
    }

    fn players(entries: &[(&str, u32)]) -> HashMap<String, u32> {
        entries.iter().map(|(n, p)| (n.to_string(), *p)).collect()
    }

    #[test]
    fn fills_to_min_regardless_of_demand() {
        assert_eq!(decide(&lobby(), 0, 0), ScaleDecision::Up);
    }

    #[test]
    fn scales_up_only_above_capacity() {
        let g = lobby();
        assert_eq!(decide(&g, 1, 20), ScaleDecision::Hold);
        assert_eq!(decide(&g, 1, 21), ScaleDecision::Up);
        assert_eq!(decide(&g, 1, 25), ScaleDecision::Up);
    }

    #[test]
    fn never_scales_past_max() {
        let g = lobby();
        assert_eq!(decide(&g, 3, 1000), ScaleDecision::Down);
        let mut g = lobby();
        g.downscale_if_empty = false;
        assert_eq!(decide(&g, 3, 1000), ScaleDecision::Hold);
    }

    #[test]
    fn downscale_disabled_holds() {
        let mut g = lobby();
        g.downscale_if_empty = false;
        assert_eq!(decide(&g, 2, 0), ScaleDecision::Hold);
    }

    #[test]
    fn candidates_stop_at_min() {
        let g = lobby();
        let fleet = vec![running("lobby-a"), running("lobby-b"), running("lobby-c")];
        let loads = players(&[("lobby-a", 0), ("lobby-b", 0), ("lobby-c", 0)]);
        let victims = downscale_candidates(&g, &fleet, &loads, 3, 0);
        assert_eq!(victims, vec!["lobby-a", "lobby-b"]);
    }

    #[test]
    fn candidates_are_below_half_capacity_emptiest_first() {
        let g = lobby();
        let fleet = vec![running("lobby-a"), running("lobby-b"), running("lobby-c")];
        let loads = players(&[("lobby-a", 9), ("lobby-b", 10), ("lobby-c", 2)]);
        let victims = downscale_candidates(&g, &fleet, &loads, 3, 21);
        assert_eq!(victims, vec!["lobby-c"]);
    }

    #[test]
    fn candidates_keep_capacity_for_current_demand() {
        let g = lobby();
        let fleet = vec![running("lobby-a"), running("lobby-b")];
        let loads = players(&[("lobby-a", 25), ("lobby-b", 0)]);
        assert!(downscale_candidates(&g, &fleet, &loads, 2, 25).is_empty());
    }

    #[test]
    fn unregistered_or_provisioning_instances_are_not_candidates() {
        let g = lobby();
        let mut provisioning = running("lobby-b");
        provisioning.state = InstanceState::Provisioning;
        let fleet = vec![running("lobby-a"), provisioning, running("lobby-c")];
        let loads = players(&[("lobby-b", 0)]);
        assert!(downscale_candidates(&g, &fleet, &loads, 3, 0).is_empty());
    }
}
