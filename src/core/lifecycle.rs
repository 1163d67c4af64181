//! Process subsystems and their start/stop lifecycle.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::core::controller::FleetController;
use crate::core::error::FleetError;
use crate::core::trigger::ReconcileTrigger;

/// A long-lived part of the process, started and stopped by `main` in a fixed order.
#[async_trait]
pub trait Subsystem: Send + Sync {
    fn name(&self) -> &'static str;

    async fn start(&self) -> anyhow::Result<()>;

    async fn stop(&self) -> anyhow::Result<()>;
}

/// The fleet controller plus the trigger that drives it.
pub struct FleetService {
    controller: FleetController,
    interval: Duration,
    trigger: Mutex<Option<ReconcileTrigger>>,
}

impl FleetService {
    pub fn new(controller: FleetController, interval: Duration) -> Self {
        Self {
            controller,
            interval,
            trigger: Mutex::new(None),
        }
    }

    pub fn controller(&self) -> &FleetController {
        &self.controller
    }
}

#[async_trait]
impl Subsystem for FleetService {
    fn name(&self) -> &'static str {
        "fleet"
    }

    async fn start(&self) -> anyhow::Result<()> {
        match self.controller.start().await {
            Ok(()) => {}
            // Missing capacity is retried by the reconcile loop.
            Err(FleetError::PartialFailure { failed, total }) => {
                warn!(event = "FLEET_START_DEGRADED", failed, total, "Some initial instances failed to launch");
            }
            Err(e) => return Err(e.into()),
        }

        let mut trigger = self.trigger.lock().await;
        if trigger.is_none() {
            *trigger = Some(ReconcileTrigger::spawn(self.controller.clone(), self.interval));
        }
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        if let Some(trigger) = self.trigger.lock().await.take() {
            trigger.cancel().await;
        }
        self.controller.shutdown().await?;
        info!(event = "FLEET_STOPPED", "Fleet service stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::adapters::mock::MockRuntime;
    use crate::adapters::ports::PortRange;
    use crate::adapters::registry::InMemoryRegistry;
    use crate::core::controller::ControllerSettings;
    use crate::core::domain::GroupSpec;

    #[tokio::test]
    async fn start_fills_and_stop_tears_down() {
        let runtime = MockRuntime::new(PortRange::new(30000, 30010).unwrap());
        let registry = Arc::new(InMemoryRegistry::new());
        let group = GroupSpec {
            name_prefix: "lobby".into(),
            image: "lobby".into(),
            image_tag: "latest".into(),
            min_instances: 2,
            max_instances: 4,
            max_players_per_instance: 10,
            downscale_if_empty: true,
        };
        let controller = FleetController::new(
            vec![group],
            Arc::new(runtime.clone()),
            registry.clone(),
            ControllerSettings {
                registration_delay: Duration::ZERO,
                ..ControllerSettings::default()
            },
        );
        let service = FleetService::new(controller, Duration::from_secs(3600));

        service.start().await.unwrap();
        assert_eq!(service.name(), "fleet");
        assert_eq!(runtime.running_count(), 2);
        assert_eq!(registry.len(), 2);

        service.stop().await.unwrap();
        assert!(runtime.containers().is_empty());
        assert!(registry.is_empty());
        assert!(service.controller().instances().await.is_empty());
    }
}
