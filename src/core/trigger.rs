//! Periodic reconcile trigger.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::core::controller::FleetController;

pub struct ReconcileTrigger {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ReconcileTrigger {
    /// Fires `reconcile()` every `interval`, starting one interval from now.
    /// Ticks that would overlap a slow one are delayed, never stacked.
    pub fn spawn(controller: FleetController, interval: Duration) -> Self {
        let (shutdown, mut rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(event = "TRIGGER_STARTED", interval_secs = interval.as_secs(), "Reconcile trigger armed");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = controller.reconcile().await;
                        if report.skipped {
                            debug!(event = "TRIGGER_TICK_SKIPPED", "Tick skipped, another one in flight");
                        }
                    }
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!(event = "TRIGGER_STOPPED", "Reconcile trigger cancelled");
        });

        Self { shutdown, handle }
    }

    /// Cancels all future ticks and waits for the loop to exit. A tick that is
    /// already running completes first.
    pub async fn cancel(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            warn!(event = "TRIGGER_JOIN_FAILED", error = %e, "Trigger task ended abnormally");
        }
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

    fn controller(runtime: MockRuntime) -> FleetController {
        let group = GroupSpec {
            name_prefix: "lobby".into(),
            image: "lobby".into(),
            image_tag: "latest".into(),
            min_instances: 1,
            max_instances: 1,
            max_players_per_instance: 10,
            downscale_if_empty: true,
        };
        let settings = ControllerSettings {
            registration_delay: Duration::ZERO,
            ..ControllerSettings::default()
        };
        FleetController::new(
            vec![group],
            Arc::new(runtime),
            Arc::new(InMemoryRegistry::new()),
            settings,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_fill_the_fleet_until_cancelled() {
        let runtime = MockRuntime::new(PortRange::new(30000, 30010).unwrap());
        let trigger = ReconcileTrigger::spawn(controller(runtime.clone()), Duration::from_secs(30));

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(runtime.creates(), 1);

        trigger.cancel().await;
        runtime.delete_externally(&runtime.containers()[0].id);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(runtime.creates(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn first_tick_waits_one_interval() {
        let runtime = MockRuntime::new(PortRange::new(30000, 30010).unwrap());
        let trigger = ReconcileTrigger::spawn(controller(runtime.clone()), Duration::from_secs(60));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(runtime.creates(), 0);
        trigger.cancel().await;
    }
}
