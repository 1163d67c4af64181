//! Read and admin operations over the fleet, for callers outside the controller.

use crate::core::controller::FleetController;
use crate::core::domain::{GroupStatus, Instance, TickReport};
use crate::core::error::FleetResult;

#[derive(Clone)]
pub struct CloudApi {
    controller: FleetController,
}

impl CloudApi {
    pub fn new(controller: FleetController) -> Self {
        Self { controller }
    }

    /// Names of registered, running instances.
    pub async fn list_running_instance_names(&self) -> Vec<String> {
        self.controller.running_instance_names().await
    }

    pub async fn is_known(&self, name: &str) -> bool {
        self.controller.is_known(name).await
    }

    pub async fn instance(&self, name: &str) -> Option<Instance> {
        self.controller.instance(name).await
    }

    /// Stops `name` and launches a replacement in its group. `NotFound` if the
    /// name is not in the table.
    pub async fn restart(&self, name: &str) -> FleetResult<Instance> {
        self.controller.restart(name).await
    }

    pub async fn groups(&self) -> Vec<GroupStatus> {
        self.controller.group_statuses().await
    }

    pub async fn reconcile_now(&self) -> TickReport {
        self.controller.reconcile().await
    }
}
