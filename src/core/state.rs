//! The controller's authoritative instance table.
//!
//! `FleetState` itself is plain data; the controller keeps it behind a single
//! `tokio::sync::Mutex` and every read-modify-write happens under that lock.

use std::collections::{HashMap, HashSet};

use crate::core::domain::{Instance, InstanceState};

#[derive(Debug, Default)]
pub struct FleetState {
    instances: HashMap<String, Instance>,
    known_images: HashSet<String>,
}

impl FleetState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a new entry. Returns false, leaving the table untouched, if the name is taken.
    pub fn insert(&mut self, instance: Instance) -> bool {
        if self.instances.contains_key(&instance.name) {
            return false;
        }
        self.instances.insert(instance.name.clone(), instance);
        true
    }

    pub fn remove(&mut self, name: &str) -> Option<Instance> {
        self.instances.remove(name)
    }

    /// Removes the entry only if it still points at `container_id`.
    pub fn remove_if_container(&mut self, name: &str, container_id: &str) -> Option<Instance> {
        match self.instances.get(name) {
            Some(i) if i.container_id == container_id => self.instances.remove(name),
            _ => None,
        }
    }

    /// Compare-and-set on the entry's state. Succeeds only if the entry still
    /// exists, still points at `container_id` and is currently in one of `from`.
    pub fn transition(
        &mut self,
        name: &str,
        container_id: &str,
        from: &[InstanceState],
        to: InstanceState,
    ) -> bool {
        match self.instances.get_mut(name) {
            Some(i) if i.container_id == container_id && from.contains(&i.state) => {
                i.state = to;
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, name: &str) -> Option<&Instance> {
        self.instances.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.instances.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn live_count(&self, group: &str) -> u32 {
        self.instances.values().filter(|i| i.group == group).count() as u32
    }

    pub fn instances_of(&self, group: &str) -> Vec<Instance> {
        let mut out: Vec<_> = self
            .instances
            .values()
            .filter(|i| i.group == group)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Copy of every entry, ordered by name.
    pub fn snapshot(&self) -> Vec<Instance> {
        let mut out: Vec<_> = self.instances.values().cloned().collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.instances.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn names_in_state(&self, state: InstanceState) -> Vec<String> {
        let mut names: Vec<_> = self
            .instances
            .values()
            .filter(|i| i.state == state)
            .map(|i| i.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn container_ids(&self) -> HashSet<String> {
        self.instances.values().map(|i| i.container_id.clone()).collect()
    }

    pub fn add_known_image(&mut self, image: impl Into<String>) -> bool {
        self.known_images.insert(image.into())
    }

    pub fn is_known_image(&self, image: &str) -> bool {
        self.known_images.contains(image)
    }

    pub fn known_images(&self) -> &HashSet<String> {
        &self.known_images
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::domain::Endpoint;
    use chrono::Utc;

    fn instance(name: &str, group: &str, container: &str) -> Instance {
        Instance {
            name: name.to_string(),
            container_id: container.to_string(),
            group: group.to_string(),
            endpoint: Endpoint::new("127.0.0.1", 30000),
            state: InstanceState::Provisioning,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn insert_rejects_duplicate_names() {
        let mut state = FleetState::new();
        assert!(state.insert(instance("lobby-a", "lobby", "c1")));
        assert!(!state.insert(instance("lobby-a", "lobby", "c2")));
        assert_eq!(state.get("lobby-a").unwrap().container_id, "c1");
        assert_eq!(state.len(), 1);
    }

    #[test]
    fn transition_checks_container_and_source_state() {
        let mut state = FleetState::new();
        state.insert(instance("lobby-a", "lobby", "c1"));

        assert!(!state.transition("lobby-a", "other", &[InstanceState::Provisioning], InstanceState::Running));
        assert!(!state.transition("lobby-a", "c1", &[InstanceState::Unhealthy], InstanceState::Running));
        assert!(state.transition("lobby-a", "c1", &[InstanceState::Provisioning], InstanceState::Running));
        assert_eq!(state.get("lobby-a").unwrap().state, InstanceState::Running);
        assert!(!state.transition("missing", "c1", &[InstanceState::Running], InstanceState::Unhealthy));
    }

    #[test]
    fn remove_if_container_ignores_replaced_entries() {
        let mut state = FleetState::new();
        state.insert(instance("lobby-a", "lobby", "c1"));
        assert!(state.remove_if_container("lobby-a", "c0").is_none());
        assert!(state.remove_if_container("lobby-a", "c1").is_some());
        assert!(state.is_empty());
    }

    #[test]
    fn counts_are_per_group() {
        let mut state = FleetState::new();
        state.insert(instance("lobby-a", "lobby", "c1"));
        state.insert(instance("lobby-b", "lobby", "c2"));
        state.insert(instance("bedwars-a", "bedwars", "c3"));

        assert_eq!(state.live_count("lobby"), 2);
        assert_eq!(state.live_count("bedwars"), 1);
        assert_eq!(state.live_count("skywars"), 0);
        assert_eq!(state.instances_of("lobby").len(), 2);
        assert_eq!(state.names(), vec!["bedwars-a", "lobby-a", "lobby-b"]);
        assert!(state.container_ids().contains("c3"));
    }

    #[test]
    fn known_images_are_a_set() {
        let mut state = FleetState::new();
        assert!(state.add_known_image("lobby:latest"));
        assert!(!state.add_known_image("lobby:latest"));
        assert!(state.is_known_image("lobby:latest"));
        assert!(!state.is_known_image("nginx:latest"));
    }
}
