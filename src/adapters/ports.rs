//! Host port allocation for new containers.
//!
//! The live set of bound ports always comes from the runtime (queried right
//! before a bind); the allocator only adds the ports other in-flight creates
//! in this process have claimed but not bound yet.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::core::domain::ContainerDescriptor;

/// Inclusive `[low, high]` host port range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PortRange {
    pub low: u16,
    pub high: u16,
}

impl PortRange {
    pub fn new(low: u16, high: u16) -> Option<Self> {
        (low > 0 && low <= high).then_some(Self { low, high })
    }

    pub fn len(&self) -> usize {
        usize::from(self.high - self.low) + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.low..=self.high).contains(&port)
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.low, self.high)
    }
}

#[derive(Clone, Debug)]
pub struct PortAllocator {
    range: PortRange,
    in_flight: Arc<Mutex<BTreeSet<u16>>>,
}

impl PortAllocator {
    pub fn new(range: PortRange) -> Self {
        Self {
            range,
            in_flight: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    /// Claims the lowest port that is neither bound, claimed by another
    /// in-flight create, nor already tried by this caller (`skip`).
    pub fn reserve(&self, bound: &HashSet<u16>, skip: &BTreeSet<u16>) -> Option<PortLease> {
        let mut in_flight = lock(&self.in_flight);
        let port = (self.range.low..=self.range.high)
            .find(|p| !bound.contains(p) && !in_flight.contains(p) && !skip.contains(p))?;
        in_flight.insert(port);
        Some(PortLease {
            port,
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    pub fn in_flight(&self) -> usize {
        lock(&self.in_flight).len()
    }
}

/// A claimed port. Released back to the allocator on drop; by then the
/// container either holds the binding or the attempt failed.
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    in_flight: Arc<Mutex<BTreeSet<u16>>>,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        lock(&self.in_flight).remove(&self.port);
    }
}

/// Host ports published by any container, running or not.
pub fn bound_ports(containers: &[ContainerDescriptor]) -> HashSet<u16> {
    containers
        .iter()
        .flat_map(|c| c.public_ports.iter().copied())
        .collect()
}

fn lock(set: &Mutex<BTreeSet<u16>>) -> MutexGuard<'_, BTreeSet<u16>> {
    set.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::domain::ContainerState;

    fn allocator(low: u16, high: u16) -> PortAllocator {
        PortAllocator::new(PortRange::new(low, high).unwrap())
    }

    #[test]
    fn range_rejects_inverted_and_zero() {
        assert!(PortRange::new(30010, 30000).is_none());
        assert!(PortRange::new(0, 10).is_none());
        assert_eq!(PortRange::new(30000, 30009).unwrap().len(), 10);
        assert_eq!(PortRange::new(5, 5).unwrap().to_string(), "5:5");
    }

    #[test]
    fn picks_lowest_unbound_port() {
        let alloc = allocator(30000, 30005);
        let bound: HashSet<u16> = [30000, 30001, 30003].into_iter().collect();
        let lease = alloc.reserve(&bound, &BTreeSet::new()).unwrap();
        assert_eq!(lease.port(), 30002);
    }

    #[test]
    fn concurrent_leases_never_share_a_port() {
        let alloc = allocator(30000, 30002);
        let none = HashSet::new();
        let a = alloc.reserve(&none, &BTreeSet::new()).unwrap();
        let b = alloc.reserve(&none, &BTreeSet::new()).unwrap();
        let c = alloc.reserve(&none, &BTreeSet::new()).unwrap();
        assert_eq!((a.port(), b.port(), c.port()), (30000, 30001, 30002));
        assert!(alloc.reserve(&none, &BTreeSet::new()).is_none());

        drop(b);
        assert_eq!(alloc.in_flight(), 2);
        let again = alloc.reserve(&none, &BTreeSet::new()).unwrap();
        assert_eq!(again.port(), 30001);
    }

    #[test]
    fn skip_set_moves_past_failed_candidates() {
        let alloc = allocator(30000, 30002);
        let skip: BTreeSet<u16> = [30000].into_iter().collect();
        let lease = alloc.reserve(&HashSet::new(), &skip).unwrap();
        assert_eq!(lease.port(), 30001);
    }

    #[test]
    fn bound_ports_collects_every_published_port() {
        let containers = vec![
            ContainerDescriptor {
                id: "a".into(),
                name: "a".into(),
                image: "x:latest".into(),
                state: ContainerState::Running,
                public_ports: vec![30000],
            },
            ContainerDescriptor {
                id: "b".into(),
                name: "b".into(),
                image: "y:latest".into(),
                state: ContainerState::Exited,
                public_ports: vec![30004, 8080],
            },
        ];
        let bound = bound_ports(&containers);
        assert_eq!(bound.len(), 3);
        assert!(bound.contains(&30004));
    }
}
