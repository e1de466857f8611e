//! Budget-constrained admission: which instances should be realized.
//!
//! The policy is a pure function of the registry snapshot (entities plus the
//! observers held by its spatial index), the budget and the streaming
//! distance. It never fails and never mutates anything.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use streamer_common::{EntityId, ObserverId};

use crate::registry::{EntityRegistry, InstanceKey, Priority};

/// Whether realized objects are shared by all observers or private to each.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RealizationMode {
    /// One realized set shared by everybody (e.g. vehicles).
    #[default]
    Global,
    /// Every observer has its own visible set (e.g. personal collectables).
    PerObserver,
}

/// Caps on concurrently realized instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budget {
    pub global: usize,
    pub per_observer: Option<usize>,
}

impl Budget {
    pub fn new(global: usize) -> Self {
        Self {
            global,
            per_observer: None,
        }
    }

    pub fn with_per_observer(mut self, cap: usize) -> Self {
        self.per_observer = Some(cap);
        self
    }
}

/// Instances that should be realized after a tick, in admission order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredSet {
    ranked: Vec<InstanceKey>,
    members: BTreeSet<InstanceKey>,
}

impl DesiredSet {
    fn push(&mut self, key: InstanceKey) {
        if self.members.insert(key) {
            self.ranked.push(key);
        }
    }

    pub fn contains(&self, key: &InstanceKey) -> bool {
        self.members.contains(key)
    }

    /// Keys in admission order: always-realized first, then nearest first.
    pub fn iter(&self) -> impl Iterator<Item = &InstanceKey> {
        self.ranked.iter()
    }

    /// Distinct entities, in id order.
    pub fn entities(&self) -> BTreeSet<EntityId> {
        self.members.iter().map(|key| key.entity).collect()
    }

    pub fn len(&self) -> usize {
        self.ranked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranked.is_empty()
    }
}

/// Nearest observer claiming an entity.
#[derive(Debug, Clone, Copy)]
struct Claim {
    distance: f32,
    observer: ObserverId,
}

/// Tracks how many admissions each observer has been charged.
struct Quotas {
    cap: Option<usize>,
    used: BTreeMap<ObserverId, usize>,
}

impl Quotas {
    fn new(cap: Option<usize>) -> Self {
        Self {
            cap,
            used: BTreeMap::new(),
        }
    }

    fn try_charge(&mut self, observer: ObserverId) -> bool {
        let used = self.used.entry(observer).or_default();
        if self.cap.is_some_and(|cap| *used >= cap) {
            return false;
        }
        *used += 1;
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamingPolicy {
    pub mode: RealizationMode,
    pub streaming_distance: f32,
}

impl StreamingPolicy {
    pub fn new(mode: RealizationMode, streaming_distance: f32) -> Self {
        Self {
            mode,
            streaming_distance,
        }
    }

    /// Compute the desired set for the current registry snapshot.
    pub fn desired(&self, registry: &EntityRegistry, budget: &Budget) -> DesiredSet {
        if budget.global == 0 {
            return DesiredSet::default();
        }
        match self.mode {
            RealizationMode::Global => self.desired_global(registry, budget),
            RealizationMode::PerObserver => self.desired_per_observer(registry, budget),
        }
    }

    fn desired_global(&self, registry: &EntityRegistry, budget: &Budget) -> DesiredSet {
        let mut desired = DesiredSet::default();
        for id in always_realized(registry) {
            if desired.len() >= budget.global {
                return desired;
            }
            desired.push(InstanceKey::shared(id));
        }

        // Observers are visited in id order and only a strictly nearer one
        // replaces a claim, so ties go to the lower observer id.
        let index = registry.spatial();
        let mut claims: BTreeMap<EntityId, Claim> = BTreeMap::new();
        for (observer, state) in index.observers() {
            for neighbor in
                index.nearest_entities(state.position, state.partition, self.streaming_distance)
            {
                if !is_proximity(registry, neighbor.id) {
                    continue;
                }
                let claim = Claim {
                    distance: neighbor.distance,
                    observer,
                };
                claims
                    .entry(neighbor.id)
                    .and_modify(|c| {
                        if claim.distance < c.distance {
                            *c = claim;
                        }
                    })
                    .or_insert(claim);
            }
        }

        let mut ranked: Vec<(EntityId, Claim)> = claims.into_iter().collect();
        ranked.sort_by(|(a_id, a), (b_id, b)| {
            a.distance.total_cmp(&b.distance).then(a_id.cmp(b_id))
        });

        let mut quotas = Quotas::new(budget.per_observer);
        for (id, claim) in ranked {
            if desired.len() >= budget.global {
                break;
            }
            if quotas.try_charge(claim.observer) {
                desired.push(InstanceKey::shared(id));
            }
        }
        desired
    }

    fn desired_per_observer(&self, registry: &EntityRegistry, budget: &Budget) -> DesiredSet {
        let mut desired = DesiredSet::default();
        let index = registry.spatial();
        let mut quotas = Quotas::new(budget.per_observer);

        for id in always_realized(registry) {
            for (observer, _) in index.observers() {
                if desired.len() >= budget.global {
                    return desired;
                }
                if quotas.try_charge(observer) {
                    desired.push(InstanceKey::for_observer(id, observer));
                }
            }
        }

        let mut pairs: Vec<(f32, EntityId, ObserverId)> = Vec::new();
        for (observer, state) in index.observers() {
            for neighbor in
                index.nearest_entities(state.position, state.partition, self.streaming_distance)
            {
                if is_proximity(registry, neighbor.id) {
                    pairs.push((neighbor.distance, neighbor.id, observer));
                }
            }
        }
        pairs.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));

        for (_, id, observer) in pairs {
            if desired.len() >= budget.global {
                break;
            }
            if quotas.try_charge(observer) {
                desired.push(InstanceKey::for_observer(id, observer));
            }
        }
        desired
    }
}

fn always_realized(registry: &EntityRegistry) -> impl Iterator<Item = EntityId> + '_ {
    registry
        .all_entities()
        .filter(|record| record.definition.priority == Priority::Always)
        .map(|record| record.id)
}

fn is_proximity(registry: &EntityRegistry, id: EntityId) -> bool {
    registry
        .get(id)
        .is_ok_and(|record| record.definition.priority == Priority::Proximity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::EntityDefinition;
    use glam::Vec3;
    use streamer_common::WorldPartition;

    const MAIN: WorldPartition = WorldPartition::MAIN;

    fn at(x: f32) -> EntityDefinition {
        EntityDefinition::new(400, Vec3::new(x, 0.0, 0.0))
    }

    fn shared(ids: &[EntityId]) -> Vec<InstanceKey> {
        ids.iter().copied().map(InstanceKey::shared).collect()
    }

    fn global(distance: f32) -> StreamingPolicy {
        StreamingPolicy::new(RealizationMode::Global, distance)
    }

    #[test]
    fn budget_cuts_off_far_candidates() {
        let mut registry = EntityRegistry::new(16.0);
        let far = registry.register(at(15.0)).unwrap();
        let near = registry.register(at(5.0)).unwrap();
        let mid = registry.register(at(10.0)).unwrap();
        registry.update_observer(ObserverId(1), Vec3::ZERO, MAIN);

        let desired = global(20.0).desired(&registry, &Budget::new(2));
        let keys: Vec<InstanceKey> = desired.iter().copied().collect();
        assert_eq!(keys, shared(&[near, mid]));
        assert!(!desired.contains(&InstanceKey::shared(far)));
    }

    #[test]
    fn always_realized_ignores_distance_and_goes_first() {
        let mut registry = EntityRegistry::new(16.0);
        let pinned = registry
            .register(at(10_000.0).with_priority(Priority::Always))
            .unwrap();
        let nearby: Vec<EntityId> = (1..=6)
            .map(|i| registry.register(at(i as f32)).unwrap())
            .collect();
        registry.update_observer(ObserverId(1), Vec3::ZERO, MAIN);

        let desired = global(20.0).desired(&registry, &Budget::new(5));
        let keys: Vec<InstanceKey> = desired.iter().copied().collect();
        let mut expected = vec![InstanceKey::shared(pinned)];
        expected.extend(shared(&nearby[..4]));
        assert_eq!(keys, expected);
    }

    #[test]
    fn no_observers_leaves_only_always_realized() {
        let mut registry = EntityRegistry::new(16.0);
        let pinned = registry.register(at(0.0).with_priority(Priority::Always)).unwrap();
        registry.register(at(1.0)).unwrap();

        let desired = global(20.0).desired(&registry, &Budget::new(10));
        assert_eq!(desired.iter().copied().collect::<Vec<_>>(), shared(&[pinned]));
    }

    #[test]
    fn zero_budget_is_empty() {
        let mut registry = EntityRegistry::new(16.0);
        registry.register(at(0.0).with_priority(Priority::Always)).unwrap();
        registry.register(at(1.0)).unwrap();
        registry.update_observer(ObserverId(1), Vec3::ZERO, MAIN);

        assert!(global(20.0).desired(&registry, &Budget::new(0)).is_empty());
    }

    #[test]
    fn always_realized_beyond_budget_truncated_by_id() {
        let mut registry = EntityRegistry::new(16.0);
        let ids: Vec<EntityId> = (0..3)
            .map(|_| {
                registry
                    .register(at(0.0).with_priority(Priority::Always))
                    .unwrap()
            })
            .collect();
        let desired = global(20.0).desired(&registry, &Budget::new(2));
        assert_eq!(desired.iter().copied().collect::<Vec<_>>(), shared(&ids[..2]));
    }

    #[test]
    fn minimum_distance_over_observers_ranks() {
        let mut registry = EntityRegistry::new(16.0);
        // 8 from observer 1, 3 from observer 2.
        let a = registry.register(at(8.0)).unwrap();
        // 5 from observer 1, 6 from observer 2.
        let b = registry.register(at(-5.0)).unwrap();
        registry.update_observer(ObserverId(1), Vec3::ZERO, MAIN);
        registry.update_observer(ObserverId(2), Vec3::new(11.0, 0.0, 0.0), MAIN);

        let desired = global(50.0).desired(&registry, &Budget::new(1));
        assert_eq!(desired.iter().copied().collect::<Vec<_>>(), shared(&[a]));
        assert!(!desired.contains(&InstanceKey::shared(b)));
    }

    #[test]
    fn equal_distances_break_ties_by_id() {
        let mut registry = EntityRegistry::new(16.0);
        let left = registry.register(at(-4.0)).unwrap();
        let right = registry.register(at(4.0)).unwrap();
        registry.update_observer(ObserverId(1), Vec3::ZERO, MAIN);

        let desired = global(10.0).desired(&registry, &Budget::new(1));
        assert_eq!(desired.iter().copied().collect::<Vec<_>>(), shared(&[left]));
        assert!(!desired.contains(&InstanceKey::shared(right)));
    }

    #[test]
    fn evaluation_is_deterministic() {
        let mut registry = EntityRegistry::new(8.0);
        for i in 0..200 {
            let x = ((i * 37) % 101) as f32 - 50.0;
            let z = ((i * 53) % 97) as f32 - 48.0;
            registry
                .register(EntityDefinition::new(400, Vec3::new(x, 0.0, z)))
                .unwrap();
        }
        registry.update_observer(ObserverId(1), Vec3::ZERO, MAIN);
        registry.update_observer(ObserverId(2), Vec3::new(20.0, 0.0, 20.0), MAIN);

        let policy = global(30.0);
        let first = policy.desired(&registry, &Budget::new(10));
        let second = policy.desired(&registry, &Budget::new(10));
        assert_eq!(first, second);
        assert_eq!(first.len(), 10);
    }

    #[test]
    fn other_partitions_are_not_candidates() {
        let mut registry = EntityRegistry::new(16.0);
        registry
            .register(at(1.0).in_partition(WorldPartition::new(5, 0)))
            .unwrap();
        let main = registry.register(at(2.0)).unwrap();
        registry.update_observer(ObserverId(1), Vec3::ZERO, MAIN);

        let desired = global(20.0).desired(&registry, &Budget::new(10));
        assert_eq!(desired.iter().copied().collect::<Vec<_>>(), shared(&[main]));
    }

    #[test]
    fn per_observer_cap_limits_a_crowded_observer_in_global_mode() {
        let mut registry = EntityRegistry::new(16.0);
        let crowd: Vec<EntityId> = (1..=4)
            .map(|i| registry.register(at(i as f32)).unwrap())
            .collect();
        let lonely = registry.register(at(1005.0)).unwrap();
        registry.update_observer(ObserverId(1), Vec3::ZERO, MAIN);
        registry.update_observer(ObserverId(2), Vec3::new(1000.0, 0.0, 0.0), MAIN);

        let budget = Budget::new(10).with_per_observer(2);
        let desired = global(20.0).desired(&registry, &budget);
        assert_eq!(
            desired.entities(),
            BTreeSet::from([crowd[0], crowd[1], lonely])
        );
    }

    #[test]
    fn per_observer_mode_builds_private_sets() {
        let mut registry = EntityRegistry::new(16.0);
        let pinned = registry.register(at(500.0).with_priority(Priority::Always)).unwrap();
        let a = registry.register(at(2.0)).unwrap();
        let b = registry.register(at(100.0)).unwrap();
        let o1 = ObserverId(1);
        let o2 = ObserverId(2);
        registry.update_observer(o1, Vec3::ZERO, MAIN);
        registry.update_observer(o2, Vec3::new(99.0, 0.0, 0.0), MAIN);

        let policy = StreamingPolicy::new(RealizationMode::PerObserver, 10.0);
        let desired = policy.desired(&registry, &Budget::new(10));
        let keys: Vec<InstanceKey> = desired.iter().copied().collect();
        assert_eq!(
            keys,
            vec![
                InstanceKey::for_observer(pinned, o1),
                InstanceKey::for_observer(pinned, o2),
                InstanceKey::for_observer(b, o2),
                InstanceKey::for_observer(a, o1),
            ]
        );
    }

    #[test]
    fn per_observer_mode_respects_caps() {
        let mut registry = EntityRegistry::new(16.0);
        for i in 1..=5 {
            registry.register(at(i as f32)).unwrap();
        }
        registry.update_observer(ObserverId(1), Vec3::ZERO, MAIN);
        registry.update_observer(ObserverId(2), Vec3::new(0.5, 0.0, 0.0), MAIN);

        let policy = StreamingPolicy::new(RealizationMode::PerObserver, 10.0);
        let desired = policy.desired(&registry, &Budget::new(5).with_per_observer(3));
        assert_eq!(desired.len(), 5);
        let for_first = desired
            .iter()
            .filter(|k| k.scope.observer() == Some(ObserverId(1)))
            .count();
        let for_second = desired.len() - for_first;
        assert!(for_first <= 3 && for_second <= 3);
    }

    #[test]
    fn per_observer_mode_without_observers_is_empty() {
        let mut registry = EntityRegistry::new(16.0);
        registry.register(at(0.0).with_priority(Priority::Always)).unwrap();
        let policy = StreamingPolicy::new(RealizationMode::PerObserver, 10.0);
        assert!(policy.desired(&registry, &Budget::new(10)).is_empty());
    }
}
