//! Logical entity definitions and their realization state machine.

use std::collections::BTreeMap;

use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};
use streamer_common::{EntityId, ObserverId, Pose, WorldPartition};

use crate::backend::BackendHandle;
use crate::error::{StreamError, StreamResult};
use crate::spatial::SpatialIndex;

/// How an entity competes for realization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Realized whenever the budget allows, regardless of distance.
    Always,
    /// Realized only when close enough to an observer.
    #[default]
    Proximity,
}

/// What a feature hands over when it adds an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDefinition {
    /// Backend-specific model (e.g. a vehicle model id).
    pub model_id: u32,
    pub pose: Pose,
    #[serde(default)]
    pub partition: WorldPartition,
    #[serde(default)]
    pub priority: Priority,
}

impl EntityDefinition {
    pub fn new(model_id: u32, position: Vec3) -> Self {
        Self {
            model_id,
            pose: Pose::at(position),
            partition: WorldPartition::MAIN,
            priority: Priority::Proximity,
        }
    }

    pub fn with_rotation(mut self, rotation: Quat) -> Self {
        self.pose = self.pose.with_rotation(rotation);
        self
    }

    pub fn in_partition(mut self, partition: WorldPartition) -> Self {
        self.partition = partition;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn position(&self) -> Vec3 {
        self.pose.position
    }

    fn validate(&self) -> StreamResult<()> {
        if !self.pose.is_finite() {
            return Err(StreamError::InvalidDefinition(format!(
                "non-finite pose {:?}",
                self.pose
            )));
        }
        Ok(())
    }
}

/// Who a realized instance exists for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Scope {
    /// One instance visible to everybody (global mode).
    Shared,
    /// An instance private to one observer (per-observer mode).
    Observer(ObserverId),
}

impl Scope {
    pub fn observer(&self) -> Option<ObserverId> {
        match self {
            Scope::Shared => None,
            Scope::Observer(id) => Some(*id),
        }
    }
}

/// Identifies one realizable instance of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceKey {
    pub entity: EntityId,
    pub scope: Scope,
}

impl InstanceKey {
    pub fn shared(entity: EntityId) -> Self {
        Self {
            entity,
            scope: Scope::Shared,
        }
    }

    pub fn for_observer(entity: EntityId, observer: ObserverId) -> Self {
        Self {
            entity,
            scope: Scope::Observer(observer),
        }
    }
}

/// Realization state of a single instance.
///
/// Handles live inside the states that own an engine object, so a realized
/// instance cannot lack one and an unrealized instance cannot hold one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RealizationState {
    Unrealized,
    /// A backend create call is in flight.
    Pending,
    Realized(BackendHandle),
    /// A backend destroy call is in flight.
    PendingRemoval(BackendHandle),
}

impl RealizationState {
    pub fn handle(&self) -> Option<BackendHandle> {
        match self {
            Self::Realized(h) | Self::PendingRemoval(h) => Some(*h),
            Self::Unrealized | Self::Pending => None,
        }
    }

    pub fn is_realized(&self) -> bool {
        matches!(self, Self::Realized(_))
    }

    /// Whether the instance holds (or is about to hold) an engine object and
    /// therefore counts against the budget.
    pub fn is_occupied(&self) -> bool {
        !matches!(self, Self::Unrealized)
    }

    /// Legal moves: Unrealized → Pending → Realized → PendingRemoval →
    /// Unrealized, plus Pending → Unrealized for a failed create. The handle
    /// must carry over from Realized into PendingRemoval.
    pub fn can_transition_to(&self, next: &RealizationState) -> bool {
        match (self, next) {
            (Self::Unrealized, Self::Pending) => true,
            (Self::Pending, Self::Realized(_)) => true,
            (Self::Pending, Self::Unrealized) => true,
            (Self::Realized(a), Self::PendingRemoval(b)) => a == b,
            (Self::PendingRemoval(_), Self::Unrealized) => true,
            _ => false,
        }
    }
}

/// Everything the registry knows about one logical entity.
#[derive(Debug, Clone)]
pub struct EntityRecord {
    pub id: EntityId,
    pub definition: EntityDefinition,
    /// Instances that are not Unrealized.
    instances: BTreeMap<Scope, RealizationState>,
}

impl EntityRecord {
    pub fn state(&self, scope: Scope) -> RealizationState {
        self.instances
            .get(&scope)
            .copied()
            .unwrap_or(RealizationState::Unrealized)
    }

    /// Backend handle of the instance in `scope`, if it has one.
    pub fn handle(&self, scope: Scope) -> Option<BackendHandle> {
        self.state(scope).handle()
    }

    /// Instances that are not Unrealized, in scope order.
    pub fn instances(&self) -> impl Iterator<Item = (Scope, RealizationState)> + '_ {
        self.instances.iter().map(|(scope, state)| (*scope, *state))
    }

    pub fn is_realized_anywhere(&self) -> bool {
        self.instances.values().any(RealizationState::is_realized)
    }
}

/// Owns every streamable entity and the spatial index over them.
#[derive(Debug)]
pub struct EntityRegistry {
    entities: BTreeMap<EntityId, EntityRecord>,
    next_id: u64,
    index: SpatialIndex,
    occupied: usize,
    occupied_per_observer: BTreeMap<ObserverId, usize>,
    /// Live backend handles and the instance holding each.
    handles: BTreeMap<BackendHandle, InstanceKey>,
}

impl EntityRegistry {
    pub fn new(cell_size: f32) -> Self {
        Self {
            entities: BTreeMap::new(),
            next_id: 1,
            index: SpatialIndex::new(cell_size),
            occupied: 0,
            occupied_per_observer: BTreeMap::new(),
            handles: BTreeMap::new(),
        }
    }

    /// Validate and store a definition. The new entity starts Unrealized.
    pub fn register(&mut self, definition: EntityDefinition) -> StreamResult<EntityId> {
        definition.validate()?;
        let id = EntityId(self.next_id);
        self.next_id += 1;

        self.index
            .update_entity(id, definition.position(), definition.partition);
        tracing::debug!(%id, model = definition.model_id, "entity registered");
        self.entities.insert(
            id,
            EntityRecord {
                id,
                definition,
                instances: BTreeMap::new(),
            },
        );
        Ok(id)
    }

    /// Remove an entity. Callers derealize it first; any handle still live is
    /// returned so the caller can release the engine object.
    pub fn unregister(&mut self, id: EntityId) -> StreamResult<Vec<BackendHandle>> {
        let record = self.entities.remove(&id).ok_or(StreamError::NotFound(id))?;
        self.index.remove_entity(id);

        let mut orphaned = Vec::new();
        for (scope, state) in record.instances() {
            self.release_slot(scope);
            if let Some(handle) = state.handle() {
                self.handles.remove(&handle);
                orphaned.push(handle);
            }
        }
        if !orphaned.is_empty() {
            tracing::warn!(%id, count = orphaned.len(), "entity unregistered while realized");
        }
        tracing::debug!(%id, "entity unregistered");
        Ok(orphaned)
    }

    pub fn get(&self, id: EntityId) -> StreamResult<&EntityRecord> {
        self.entities.get(&id).ok_or(StreamError::NotFound(id))
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.entities.contains_key(&id)
    }

    pub fn state(&self, key: InstanceKey) -> StreamResult<RealizationState> {
        Ok(self.get(key.entity)?.state(key.scope))
    }

    /// Move an instance to `next`, enforcing the transition table and handle
    /// uniqueness. Returns the previous state.
    pub fn set_state(
        &mut self,
        key: InstanceKey,
        next: RealizationState,
    ) -> StreamResult<RealizationState> {
        let record = self
            .entities
            .get_mut(&key.entity)
            .ok_or(StreamError::NotFound(key.entity))?;
        let current = record.state(key.scope);
        if !current.can_transition_to(&next) {
            return Err(StreamError::IllegalTransition {
                entity: key.entity,
                scope: key.scope,
                from: current,
                to: next,
            });
        }
        if let RealizationState::Realized(handle) = next {
            if let Some(holder) = self.handles.get(&handle) {
                return Err(StreamError::DuplicateHandle {
                    handle,
                    holder: holder.entity,
                    scope: holder.scope,
                });
            }
        }

        if next.is_occupied() {
            record.instances.insert(key.scope, next);
        } else {
            record.instances.remove(&key.scope);
        }
        match (current, next) {
            (_, RealizationState::Realized(handle)) => {
                self.handles.insert(handle, key);
            }
            (RealizationState::PendingRemoval(handle), RealizationState::Unrealized) => {
                self.handles.remove(&handle);
            }
            _ => {}
        }

        match (current.is_occupied(), next.is_occupied()) {
            (false, true) => self.claim_slot(key.scope),
            (true, false) => self.release_slot(key.scope),
            _ => {}
        }
        Ok(current)
    }

    /// Update the pose of an entity, keeping the spatial index in step.
    pub fn move_entity(&mut self, id: EntityId, pose: Pose) -> StreamResult<()> {
        if !pose.is_finite() {
            return Err(StreamError::InvalidDefinition(format!(
                "non-finite pose {pose:?}"
            )));
        }
        let record = self.entities.get_mut(&id).ok_or(StreamError::NotFound(id))?;
        record.definition.pose = pose;
        self.index
            .update_entity(id, pose.position, record.definition.partition);
        Ok(())
    }

    /// All entities in id order.
    pub fn all_entities(&self) -> impl Iterator<Item = &EntityRecord> {
        self.entities.values()
    }

    /// Every instance that is not Unrealized, in key order.
    pub fn instances(&self) -> impl Iterator<Item = (InstanceKey, RealizationState)> + '_ {
        self.entities.values().flat_map(|record| {
            record.instances().map(move |(scope, state)| {
                (
                    InstanceKey {
                        entity: record.id,
                        scope,
                    },
                    state,
                )
            })
        })
    }

    pub fn update_observer(&mut self, id: ObserverId, position: Vec3, partition: WorldPartition) {
        self.index.update_observer(id, position, partition);
    }

    pub fn remove_observer(&mut self, id: ObserverId) -> StreamResult<()> {
        if self.index.remove_observer(id) {
            Ok(())
        } else {
            Err(StreamError::ObserverNotFound(id))
        }
    }

    pub fn spatial(&self) -> &SpatialIndex {
        &self.index
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Instances currently Pending, Realized or PendingRemoval.
    pub fn occupied_count(&self) -> usize {
        self.occupied
    }

    /// Occupied instances scoped to `observer`.
    pub fn occupied_for(&self, observer: ObserverId) -> usize {
        self.occupied_per_observer
            .get(&observer)
            .copied()
            .unwrap_or(0)
    }

    /// Instances in the Realized state.
    pub fn realized_count(&self) -> usize {
        self.instances()
            .filter(|(_, state)| state.is_realized())
            .count()
    }

    fn claim_slot(&mut self, scope: Scope) {
        self.occupied += 1;
        if let Some(observer) = scope.observer() {
            *self.occupied_per_observer.entry(observer).or_default() += 1;
        }
    }

    fn release_slot(&mut self, scope: Scope) {
        self.occupied = self.occupied.saturating_sub(1);
        if let Some(observer) = scope.observer() {
            if let Some(count) = self.occupied_per_observer.get_mut(&observer) {
                *count -= 1;
                if *count == 0 {
                    self.occupied_per_observer.remove(&observer);
                }
            }
        }
    }
}
