//! The engine-side half of streaming: creating and destroying concrete objects.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use streamer_common::EntityId;

use crate::error::BackendError;
use crate::registry::{EntityDefinition, InstanceKey};

/// Opaque reference to a concrete engine object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BackendHandle(pub u64);

/// Native entity creation, as provided by the host engine.
///
/// Calls may suspend; the scheduler awaits each one before issuing the next.
#[async_trait]
pub trait EntityBackend: Send {
    /// Materialize `definition` for the instance `key`.
    async fn create(
        &mut self,
        key: InstanceKey,
        definition: &EntityDefinition,
    ) -> Result<BackendHandle, BackendError>;

    /// Release the object behind `handle`.
    async fn destroy(&mut self, handle: BackendHandle) -> Result<(), BackendError>;
}

/// An object the simulated engine currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveObject {
    pub key: InstanceKey,
    pub model_id: u32,
}

/// In-memory engine stand-in with an engine-side object cap and scriptable
/// failures. Used by the CLI simulation and by tests.
#[derive(Debug, Default)]
pub struct SimulatedBackend {
    capacity: Option<usize>,
    live: BTreeMap<BackendHandle, LiveObject>,
    next_handle: u64,
    failing_creates: usize,
    repeat_handle: bool,
    refused: BTreeSet<EntityId>,
    create_calls: usize,
    destroy_calls: usize,
    peak_live: usize,
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap the number of live objects, like the host engine's own limit.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::default()
        }
    }

    /// Make the next `count` create calls fail with `CapacityExceeded`.
    pub fn fail_next_creates(&mut self, count: usize) {
        self.failing_creates = count;
    }

    /// Make the next successful create hand out the most recently issued
    /// handle again, like an engine that recycled an id too early. No new
    /// object is stored.
    pub fn repeat_next_handle(&mut self) {
        self.repeat_handle = true;
    }

    /// Refuse every create for `entity` until [`Self::accept`] is called.
    pub fn refuse(&mut self, entity: EntityId) {
        self.refused.insert(entity);
    }

    pub fn accept(&mut self, entity: EntityId) {
        self.refused.remove(&entity);
    }

    /// Drop an object without telling the caller, as if the engine lost it.
    pub fn forget(&mut self, handle: BackendHandle) -> Option<LiveObject> {
        self.live.remove(&handle)
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn live_objects(&self) -> impl Iterator<Item = (BackendHandle, &LiveObject)> {
        self.live.iter().map(|(handle, object)| (*handle, object))
    }

    /// Whether the engine holds an object for `key`.
    pub fn is_live(&self, key: InstanceKey) -> bool {
        self.live.values().any(|object| object.key == key)
    }

    /// Highest number of simultaneously live objects seen so far.
    pub fn peak_live(&self) -> usize {
        self.peak_live
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls
    }

    pub fn destroy_calls(&self) -> usize {
        self.destroy_calls
    }
}

#[async_trait]
impl EntityBackend for SimulatedBackend {
    async fn create(
        &mut self,
        key: InstanceKey,
        definition: &EntityDefinition,
    ) -> Result<BackendHandle, BackendError> {
        self.create_calls += 1;
        if self.failing_creates > 0 {
            self.failing_creates -= 1;
            return Err(BackendError::CapacityExceeded);
        }
        if self.refused.contains(&key.entity) {
            return Err(BackendError::CapacityExceeded);
        }
        if self.capacity.is_some_and(|cap| self.live.len() >= cap) {
            return Err(BackendError::CapacityExceeded);
        }
        if std::mem::take(&mut self.repeat_handle) && self.next_handle > 0 {
            return Ok(BackendHandle(self.next_handle));
        }

        self.next_handle += 1;
        let handle = BackendHandle(self.next_handle);
        self.live.insert(
            handle,
            LiveObject {
                key,
                model_id: definition.model_id,
            },
        );
        self.peak_live = self.peak_live.max(self.live.len());
        Ok(handle)
    }

    async fn destroy(&mut self, handle: BackendHandle) -> Result<(), BackendError> {
        self.destroy_calls += 1;
        self.live
            .remove(&handle)
            .map(|_| ())
            .ok_or(BackendError::NotFound(handle))
    }
}
