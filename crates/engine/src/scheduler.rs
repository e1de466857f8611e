use std::collections::{BTreeSet, VecDeque};
use std::time::{Duration, Instant};

use glam::Vec3;
use streamer_common::{EntityId, ObserverId, Pose, WorldPartition};

use crate::backend::{BackendHandle, EntityBackend};
use crate::config::StreamerConfig;
use crate::error::{StreamError, StreamResult};
use crate::observer::{ObserverSource, ObserverUpdate};
use crate::policy::{Budget, StreamingPolicy};
use crate::registry::{EntityDefinition, EntityRegistry, InstanceKey, RealizationState, Scope};
use crate::sync::{AccessSynchronizer, NoopSynchronizer};

/// Where a streamer is within its tick cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Phase {
    #[default]
    Idle,
    /// Evaluating the streaming policy.
    Computing,
    /// Diffing the desired set against what is realized.
    Reconciling,
    /// Issuing backend destroy/create calls.
    Applying,
}

/// Outcome of a single tick, for instrumentation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub tick: u64,
    /// Size of the desired set computed this tick.
    pub desired: usize,
    pub realized: usize,
    pub derealized: usize,
    pub failed_creates: usize,
    pub failed_destroys: usize,
    /// Extra `on_realized` callbacks issued for resync requests.
    pub resynced: usize,
    /// Realizations skipped because no budget slot was free.
    pub deferred: usize,
    /// Realized instances once the tick finished.
    pub realized_total: usize,
    pub aborted: bool,
    pub duration: Duration,
}

/// Snapshot of a streamer's state for the feature API.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamStats {
    pub ticks: u64,
    pub registered: usize,
    pub observers: usize,
    pub realized: usize,
    pub budget: Budget,
    pub average_tick: Duration,
    pub max_tick: Duration,
}

/// Rolling window of recent tick durations.
#[derive(Debug)]
pub struct TickTimer {
    window: VecDeque<Duration>,
    capacity: usize,
}

impl TickTimer {
    pub fn new(capacity: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&mut self, elapsed: Duration) {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(elapsed);
    }

    pub fn average(&self) -> Duration {
        if self.window.is_empty() {
            return Duration::ZERO;
        }
        self.window.iter().sum::<Duration>() / self.window.len() as u32
    }

    pub fn max(&self) -> Duration {
        self.window.iter().copied().max().unwrap_or_default()
    }

    pub fn min(&self) -> Duration {
        self.window.iter().copied().min().unwrap_or_default()
    }

    pub fn count(&self) -> usize {
        self.window.len()
    }
}

/// Streams one category of entities (e.g. vehicles) through a backend.
///
/// All state changes happen either through the feature API between ticks or
/// inside [`Streamer::tick`], which runs Computing → Reconciling → Applying
/// and always ends back in [`Phase::Idle`].
///
/// # Invariants
/// - Occupied instances never exceed the global budget, even mid-tick:
///   derealizations run first and every create checks for a free slot.
/// - A failed create leaves the instance Unrealized until the next tick.
/// - A failed destroy still leaves the instance Unrealized.
pub struct Streamer<B: EntityBackend> {
    name: String,
    registry: EntityRegistry,
    policy: StreamingPolicy,
    budget: Budget,
    tick_interval: Duration,
    backend: B,
    synchronizer: Box<dyn AccessSynchronizer>,
    observer_source: Option<Box<dyn ObserverSource>>,
    resync: BTreeSet<EntityId>,
    phase: Phase,
    ticks: u64,
    last_report: TickReport,
    timer: TickTimer,
}

impl<B: EntityBackend> Streamer<B> {
    /// Create a streamer for the category `name`.
    pub fn new(name: impl Into<String>, config: &StreamerConfig, backend: B) -> StreamResult<Self> {
        config.validate()?;
        let budget = Budget {
            global: config.budget,
            per_observer: config.per_observer_budget,
        };
        Ok(Self {
            name: name.into(),
            registry: EntityRegistry::new(config.cell_size),
            policy: StreamingPolicy::new(config.mode, config.streaming_distance),
            budget,
            tick_interval: config.tick_interval(),
            backend,
            synchronizer: Box::new(NoopSynchronizer),
            observer_source: None,
            resync: BTreeSet::new(),
            phase: Phase::Idle,
            ticks: 0,
            last_report: TickReport::default(),
            timer: TickTimer::new(64),
        })
    }

    pub fn with_synchronizer(mut self, synchronizer: impl AccessSynchronizer + 'static) -> Self {
        self.synchronizer = Box::new(synchronizer);
        self
    }

    /// Attach an inbound observer queue, drained at the start of every tick.
    pub fn with_observer_source(mut self, source: impl ObserverSource + 'static) -> Self {
        self.observer_source = Some(Box::new(source));
        self
    }

    // --- Feature API ---

    pub fn add_entity(&mut self, definition: EntityDefinition) -> StreamResult<EntityId> {
        self.registry.register(definition)
    }

    /// Tear down every realized instance of `id`, then forget the entity.
    pub async fn remove_entity(&mut self, id: EntityId) -> StreamResult<()> {
        let instances: Vec<(Scope, RealizationState)> =
            self.registry.get(id)?.instances().collect();

        let mut report = TickReport::default();
        for (scope, state) in instances {
            let key = InstanceKey { entity: id, scope };
            match state {
                RealizationState::Realized(handle) => {
                    self.derealize(key, handle, &mut report).await?
                }
                RealizationState::Pending | RealizationState::PendingRemoval(_) => {
                    self.reset_stale(key, state).await?
                }
                RealizationState::Unrealized => {}
            }
        }

        for handle in self.registry.unregister(id)? {
            self.destroy_quietly(id, handle).await;
        }
        self.resync.remove(&id);
        Ok(())
    }

    /// Re-run `on_realized` for every realized instance of `id` on the next
    /// tick, without recreating anything.
    pub fn request_resync(&mut self, id: EntityId) -> StreamResult<()> {
        if !self.registry.contains(id) {
            return Err(StreamError::NotFound(id));
        }
        self.resync.insert(id);
        Ok(())
    }

    pub fn move_entity(&mut self, id: EntityId, pose: Pose) -> StreamResult<()> {
        self.registry.move_entity(id, pose)
    }

    pub fn realized_count(&self) -> usize {
        self.registry.realized_count()
    }

    /// Takes effect on the next tick.
    pub fn set_budget(&mut self, global: usize) {
        tracing::info!(streamer = %self.name, budget = global, "budget changed");
        self.budget.global = global;
    }

    pub fn set_per_observer_budget(&mut self, cap: Option<usize>) {
        self.budget.per_observer = cap;
    }

    pub fn budget(&self) -> Budget {
        self.budget
    }

    /// Apply an observer position right away. Realization follows on the
    /// next tick.
    pub fn update_observer(
        &mut self,
        id: ObserverId,
        position: Vec3,
        partition: WorldPartition,
    ) -> StreamResult<()> {
        if !position.is_finite() {
            return Err(StreamError::InvalidObserver {
                id,
                reason: format!("non-finite position {position}"),
            });
        }
        self.registry.update_observer(id, position, partition);
        Ok(())
    }

    pub fn remove_observer(&mut self, id: ObserverId) -> StreamResult<()> {
        self.registry.remove_observer(id)
    }

    pub fn apply_observer_update(&mut self, update: ObserverUpdate) {
        let result = if update.active {
            self.update_observer(update.id, update.position, update.partition)
        } else {
            self.remove_observer(update.id)
        };
        if let Err(err) = result {
            tracing::warn!(streamer = %self.name, error = %err, "observer update ignored");
        }
    }

    pub fn stats(&self) -> StreamStats {
        StreamStats {
            ticks: self.ticks,
            registered: self.registry.len(),
            observers: self.registry.spatial().observer_count(),
            realized: self.registry.realized_count(),
            budget: self.budget,
            average_tick: self.timer.average(),
            max_tick: self.timer.max(),
        }
    }

    // --- Accessors ---

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    pub fn policy(&self) -> &StreamingPolicy {
        &self.policy
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    pub fn last_report(&self) -> &TickReport {
        &self.last_report
    }

    pub fn timer(&self) -> &TickTimer {
        &self.timer
    }

    // --- Tick cycle ---

    /// Run one full tick. Never fails: errors are logged, the tick is marked
    /// aborted and the streamer returns to Idle.
    #[tracing::instrument(name = "stream_tick", skip(self), fields(streamer = %self.name, tick = self.ticks + 1))]
    pub async fn tick(&mut self) -> TickReport {
        let started = Instant::now();
        self.ticks += 1;
        let mut report = TickReport {
            tick: self.ticks,
            ..TickReport::default()
        };

        self.drain_observers();

        let mut fresh = Vec::new();
        if let Err(err) = self.reconcile(&mut report, &mut fresh).await {
            tracing::error!(error = %err, phase = ?self.phase, "tick aborted");
            report.aborted = true;
        }

        // Objects created before an abort still get their callback.
        for (key, handle) in &fresh {
            self.synchronizer.on_realized(*key, *handle);
        }
        report.realized = fresh.len();
        if !report.aborted {
            report.resynced = self.flush_resyncs(&fresh);
        }

        self.phase = Phase::Idle;
        report.realized_total = self.registry.realized_count();
        report.duration = started.elapsed();
        self.timer.record(report.duration);

        tracing::trace!(
            desired = report.desired,
            realized = report.realized,
            derealized = report.derealized,
            failed = report.failed_creates,
            total = report.realized_total,
            "stream tick complete"
        );
        self.last_report = report.clone();
        report
    }

    async fn reconcile(
        &mut self,
        report: &mut TickReport,
        fresh: &mut Vec<(InstanceKey, BackendHandle)>,
    ) -> StreamResult<()> {
        self.phase = Phase::Computing;
        self.recover_abandoned().await?;
        let desired = self.policy.desired(&self.registry, &self.budget);
        report.desired = desired.len();

        self.phase = Phase::Reconciling;
        let actual: Vec<(InstanceKey, BackendHandle)> = self
            .registry
            .instances()
            .filter_map(|(key, state)| match state {
                RealizationState::Realized(handle) => Some((key, handle)),
                _ => None,
            })
            .collect();
        let to_derealize: Vec<(InstanceKey, BackendHandle)> = actual
            .iter()
            .filter(|(key, _)| !desired.contains(key))
            .copied()
            .collect();
        let actual_keys: BTreeSet<InstanceKey> = actual.iter().map(|(key, _)| *key).collect();
        let to_realize: Vec<InstanceKey> = desired
            .iter()
            .filter(|key| !actual_keys.contains(*key))
            .copied()
            .collect();

        self.phase = Phase::Applying;
        for (key, handle) in to_derealize {
            self.derealize(key, handle, report).await?;
        }
        for key in to_realize {
            if !self.has_free_slot(key.scope) {
                tracing::debug!(entity = %key.entity, scope = ?key.scope, "no free slot, deferring");
                report.deferred += 1;
                continue;
            }
            if let Some(handle) = self.realize(key, report).await? {
                fresh.push((key, handle));
            }
        }
        Ok(())
    }

    fn has_free_slot(&self, scope: Scope) -> bool {
        if self.registry.occupied_count() >= self.budget.global {
            return false;
        }
        match (scope.observer(), self.budget.per_observer) {
            (Some(observer), Some(cap)) => self.registry.occupied_for(observer) < cap,
            _ => true,
        }
    }

    async fn realize(
        &mut self,
        key: InstanceKey,
        report: &mut TickReport,
    ) -> StreamResult<Option<BackendHandle>> {
        let definition = self.registry.get(key.entity)?.definition.clone();
        self.registry.set_state(key, RealizationState::Pending)?;

        match self.backend.create(key, &definition).await {
            Ok(handle) => {
                self.registry
                    .set_state(key, RealizationState::Realized(handle))?;
                tracing::debug!(entity = %key.entity, scope = ?key.scope, ?handle, "realized");
                Ok(Some(handle))
            }
            Err(err) => {
                self.registry.set_state(key, RealizationState::Unrealized)?;
                tracing::warn!(
                    entity = %key.entity,
                    scope = ?key.scope,
                    error = %err,
                    "create failed, retrying next tick"
                );
                report.failed_creates += 1;
                Ok(None)
            }
        }
    }

    async fn derealize(
        &mut self,
        key: InstanceKey,
        handle: BackendHandle,
        report: &mut TickReport,
    ) -> StreamResult<()> {
        self.registry
            .set_state(key, RealizationState::PendingRemoval(handle))?;
        match self.backend.destroy(handle).await {
            Ok(()) => {
                tracing::debug!(entity = %key.entity, scope = ?key.scope, ?handle, "derealized");
            }
            Err(err) => {
                tracing::warn!(
                    entity = %key.entity,
                    ?handle,
                    error = %err,
                    "destroy failed, engine object may leak"
                );
                report.failed_destroys += 1;
            }
        }
        self.registry.set_state(key, RealizationState::Unrealized)?;
        report.derealized += 1;
        Ok(())
    }

    /// Settle an instance left mid-transition by an abandoned tick.
    async fn reset_stale(&mut self, key: InstanceKey, state: RealizationState) -> StreamResult<()> {
        tracing::warn!(entity = %key.entity, scope = ?key.scope, ?state, "resetting abandoned instance");
        if let RealizationState::PendingRemoval(handle) = state {
            self.destroy_quietly(key.entity, handle).await;
        }
        self.registry.set_state(key, RealizationState::Unrealized)?;
        Ok(())
    }

    async fn recover_abandoned(&mut self) -> StreamResult<()> {
        let stale: Vec<(InstanceKey, RealizationState)> = self
            .registry
            .instances()
            .filter(|(_, state)| {
                matches!(
                    state,
                    RealizationState::Pending | RealizationState::PendingRemoval(_)
                )
            })
            .collect();
        for (key, state) in stale {
            self.reset_stale(key, state).await?;
        }
        Ok(())
    }

    /// Best-effort destroy outside of the state machine.
    async fn destroy_quietly(&mut self, entity: EntityId, handle: BackendHandle) {
        if let Err(err) = self.backend.destroy(handle).await {
            tracing::warn!(%entity, ?handle, error = %err, "destroy failed, engine object may leak");
        }
    }

    fn drain_observers(&mut self) {
        let updates = self
            .observer_source
            .as_mut()
            .map(|source| source.drain())
            .unwrap_or_default();
        for update in updates {
            self.apply_observer_update(update);
        }
    }

    /// Invoke `on_realized` again for requested entities that were already
    /// realized before this tick. Returns the number of callbacks.
    fn flush_resyncs(&mut self, fresh: &[(InstanceKey, BackendHandle)]) -> usize {
        let mut count = 0;
        for id in std::mem::take(&mut self.resync) {
            let Ok(record) = self.registry.get(id) else {
                continue;
            };
            for (scope, state) in record.instances() {
                let RealizationState::Realized(handle) = state else {
                    continue;
                };
                let key = InstanceKey { entity: id, scope };
                if fresh.iter().any(|(k, _)| *k == key) {
                    continue;
                }
                self.synchronizer.on_realized(key, handle);
                count += 1;
            }
        }
        count
    }
}

impl<B: EntityBackend + std::fmt::Debug> std::fmt::Debug for Streamer<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Streamer")
            .field("name", &self.name)
            .field("budget", &self.budget)
            .field("phase", &self.phase)
            .field("ticks", &self.ticks)
            .field("backend", &self.backend)
            .finish_non_exhaustive()
    }
}
