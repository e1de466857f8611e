//! Periodic tick driver: one tokio task per streamed category.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use glam::Vec3;
use streamer_common::{EntityId, ObserverId, Pose, WorldPartition};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::backend::EntityBackend;
use crate::error::StreamResult;
use crate::registry::EntityDefinition;
use crate::scheduler::{StreamStats, Streamer};

/// A running streamer. The tick task holds the lock for a whole tick, so
/// feature calls made through the handle land between ticks.
///
/// Dropping or disposing the handle stops the timer. A tick in flight is
/// abandoned at its next suspension point; already issued backend calls are
/// not rolled back. A tick that panics is logged and counted, and the timer
/// keeps running.
pub struct SchedulerHandle<B: EntityBackend + 'static> {
    streamer: Arc<Mutex<Streamer<B>>>,
    task: JoinHandle<()>,
    panicked: Arc<AtomicU64>,
}

impl<B: EntityBackend + 'static> SchedulerHandle<B> {
    /// Start ticking `streamer` at its configured interval. Must be called
    /// from within a tokio runtime.
    pub fn spawn(streamer: Streamer<B>) -> Self {
        let streamer = Arc::new(Mutex::new(streamer));
        let panicked = Arc::new(AtomicU64::new(0));
        let task = tokio::spawn(run_ticks(Arc::clone(&streamer), Arc::clone(&panicked)));
        Self {
            streamer,
            task,
            panicked,
        }
    }

    /// Shared access to the underlying streamer.
    pub fn streamer(&self) -> Arc<Mutex<Streamer<B>>> {
        Arc::clone(&self.streamer)
    }

    pub async fn add_entity(&self, definition: EntityDefinition) -> StreamResult<EntityId> {
        self.streamer.lock().await.add_entity(definition)
    }

    pub async fn remove_entity(&self, id: EntityId) -> StreamResult<()> {
        self.streamer.lock().await.remove_entity(id).await
    }

    pub async fn request_resync(&self, id: EntityId) -> StreamResult<()> {
        self.streamer.lock().await.request_resync(id)
    }

    pub async fn realized_count(&self) -> usize {
        self.streamer.lock().await.realized_count()
    }

    pub async fn move_entity(&self, id: EntityId, pose: Pose) -> StreamResult<()> {
        self.streamer.lock().await.move_entity(id, pose)
    }

    pub async fn set_budget(&self, budget: usize) {
        self.streamer.lock().await.set_budget(budget)
    }

    pub async fn set_per_observer_budget(&self, cap: Option<usize>) {
        self.streamer.lock().await.set_per_observer_budget(cap)
    }

    pub async fn update_observer(
        &self,
        id: ObserverId,
        position: Vec3,
        partition: WorldPartition,
    ) -> StreamResult<()> {
        self.streamer
            .lock()
            .await
            .update_observer(id, position, partition)
    }

    pub async fn remove_observer(&self, id: ObserverId) -> StreamResult<()> {
        self.streamer.lock().await.remove_observer(id)
    }

    pub async fn stats(&self) -> StreamStats {
        self.streamer.lock().await.stats()
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Ticks that panicked since the scheduler started.
    pub fn panicked_ticks(&self) -> u64 {
        self.panicked.load(Ordering::Relaxed)
    }

    /// Cancel the timer and abandon any tick in flight.
    pub fn dispose(&self) {
        self.task.abort();
    }
}

impl<B: EntityBackend + 'static> Drop for SchedulerHandle<B> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Aborts the wrapped task when dropped, so abandoning the timer also
/// abandons the tick it is waiting on.
struct TickTask<T>(JoinHandle<T>);

impl<T> Drop for TickTask<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn run_ticks<B: EntityBackend + 'static>(
    streamer: Arc<Mutex<Streamer<B>>>,
    panicked: Arc<AtomicU64>,
) {
    let (name, period) = {
        let guard = streamer.lock().await;
        (guard.name().to_string(), guard.tick_interval())
    };
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick of an interval completes immediately.
    ticker.tick().await;

    tracing::info!(streamer = %name, interval_ms = period.as_millis() as u64, "scheduler started");
    loop {
        ticker.tick().await;
        // Each tick runs in its own task so a panic ends only that tick.
        let shared = Arc::clone(&streamer);
        let mut tick = TickTask(tokio::spawn(async move { shared.lock().await.tick().await }));
        match (&mut tick.0).await {
            Ok(report) if report.aborted => {
                tracing::warn!(streamer = %name, tick = report.tick, "tick aborted, rescheduling");
            }
            Ok(_) => {}
            Err(err) if err.is_panic() => {
                panicked.fetch_add(1, Ordering::Relaxed);
                tracing::error!(streamer = %name, "tick panicked, rescheduling");
            }
            Err(_) => {
                tracing::warn!(streamer = %name, "tick cancelled, scheduler stopping");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::backend::{BackendHandle, SimulatedBackend};
    use crate::config::StreamerConfig;
    use crate::error::BackendError;
    use crate::registry::InstanceKey;

    fn streamer() -> Streamer<SimulatedBackend> {
        let config = StreamerConfig {
            budget: 10,
            streaming_distance: 50.0,
            tick_interval_ms: 250,
            ..StreamerConfig::default()
        };
        Streamer::new("vehicles", &config, SimulatedBackend::new()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_on_interval() {
        let handle = SchedulerHandle::spawn(streamer());
        handle
            .add_entity(EntityDefinition::new(411, Vec3::new(5.0, 0.0, 0.0)))
            .await
            .unwrap();
        handle
            .update_observer(ObserverId(1), Vec3::ZERO, WorldPartition::MAIN)
            .await
            .unwrap();

        // Position updates alone never trigger an out-of-band tick.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handle.realized_count().await, 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(handle.realized_count().await, 1);
        assert_eq!(handle.stats().await.ticks, 1);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(handle.stats().await.ticks, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_stops_ticking() {
        let handle = SchedulerHandle::spawn(streamer());
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(handle.stats().await.ticks, 1);

        handle.dispose();
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert!(!handle.is_running());
        assert_eq!(handle.stats().await.ticks, 1);
    }

    /// Panics on its first create, then behaves like the simulated engine.
    #[derive(Debug, Default)]
    struct CrashOnce {
        inner: SimulatedBackend,
        crashed: bool,
    }

    #[async_trait::async_trait]
    impl EntityBackend for CrashOnce {
        async fn create(
            &mut self,
            key: InstanceKey,
            definition: &EntityDefinition,
        ) -> Result<BackendHandle, BackendError> {
            if !self.crashed {
                self.crashed = true;
                panic!("engine crashed while creating {}", key.entity);
            }
            self.inner.create(key, definition).await
        }

        async fn destroy(&mut self, handle: BackendHandle) -> Result<(), BackendError> {
            self.inner.destroy(handle).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_tick_does_not_stop_the_scheduler() {
        let config = StreamerConfig {
            streaming_distance: 50.0,
            ..StreamerConfig::default()
        };
        let handle =
            SchedulerHandle::spawn(Streamer::new("vehicles", &config, CrashOnce::default()).unwrap());
        handle
            .add_entity(EntityDefinition::new(411, Vec3::new(5.0, 0.0, 0.0)))
            .await
            .unwrap();
        handle
            .update_observer(ObserverId(1), Vec3::ZERO, WorldPartition::MAIN)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(handle.is_running());
        assert_eq!(handle.panicked_ticks(), 1);
        assert_eq!(handle.realized_count().await, 0);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(handle.panicked_ticks(), 1);
        assert_eq!(handle.realized_count().await, 1);
        assert_eq!(handle.stats().await.ticks, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn feature_api_reaches_the_running_streamer() {
        let handle = SchedulerHandle::spawn(streamer());
        let id = handle
            .add_entity(EntityDefinition::new(411, Vec3::new(5.0, 0.0, 0.0)))
            .await
            .unwrap();
        handle
            .update_observer(ObserverId(1), Vec3::ZERO, WorldPartition::MAIN)
            .await
            .unwrap();
        handle.set_per_observer_budget(Some(3)).await;
        assert_eq!(handle.stats().await.budget.per_observer, Some(3));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(handle.realized_count().await, 1);

        handle
            .move_entity(id, Pose::at(Vec3::new(500.0, 0.0, 0.0)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(handle.realized_count().await, 0);
        assert_eq!(
            handle.move_entity(EntityId(99), Pose::default()).await.unwrap_err(),
            crate::error::StreamError::NotFound(EntityId(99))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn categories_tick_independently() {
        let vehicles = SchedulerHandle::spawn(streamer());
        let config = StreamerConfig {
            tick_interval_ms: 100,
            ..StreamerConfig::default()
        };
        let pickups =
            SchedulerHandle::spawn(Streamer::new("pickups", &config, SimulatedBackend::new()).unwrap());

        tokio::time::sleep(Duration::from_millis(550)).await;
        assert_eq!(vehicles.stats().await.ticks, 2);
        assert_eq!(pickups.stats().await.ticks, 5);
    }
}
