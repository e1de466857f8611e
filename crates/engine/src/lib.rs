//! Entity streaming: decides which logical entities exist as engine objects.
//!
//! The host engine caps how many objects (e.g. vehicles) may exist at once.
//! A [`Streamer`] keeps far more logical entities in its registry and, once
//! per tick, realizes the ones nearest to observers within a budget while
//! derealizing the rest through an [`EntityBackend`].
//!
//! # Invariants
//! - Realized instances never exceed the budget, including mid-tick.
//! - Instances move Unrealized → Pending → Realized → PendingRemoval →
//!   Unrealized; only a successful backend create yields Realized.
//! - Entity ids are stable across realize/derealize cycles.
//! - Policy evaluation is pure and deterministic (ties broken by id).

mod backend;
mod config;
mod error;
mod observer;
mod policy;
mod registry;
mod runtime;
mod scheduler;
mod spatial;
mod sync;

pub use backend::{BackendHandle, EntityBackend, LiveObject, SimulatedBackend};
pub use config::StreamerConfig;
pub use error::{BackendError, StreamError, StreamResult};
pub use observer::{
    ChannelObserverSource, ObserverFeed, ObserverSource, ObserverUpdate, observer_channel,
};
pub use policy::{Budget, DesiredSet, RealizationMode, StreamingPolicy};
pub use registry::{
    EntityDefinition, EntityRecord, EntityRegistry, InstanceKey, Priority, RealizationState, Scope,
};
pub use runtime::SchedulerHandle;
pub use scheduler::{Phase, StreamStats, Streamer, TickReport, TickTimer};
pub use spatial::{CellCoord, Neighbor, ObserverState, SpatialIndex};
pub use sync::{AccessSynchronizer, NoopSynchronizer};

pub fn crate_info() -> &'static str {
    "streamer-engine v0.1.0"
}
