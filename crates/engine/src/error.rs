use streamer_common::{EntityId, ObserverId};

use crate::backend::BackendHandle;
use crate::registry::{RealizationState, Scope};

/// Errors surfaced by the streaming engine to its callers.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StreamError {
    #[error("unknown entity {0}")]
    NotFound(EntityId),
    #[error("unknown observer {0}")]
    ObserverNotFound(ObserverId),
    #[error("illegal transition for {entity} ({scope:?}): {from:?} -> {to:?}")]
    IllegalTransition {
        entity: EntityId,
        scope: Scope,
        from: RealizationState,
        to: RealizationState,
    },
    #[error("invalid entity definition: {0}")]
    InvalidDefinition(String),
    #[error("invalid update for {id}: {reason}")]
    InvalidObserver { id: ObserverId, reason: String },
    /// The backend handed out a handle that already names another instance.
    #[error("backend handle {handle:?} already held by {holder} ({scope:?})")]
    DuplicateHandle {
        handle: BackendHandle,
        holder: EntityId,
        scope: Scope,
    },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type StreamResult<T> = Result<T, StreamError>;

/// Failures reported by an [`EntityBackend`](crate::EntityBackend).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// The engine refused to create another object even though the local
    /// budget allowed it. Recoverable: the instance is retried next tick.
    #[error("backend capacity exceeded")]
    CapacityExceeded,
    /// The handle given to `destroy` does not name a live engine object.
    #[error("backend has no object for {0:?}")]
    NotFound(BackendHandle),
}
