//! Shared types for the streamer workspace: identifiers, world partitions,
//! and entity poses.

mod types;

pub use types::{EntityId, ObserverId, Pose, WorldPartition};
