use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier of a logical (streamable) entity.
///
/// Ids are handed out by the entity registry and survive any number of
/// realize/derealize cycles of the entity they name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub u64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entity#{}", self.0)
    }
}

/// Identifier of an observer, usually a connected player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObserverId(pub u64);

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "observer#{}", self.0)
    }
}

/// Virtual world and interior an entity or observer lives in. Proximity only
/// exists between things sharing the same partition.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct WorldPartition {
    pub virtual_world: u32,
    pub interior: u32,
}

impl WorldPartition {
    /// The main world in the main interior.
    pub const MAIN: Self = Self {
        virtual_world: 0,
        interior: 0,
    };

    pub fn new(virtual_world: u32, interior: u32) -> Self {
        Self {
            virtual_world,
            interior,
        }
    }
}

/// Position plus optional orientation of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub position: Vec3,
    pub rotation: Option<Quat>,
}

impl Pose {
    pub fn at(position: Vec3) -> Self {
        Self {
            position,
            rotation: None,
        }
    }

    pub fn with_rotation(mut self, rotation: Quat) -> Self {
        self.rotation = Some(rotation);
        self
    }

    /// Whether every component is a finite number.
    pub fn is_finite(&self) -> bool {
        self.position.is_finite() && self.rotation.is_none_or(|r| r.is_finite())
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::at(Vec3::ZERO)
    }
}
