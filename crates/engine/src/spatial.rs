use std::collections::{BTreeMap, HashMap, HashSet};

use glam::Vec3;
use streamer_common::{EntityId, ObserverId, WorldPartition};

/// A cell coordinate in the grid (XZ plane, Y is up), scoped to a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellCoord {
    pub partition: WorldPartition,
    pub x: i32,
    pub z: i32,
}

impl CellCoord {
    pub fn new(partition: WorldPartition, x: i32, z: i32) -> Self {
        Self { partition, x, z }
    }
}

/// Last known whereabouts of an observer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObserverState {
    pub position: Vec3,
    pub partition: WorldPartition,
}

/// One result of a proximity query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub id: EntityId,
    pub distance: f32,
}

#[derive(Debug, Clone, Copy)]
struct TrackedEntity {
    position: Vec3,
    cell: CellCoord,
}

/// Uniform grid over entity positions, plus the set of active observers.
///
/// Entities are bucketed by their XZ position divided by `cell_size`. A
/// proximity query visits only the cells overlapping the query circle and
/// then filters by exact 3D distance, so results never contain entities
/// beyond the radius and never miss one inside it.
#[derive(Debug)]
pub struct SpatialIndex {
    cell_size: f32,
    cells: HashMap<CellCoord, HashSet<EntityId>>,
    entities: HashMap<EntityId, TrackedEntity>,
    observers: BTreeMap<ObserverId, ObserverState>,
}

impl SpatialIndex {
    /// Create an empty index with the given cell size.
    pub fn new(cell_size: f32) -> Self {
        assert!(
            cell_size.is_finite() && cell_size > 0.0,
            "cell_size must be positive"
        );
        Self {
            cell_size,
            cells: HashMap::new(),
            entities: HashMap::new(),
            observers: BTreeMap::new(),
        }
    }

    pub fn cell_size(&self) -> f32 {
        self.cell_size
    }

    /// Convert a world position to the cell containing it.
    pub fn position_to_cell(&self, pos: Vec3, partition: WorldPartition) -> CellCoord {
        CellCoord {
            partition,
            x: (pos.x / self.cell_size).floor() as i32,
            z: (pos.z / self.cell_size).floor() as i32,
        }
    }

    /// Insert or move an entity. Touches at most two cells.
    pub fn update_entity(&mut self, id: EntityId, position: Vec3, partition: WorldPartition) {
        let cell = self.position_to_cell(position, partition);
        if let Some(tracked) = self.entities.get_mut(&id) {
            tracked.position = position;
            if tracked.cell == cell {
                return;
            }
            let old = std::mem::replace(&mut tracked.cell, cell);
            detach(&mut self.cells, old, id);
        } else {
            self.entities.insert(id, TrackedEntity { position, cell });
        }
        self.cells.entry(cell).or_default().insert(id);
    }

    /// Stop tracking an entity. Returns whether it was tracked.
    pub fn remove_entity(&mut self, id: EntityId) -> bool {
        match self.entities.remove(&id) {
            Some(tracked) => {
                detach(&mut self.cells, tracked.cell, id);
                true
            }
            None => false,
        }
    }

    pub fn entity_position(&self, id: EntityId) -> Option<Vec3> {
        self.entities.get(&id).map(|t| t.position)
    }

    /// Insert or move an observer.
    pub fn update_observer(&mut self, id: ObserverId, position: Vec3, partition: WorldPartition) {
        self.observers.insert(
            id,
            ObserverState {
                position,
                partition,
            },
        );
    }

    /// Stop tracking an observer. Returns whether it was tracked.
    pub fn remove_observer(&mut self, id: ObserverId) -> bool {
        self.observers.remove(&id).is_some()
    }

    pub fn observer(&self, id: ObserverId) -> Option<&ObserverState> {
        self.observers.get(&id)
    }

    /// Active observers in ascending id order.
    pub fn observers(&self) -> impl Iterator<Item = (ObserverId, &ObserverState)> {
        self.observers.iter().map(|(id, state)| (*id, state))
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Entities in `partition` within `radius` of `position`, nearest first.
    /// Equal distances are ordered by entity id.
    pub fn nearest_entities(
        &self,
        position: Vec3,
        partition: WorldPartition,
        radius: f32,
    ) -> Vec<Neighbor> {
        if radius.is_nan() || radius < 0.0 || !position.is_finite() {
            return Vec::new();
        }
        let min = self.position_to_cell(position - Vec3::splat(radius), partition);
        let max = self.position_to_cell(position + Vec3::splat(radius), partition);
        // Cell coordinates saturate at the i32 range, so each side fits in an
        // i64 but their product may not.
        let span = (i64::from(max.x) - i64::from(min.x) + 1)
            .saturating_mul(i64::from(max.z) - i64::from(min.z) + 1);

        let radius_sq = radius * radius;
        let mut found = Vec::new();
        let mut collect = |ids: &HashSet<EntityId>| {
            for id in ids {
                let Some(tracked) = self.entities.get(id) else {
                    continue;
                };
                let distance_sq = tracked.position.distance_squared(position);
                if distance_sq <= radius_sq {
                    found.push(Neighbor {
                        id: *id,
                        distance: distance_sq.sqrt(),
                    });
                }
            }
        };

        // A huge radius would make the cell walk cost more than scanning the
        // occupied cells directly.
        if span > self.cells.len() as i64 {
            for (coord, ids) in &self.cells {
                if coord.partition == partition
                    && (min.x..=max.x).contains(&coord.x)
                    && (min.z..=max.z).contains(&coord.z)
                {
                    collect(ids);
                }
            }
        } else {
            for x in min.x..=max.x {
                for z in min.z..=max.z {
                    if let Some(ids) = self.cells.get(&CellCoord::new(partition, x, z)) {
                        collect(ids);
                    }
                }
            }
        }

        found.sort_by(|a, b| a.distance.total_cmp(&b.distance).then(a.id.cmp(&b.id)));
        found
    }

    /// All entity ids bucketed in a specific cell.
    pub fn entities_in_cell(&self, coord: CellCoord) -> HashSet<EntityId> {
        self.cells.get(&coord).cloned().unwrap_or_default()
    }

    /// Number of non-empty cells.
    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }
}

fn detach(cells: &mut HashMap<CellCoord, HashSet<EntityId>>, cell: CellCoord, id: EntityId) {
    if let Some(ids) = cells.get_mut(&cell) {
        ids.remove(&id);
        if ids.is_empty() {
            cells.remove(&cell);
        }
    }
}
