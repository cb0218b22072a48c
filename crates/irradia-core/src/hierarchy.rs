//! Ternary brick hierarchy and world/cell addressing.
//!
//! Cells are fixed-size cubes laid out on a world-aligned grid. Inside a
//! cell, bricks subdivide space by a factor of three per level: a brick at
//! level `n` covers `3^n` minimum-size bricks along each axis.

use glam::{IVec3, Vec3};

use crate::constants::{BRICK_CELL_COUNT, MAX_SUBDIVISION_LEVELS};
use crate::error::{Error, Result};

/// Side length of a cell at the given subdivision level, in minimum bricks.
#[inline]
#[must_use]
pub fn cell_size_in_bricks(subdivision_level: u8) -> u32 {
    BRICK_CELL_COUNT.pow(u32::from(subdivision_level))
}

/// Spatial parameters of a baked probe volume set.
///
/// Set once per baking-set activation; all addressing derives from these
/// two scalars.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeHierarchy {
    min_brick_size: f32,
    max_subdivision: u8,
}

impl ProbeHierarchy {
    /// Create a hierarchy from the baked set parameters.
    ///
    /// Fails if `max_subdivision` exceeds the supported level count.
    pub fn new(min_brick_size: f32, max_subdivision: u8) -> Result<Self> {
        if max_subdivision > MAX_SUBDIVISION_LEVELS {
            return Err(Error::InvalidConfiguration(format!(
                "subdivision level {max_subdivision} exceeds maximum {MAX_SUBDIVISION_LEVELS}"
            )));
        }
        if min_brick_size <= 0.0 {
            return Err(Error::InvalidConfiguration(format!(
                "minimum brick size must be positive, got {min_brick_size}"
            )));
        }
        Ok(Self {
            min_brick_size,
            max_subdivision,
        })
    }

    /// Minimum brick side length in world units.
    #[must_use]
    pub fn min_brick_size(&self) -> f32 {
        self.min_brick_size
    }

    /// Highest subdivision level of this set.
    #[must_use]
    pub fn max_subdivision(&self) -> u8 {
        self.max_subdivision
    }

    /// Brick side length at the given subdivision level, in world units.
    #[must_use]
    pub fn brick_size(&self, subdivision_level: u8) -> f32 {
        self.min_brick_size * cell_size_in_bricks(subdivision_level) as f32
    }

    /// Side length of a cell in world units (a cell is one max-level brick).
    #[must_use]
    pub fn max_brick_size(&self) -> f32 {
        self.brick_size(self.max_subdivision)
    }

    /// Cell grid coordinate containing a world position.
    #[must_use]
    pub fn world_to_cell(&self, position: Vec3) -> IVec3 {
        let cell_size = self.max_brick_size();
        (position / cell_size).floor().as_ivec3()
    }

    /// World position of a cell's minimum corner.
    #[must_use]
    pub fn cell_to_world(&self, cell: IVec3) -> Vec3 {
        cell.as_vec3() * self.max_brick_size()
    }

    /// World position of a cell's center.
    #[must_use]
    pub fn cell_center(&self, cell: IVec3) -> Vec3 {
        self.cell_to_world(cell) + Vec3::splat(self.max_brick_size() * 0.5)
    }

    /// Local brick coordinate of a world position within its cell,
    /// in minimum-brick units.
    #[must_use]
    pub fn local_brick_coord(&self, position: Vec3) -> IVec3 {
        let cell = self.world_to_cell(position);
        let local = position - self.cell_to_world(cell);
        (local / self.min_brick_size).floor().as_ivec3()
    }
}

/// Axis-aligned bounds over all loaded cells, in cell grid units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeBounds {
    min: IVec3,
    max: IVec3,
    empty: bool,
}

impl VolumeBounds {
    /// An empty bounds containing no cells.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            min: IVec3::ZERO,
            max: IVec3::ZERO,
            empty: true,
        }
    }

    /// Whether any cell has been added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.empty
    }

    /// Grow the bounds to include a cell position.
    pub fn expand(&mut self, cell: IVec3) {
        if self.empty {
            self.min = cell;
            self.max = cell;
            self.empty = false;
        } else {
            self.min = self.min.min(cell);
            self.max = self.max.max(cell);
        }
    }

    /// Inclusive minimum corner. Meaningless while empty.
    #[must_use]
    pub fn min(&self) -> IVec3 {
        self.min
    }

    /// Inclusive maximum corner. Meaningless while empty.
    #[must_use]
    pub fn max(&self) -> IVec3 {
        self.max
    }

    /// Cell count along each axis.
    #[must_use]
    pub fn extent(&self) -> IVec3 {
        if self.empty {
            IVec3::ZERO
        } else {
            self.max - self.min + IVec3::ONE
        }
    }
}

impl Default for VolumeBounds {
    fn default() -> Self {
        Self::empty()
    }
}
