//! Atlas chunk slots.

use glam::UVec3;
use irradia_core::constants::{BRICK_PROBE_COUNT_PER_DIM, CHUNK_PROBE_COUNT_PER_DIM};

/// One allocation slot in a brick pool atlas, in chunk grid units.
///
/// A chunk spans `128 * 4` texels along x and `4` texels along y and z.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Chunk {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Chunk {
    /// Chunk extent in texels.
    #[must_use]
    pub const fn texel_extent() -> UVec3 {
        UVec3::new(
            CHUNK_PROBE_COUNT_PER_DIM,
            BRICK_PROBE_COUNT_PER_DIM,
            BRICK_PROBE_COUNT_PER_DIM,
        )
    }

    /// Texel offset of this slot's minimum corner in the atlas.
    #[must_use]
    pub fn texel_offset(&self) -> UVec3 {
        UVec3::new(self.x, self.y, self.z) * Self::texel_extent()
    }

    /// Row-major linear slot index (x fastest, then y, then z).
    ///
    /// This flattening is the addressing contract shared with the shader
    /// decoder and with [`crate::indirection`] packing; the three must agree
    /// bit for bit.
    #[must_use]
    pub fn flatten_index(&self, slots_x: u32, slots_y: u32) -> u32 {
        self.z * (slots_x * slots_y) + self.y * slots_x + self.x
    }
}
