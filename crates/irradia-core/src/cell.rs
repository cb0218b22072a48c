//! Cell descriptors, baked payloads and memory budget configuration.

use glam::{IVec3, Vec3};
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

/// A brick covers `3^subdivision_level` minimum bricks per axis starting at
/// `position` (in minimum-brick units relative to the owning cell).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Brick {
    pub position: IVec3,
    pub subdivision_level: u8,
}

/// Baked per-entry information used to fill the global indirection table
/// without re-analyzing cell contents at load time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndirectionEntryDesc {
    /// Entry position in minimum-brick units.
    pub position_in_bricks: IVec3,
    /// Smallest subdivision level of any brick touching the entry.
    pub min_subdiv: u8,
    /// Minimum brick position covered by valid data, local to the entry.
    pub min_brick_pos: IVec3,
    /// One past the maximum valid brick position, local to the entry.
    pub max_brick_pos_plus_one: IVec3,
    /// The entry only contains bricks larger than the entry itself; min/max
    /// clipping is meaningless and skipped.
    pub has_only_bigger_bricks: bool,
}

/// Immutable descriptor of a baked cell.
#[derive(Debug, Clone)]
pub struct CellDesc {
    /// Position on the cell grid.
    pub position: IVec3,
    /// Linear index within the baked set.
    pub index: u32,
    pub probe_count: u32,
    pub brick_count: u32,
    /// Smallest subdivision level present in the cell.
    pub min_subdiv: u8,
    /// Index buffer chunks the cell occupies when resident.
    pub index_chunk_count: u32,
    /// Brick pool chunks the cell occupies when resident.
    pub sh_chunk_count: u32,
    /// Global indirection entries the cell touches.
    pub indirection_entries: Vec<IndirectionEntryDesc>,
}

impl CellDesc {
    /// World-space center of the cell given the cell side length.
    #[must_use]
    pub fn center(&self, cell_size: f32) -> Vec3 {
        (self.position.as_vec3() + Vec3::splat(0.5)) * cell_size
    }
}

/// Baked probe data for one lighting scenario.
///
/// Array lengths are `probe_count` texels of the respective channel format.
#[derive(Debug, Clone, Default)]
pub struct ScenarioPayload {
    /// L0 irradiance + L1 red x component, four u16 per probe.
    pub sh_l0_l1rx: Vec<u16>,
    /// L1 green + L1 red y component, four u8 per probe.
    pub sh_l1g_l1ry: Vec<u8>,
    /// L1 blue + L1 red z component, four u8 per probe.
    pub sh_l1b_l1rz: Vec<u8>,
    /// Optional L2 band, four textures of four u8 per probe.
    pub sh_l2: Option<[Vec<u8>; 4]>,
    /// Optional per-light occlusion, four u8 per probe.
    pub probe_occlusion: Option<Vec<u8>>,
}

/// Support data used by tooling; streamed but never GPU-resident.
#[derive(Debug, Clone, Default)]
pub struct SupportData {
    pub probe_positions: Vec<Vec3>,
    pub validity: Vec<f32>,
    pub offset_vectors: Vec<Vec3>,
}

/// Baked payload of a cell. Dropped wholesale on unload.
#[derive(Debug, Clone, Default)]
pub struct CellData {
    /// Validity neighbourhood mask, one u8 per probe. Shared across scenarios.
    pub validity_neigh_mask: Vec<u8>,
    /// Optional sky occlusion L0/L1, four u16 per probe.
    pub sky_occlusion_l0l1: Option<Vec<u16>>,
    /// Optional sky shading direction indices, one u8 per probe.
    pub sky_shading_direction_indices: Option<Vec<u8>>,
    /// Brick list, filled when the cell is streamed in.
    pub bricks: Vec<Brick>,
    /// Per-scenario payloads keyed by scenario name.
    pub scenarios: HashMap<String, ScenarioPayload>,
    /// Optional support arrays.
    pub support: Option<SupportData>,
}

/// Memory budget for the main brick pool; the value is the texel width of
/// the atlas textures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemoryBudget {
    Low,
    Medium,
    High,
}

impl MemoryBudget {
    /// Atlas width and height in texels.
    #[must_use]
    pub fn texel_width(self) -> u32 {
        match self {
            Self::Low => 512,
            Self::Medium => 1024,
            Self::High => 2048,
        }
    }
}

/// Memory budget for the scenario blending pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlendingMemoryBudget {
    Low,
    Medium,
    High,
}

impl BlendingMemoryBudget {
    /// Atlas width and height in texels.
    #[must_use]
    pub fn texel_width(self) -> u32 {
        match self {
            Self::Low => 128,
            Self::Medium => 256,
            Self::High => 512,
        }
    }
}

/// Spherical harmonics bands carried by the baked set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShBands {
    L1,
    L2,
}

/// Optional data channels enabled for a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChannelSet {
    pub validity: bool,
    pub probe_occlusion: bool,
    pub sky_occlusion: bool,
    pub sky_shading_direction: bool,
}
