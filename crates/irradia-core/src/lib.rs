//! Core types and spatial addressing for the irradia probe volume runtime.
//!
//! This crate provides the foundational pieces shared by the pool and
//! streaming crates:
//! - The ternary brick hierarchy and world/cell addressing
//! - Cell descriptors and baked payload containers
//! - Memory budget configuration enums
//! - Common error types

pub mod cell;
pub mod error;
pub mod hierarchy;

pub use cell::{
    BlendingMemoryBudget, Brick, CellData, CellDesc, ChannelSet, IndirectionEntryDesc,
    MemoryBudget, ScenarioPayload, ShBands, SupportData,
};
pub use error::{Error, Result};
pub use hierarchy::{ProbeHierarchy, VolumeBounds};

/// Runtime-wide constants.
///
/// These match the baked data layout exactly; changing any of them
/// invalidates previously baked sets.
pub mod constants {
    /// Brick subdivision factor per level along each axis (ternary octree).
    pub const BRICK_CELL_COUNT: u32 = 3;
    /// Probes along one axis of a brick.
    pub const BRICK_PROBE_COUNT_PER_DIM: u32 = BRICK_CELL_COUNT + 1;
    /// Total probes in a brick (4^3).
    pub const BRICK_PROBE_COUNT_TOTAL: u32 =
        BRICK_PROBE_COUNT_PER_DIM * BRICK_PROBE_COUNT_PER_DIM * BRICK_PROBE_COUNT_PER_DIM;
    /// Bricks per atlas allocation chunk.
    pub const CHUNK_SIZE_IN_BRICKS: u32 = 128;
    /// Probes along the x axis of one chunk in the atlas.
    pub const CHUNK_PROBE_COUNT_PER_DIM: u32 = CHUNK_SIZE_IN_BRICKS * BRICK_PROBE_COUNT_PER_DIM;
    /// Total probes in a chunk.
    pub const CHUNK_PROBE_COUNT: u32 = CHUNK_SIZE_IN_BRICKS * BRICK_PROBE_COUNT_TOTAL;
    /// Highest subdivision level the hierarchy accepts.
    pub const MAX_SUBDIVISION_LEVELS: u8 = 7;
    /// Subdivision level of one global indirection entry.
    pub const ENTRY_MAX_SUBDIV_LEVEL: u8 = 3;
    /// Brick index entries held by one index buffer chunk (3^5).
    pub const INDEX_CHUNK_SIZE: u32 = 243;
}

/// Integer division rounding up.
#[inline]
#[must_use]
pub const fn div_round_up(x: u32, y: u32) -> u32 {
    (x + y - 1) / y
}
