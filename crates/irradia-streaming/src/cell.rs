//! Runtime cell state tracked by the streaming system.

use irradia_core::{CellData, CellDesc};
use irradia_pool::Chunk;

use crate::request::RequestId;
use crate::score::Score;

/// Main brick pool residency of a cell.
#[derive(Debug, Default)]
pub struct CellPoolInfo {
    /// Chunks allocated in the main pool, in payload order.
    pub chunks: Vec<Chunk>,
}

/// Index buffer and indirection residency of a cell.
#[derive(Debug, Default)]
pub struct CellIndexInfo {
    /// First chunk of the cell's run in the brick index buffer.
    pub first_index_chunk: u32,
    pub index_chunk_count: u32,
    /// Flat indirection entries the cell wrote; cleared on unload.
    pub flat_indices: Vec<u32>,
    /// Set only after the pool copy for the same load has been issued.
    pub index_updated: bool,
}

/// Scenario blending residency and progress of a cell.
#[derive(Debug)]
pub struct CellBlendingInfo {
    /// Chunks allocated in the blending pools. Both pools share slot
    /// geometry, so one list addresses both.
    pub chunks: Vec<Chunk>,
    /// Blend progress toward the target scenario mix, 0 to 1.
    pub blending_factor: f32,
    /// Priority for the next blend step.
    pub score: Score,
}

impl Default for CellBlendingInfo {
    fn default() -> Self {
        Self {
            chunks: Vec::new(),
            blending_factor: 0.0,
            score: Score::UP_TO_DATE,
        }
    }
}

impl CellBlendingInfo {
    /// Blending data resident in the blending pools.
    #[must_use]
    pub fn is_resident(&self) -> bool {
        !self.chunks.is_empty()
    }

    /// Nothing left to blend for the current scenario mix.
    pub fn mark_up_to_date(&mut self) {
        self.score = Score::UP_TO_DATE;
        self.blending_factor = 0.0;
    }

    /// The scenario mix changed; resident blending data must be uploaded
    /// again before blending resumes.
    pub fn force_reupload(&mut self) {
        self.score = Score::ForceReupload;
    }

    /// Blend ahead of distance order, used when a cell just streamed in
    /// while a blend is in progress.
    pub fn prioritize(&mut self) {
        self.score = Score::Prioritize;
    }

    #[must_use]
    pub fn is_up_to_date(&self) -> bool {
        self.score.is_up_to_date()
    }

    #[must_use]
    pub fn needs_reupload(&self) -> bool {
        matches!(self.score, Score::ForceReupload | Score::Prioritize)
    }
}

/// One cell of the active baked set with its runtime streaming state.
#[derive(Debug)]
pub struct Cell {
    pub desc: CellDesc,
    /// CPU payload, populated while the cell is resident.
    pub data: CellData,
    pub pool_info: CellPoolInfo,
    pub index_info: CellIndexInfo,
    pub blending_info: CellBlendingInfo,
    /// Priority for load and unload decisions this frame.
    pub streaming_score: Score,
    /// Probe volumes referencing the cell. Only unreferenced cells unload.
    pub reference_count: u32,
    /// GPU-resident with index and indirection written.
    pub loaded: bool,
    /// Backing data was missing or corrupt; never retried.
    pub load_error: bool,
    pub streaming_request: Option<RequestId>,
    pub blending_requests: [Option<RequestId>; 2],
}

impl Cell {
    #[must_use]
    pub fn new(desc: CellDesc) -> Self {
        Self {
            desc,
            data: CellData::default(),
            pool_info: CellPoolInfo::default(),
            index_info: CellIndexInfo::default(),
            blending_info: CellBlendingInfo::default(),
            streaming_score: Score::UP_TO_DATE,
            reference_count: 0,
            loaded: false,
            load_error: false,
            streaming_request: None,
            blending_requests: [None, None],
        }
    }

    /// A load for this cell is pending or active.
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.streaming_request.is_some() || self.blending_requests.iter().any(Option::is_some)
    }

    /// Eligible for eviction: resident, unreferenced and not mid-load.
    #[must_use]
    pub fn is_evictable(&self) -> bool {
        self.loaded && self.reference_count == 0 && !self.is_streaming()
    }

    /// Drop all residency bookkeeping after the chunks were released.
    pub fn clear_residency(&mut self) {
        self.pool_info.chunks.clear();
        self.index_info = CellIndexInfo::default();
        self.blending_info = CellBlendingInfo::default();
        self.data = CellData::default();
        self.loaded = false;
    }
}
