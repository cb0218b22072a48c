//! Cell streaming for the irradia probe volume runtime.
//!
//! This crate drives what lives in the GPU pools frame to frame:
//! - Distance and visibility scoring of cells
//! - Asynchronous disk reads through a dedicated worker thread
//! - Scratch buffer staging between disk and the pools
//! - Cell lifecycle, eviction and index defragmentation
//! - Lighting scenario switching and blending
//!
//! [`ProbeStreamingSystem`] is the entry point; everything else supports
//! it.

pub mod blend;
pub mod cell;
pub mod format;
pub mod request;
pub mod scratch;
pub mod score;
pub mod settings;
pub mod source;
pub mod system;

pub use cell::{Cell, CellBlendingInfo, CellIndexInfo, CellPoolInfo};
pub use request::{CellStreamingRequest, PoolTarget, ReadKind, RequestId, RequestState};
pub use scratch::{ScratchBuffer, ScratchBufferLayout, ScratchBufferPool};
pub use score::{streaming_score, Score};
pub use settings::{StreamingSettings, MAX_CELLS_LOADED_PER_FRAME};
pub use source::{
    CellDataSource, CellLocation, DiskReader, FileCellSource, MemoryCellSource, ReadCommand,
    ReadId, ReadStatus, SourceId,
};
pub use system::{
    BakingSet, BakingSetAssets, ProbeStreamingSystem, RuntimeResources, StreamableAsset,
    StreamingConfig,
};
