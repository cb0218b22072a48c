//! GPU atlas allocation and indirection tables for the irradia runtime.
//!
//! Three interlocking resources live here:
//! - [`BrickPool`]: fixed-capacity 3D atlas textures handing out chunk slots
//! - [`BrickIndex`]: the flat per-voxel brick index buffer, chunk-allocated
//! - [`GlobalIndirection`]: the coarse entry table shaders decode per sample
//!
//! The streaming crate sequences writes so the indirection table never
//! points at a chunk whose pool copy has not completed.

pub mod chunk;
pub mod index;
pub mod indirection;
pub mod pool;
pub mod texture;

pub use chunk::Chunk;
pub use index::BrickIndex;
pub use indirection::{GlobalIndirection, IndirectionEntry, SENTINEL_WORDS};
pub use pool::{BrickPool, ChunkPayload};
pub use texture::{ChannelTexture, TexelFormat};
