//! Brick pool: fixed-capacity 3D atlas chunk allocator.

use glam::UVec3;
use irradia_core::constants::{
    BRICK_PROBE_COUNT_PER_DIM, CHUNK_PROBE_COUNT, CHUNK_PROBE_COUNT_PER_DIM,
};
use irradia_core::{ChannelSet, ShBands};

use crate::chunk::Chunk;
use crate::texture::{ChannelTexture, TexelFormat};

/// Per-channel source slices for a pool copy, covering `chunk_count` chunks
/// back to back. Optional channels may be absent; the pool skips them and
/// likewise skips channels it does not carry.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChunkPayload<'a> {
    pub sh_l0_l1rx: &'a [u8],
    pub sh_l1g_l1ry: &'a [u8],
    pub sh_l1b_l1rz: &'a [u8],
    pub sh_l2: Option<[&'a [u8]; 4]>,
    pub validity: Option<&'a [u8]>,
    pub probe_occlusion: Option<&'a [u8]>,
    pub sky_occlusion: Option<&'a [u8]>,
    pub sky_shading_direction: Option<&'a [u8]>,
}

/// A set of channel atlases sharing one chunk slot grid and free-list.
///
/// Chunks are fixed-size so releasing never needs coalescing. Allocation
/// can return fewer chunks than requested when the atlas is exhausted; the
/// caller evicts lower-priority cells and retries on a later frame.
#[derive(Debug)]
pub struct BrickPool {
    tex_l0_l1rx: ChannelTexture,
    tex_l1g_l1ry: ChannelTexture,
    tex_l1b_l1rz: ChannelTexture,
    tex_l2: Option<[ChannelTexture; 4]>,
    tex_validity: Option<ChannelTexture>,
    tex_probe_occlusion: Option<ChannelTexture>,
    tex_sky_occlusion: Option<ChannelTexture>,
    tex_sky_shading_direction: Option<ChannelTexture>,

    slots: UVec3,
    free_list: Vec<Chunk>,
    estimated_byte_cost: usize,
}

impl BrickPool {
    /// Build a pool from the atlas texel width (see `MemoryBudget`), the SH
    /// band count and the enabled optional channels.
    #[must_use]
    pub fn new(texel_width: u32, bands: ShBands, channels: ChannelSet) -> Self {
        Self::with_dimensions(
            texel_width,
            texel_width,
            BRICK_PROBE_COUNT_PER_DIM,
            bands,
            channels,
        )
    }

    /// Build a pool with explicit atlas dimensions. The width must hold at
    /// least one chunk; blending pools use a narrow tall layout so small
    /// budgets still fit whole chunks.
    #[must_use]
    pub fn with_dimensions(
        width: u32,
        height: u32,
        depth: u32,
        bands: ShBands,
        channels: ChannelSet,
    ) -> Self {
        debug_assert!(width >= CHUNK_PROBE_COUNT_PER_DIM);

        let mut cost = 0;
        let mut make = |format: TexelFormat| {
            let tex = ChannelTexture::new(format, width, height, depth);
            cost += tex.byte_cost();
            tex
        };

        let tex_l0_l1rx = make(TexelFormat::Rgba16F);
        let tex_l1g_l1ry = make(TexelFormat::Rgba8);
        let tex_l1b_l1rz = make(TexelFormat::Rgba8);
        let tex_l2 = (bands == ShBands::L2).then(|| {
            [
                make(TexelFormat::Rgba8),
                make(TexelFormat::Rgba8),
                make(TexelFormat::Rgba8),
                make(TexelFormat::Rgba8),
            ]
        });
        let tex_validity = channels.validity.then(|| make(TexelFormat::R8));
        let tex_probe_occlusion = channels.probe_occlusion.then(|| make(TexelFormat::Rgba8));
        let tex_sky_occlusion = channels.sky_occlusion.then(|| make(TexelFormat::Rgba16F));
        let tex_sky_shading_direction = channels
            .sky_shading_direction
            .then(|| make(TexelFormat::R8));

        let slots = UVec3::new(
            width / CHUNK_PROBE_COUNT_PER_DIM,
            height / BRICK_PROBE_COUNT_PER_DIM,
            depth / BRICK_PROBE_COUNT_PER_DIM,
        );

        // Fill in reverse so pops hand out slots in ascending flat order.
        let mut free_list = Vec::with_capacity((slots.x * slots.y * slots.z) as usize);
        for z in (0..slots.z).rev() {
            for y in (0..slots.y).rev() {
                for x in (0..slots.x).rev() {
                    free_list.push(Chunk { x, y, z });
                }
            }
        }

        Self {
            tex_l0_l1rx,
            tex_l1g_l1ry,
            tex_l1b_l1rz,
            tex_l2,
            tex_validity,
            tex_probe_occlusion,
            tex_sky_occlusion,
            tex_sky_shading_direction,
            slots,
            free_list,
            estimated_byte_cost: cost,
        }
    }

    /// Total chunk capacity of the atlas.
    #[must_use]
    pub fn chunk_capacity(&self) -> usize {
        (self.slots.x * self.slots.y * self.slots.z) as usize
    }

    /// Chunks currently available.
    #[must_use]
    pub fn remaining_chunks(&self) -> usize {
        self.free_list.len()
    }

    /// Chunk slot grid dimensions.
    #[must_use]
    pub fn slot_dimensions(&self) -> UVec3 {
        self.slots
    }

    /// Estimated GPU memory cost of all channels in bytes.
    #[must_use]
    pub fn estimated_byte_cost(&self) -> usize {
        self.estimated_byte_cost
    }

    /// Row-major linear index of a chunk slot in this pool.
    #[must_use]
    pub fn chunk_flat_index(&self, chunk: Chunk) -> u32 {
        chunk.flatten_index(self.slots.x, self.slots.y)
    }

    /// Take up to `count` chunks from the free-list.
    ///
    /// Returns fewer than requested when the atlas is exhausted; the caller
    /// must release what it got back (or evict others) before retrying.
    pub fn allocate(&mut self, count: usize) -> Vec<Chunk> {
        let take = count.min(self.free_list.len());
        if take < count {
            tracing::debug!(
                requested = count,
                available = self.free_list.len(),
                "brick pool exhausted"
            );
        }
        self.free_list.split_off(self.free_list.len() - take)
    }

    /// Return chunks to the free-list.
    pub fn release(&mut self, chunks: &[Chunk]) {
        for chunk in chunks {
            debug_assert!(
                !self.free_list.contains(chunk),
                "double release of pool chunk ({}, {}, {})",
                chunk.x,
                chunk.y,
                chunk.z
            );
        }
        self.free_list.extend_from_slice(chunks);
    }

    /// Copy chunk payloads into every present channel texture in lockstep.
    ///
    /// `payload` holds `chunks.len()` chunks of data per channel, back to
    /// back in chunk order. Channels absent on either side are skipped.
    pub fn update(&mut self, chunks: &[Chunk], payload: &ChunkPayload<'_>) {
        let extent = Chunk::texel_extent();
        let probes = CHUNK_PROBE_COUNT as usize;

        for (i, chunk) in chunks.iter().enumerate() {
            let origin = chunk.texel_offset();
            let copy = |tex: &mut ChannelTexture, src: &[u8]| {
                let chunk_bytes = probes * tex.format().texel_size();
                tex.write_region(origin, extent, &src[i * chunk_bytes..(i + 1) * chunk_bytes]);
            };

            copy(&mut self.tex_l0_l1rx, payload.sh_l0_l1rx);
            copy(&mut self.tex_l1g_l1ry, payload.sh_l1g_l1ry);
            copy(&mut self.tex_l1b_l1rz, payload.sh_l1b_l1rz);

            if let (Some(textures), Some(sources)) = (self.tex_l2.as_mut(), payload.sh_l2) {
                for (tex, src) in textures.iter_mut().zip(sources) {
                    copy(tex, src);
                }
            }
            if let (Some(tex), Some(src)) = (self.tex_validity.as_mut(), payload.validity) {
                copy(tex, src);
            }
            if let (Some(tex), Some(src)) =
                (self.tex_probe_occlusion.as_mut(), payload.probe_occlusion)
            {
                copy(tex, src);
            }
            if let (Some(tex), Some(src)) = (self.tex_sky_occlusion.as_mut(), payload.sky_occlusion)
            {
                copy(tex, src);
            }
            if let (Some(tex), Some(src)) = (
                self.tex_sky_shading_direction.as_mut(),
                payload.sky_shading_direction,
            ) {
                copy(tex, src);
            }
        }
    }

    pub fn l0_l1rx(&self) -> &ChannelTexture {
        &self.tex_l0_l1rx
    }

    pub fn l1g_l1ry(&self) -> &ChannelTexture {
        &self.tex_l1g_l1ry
    }

    pub fn l1b_l1rz(&self) -> &ChannelTexture {
        &self.tex_l1b_l1rz
    }

    pub fn l2(&self) -> Option<&[ChannelTexture; 4]> {
        self.tex_l2.as_ref()
    }

    pub fn validity(&self) -> Option<&ChannelTexture> {
        self.tex_validity.as_ref()
    }

    pub fn probe_occlusion(&self) -> Option<&ChannelTexture> {
        self.tex_probe_occlusion.as_ref()
    }

    pub fn sky_occlusion(&self) -> Option<&ChannelTexture> {
        self.tex_sky_occlusion.as_ref()
    }

    pub fn sky_shading_direction(&self) -> Option<&ChannelTexture> {
        self.tex_sky_shading_direction.as_ref()
    }
}
