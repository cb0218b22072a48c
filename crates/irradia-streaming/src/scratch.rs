//! Scratch buffers staging disk reads on their way to the brick pool.
//!
//! A scratch buffer holds one cell's worth of chunk data, per channel
//! contiguous, preceded by the destination chunk coordinates the upload
//! pass consumes. Buffers are pooled in power-of-two chunk-count classes
//! and recycled across requests.

use irradia_core::constants::CHUNK_PROBE_COUNT;
use irradia_core::{ChannelSet, ShBands};
use irradia_pool::{Chunk, ChunkPayload, TexelFormat};

/// Bytes of one chunk in the given channel format.
#[must_use]
pub fn chunk_channel_bytes(format: TexelFormat) -> usize {
    CHUNK_PROBE_COUNT as usize * format.texel_size()
}

/// Byte offsets of every section within a scratch buffer.
///
/// Sections in order: destination chunk coordinates for scenario channels,
/// destination chunk coordinates for shared channels, then one contiguous
/// run per channel. Optional channels the baked set does not carry have no
/// section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScratchBufferLayout {
    pub chunk_count: u32,
    pub dest_chunks_offset: usize,
    pub shared_dest_chunks_offset: usize,
    pub sh_l0_l1rx_offset: usize,
    pub sh_l1g_l1ry_offset: usize,
    pub sh_l1b_l1rz_offset: usize,
    pub sh_l2_offsets: Option<[usize; 4]>,
    pub probe_occlusion_offset: Option<usize>,
    pub validity_offset: Option<usize>,
    pub sky_occlusion_offset: Option<usize>,
    pub sky_shading_direction_offset: Option<usize>,
    pub buffer_size: usize,
}

impl ScratchBufferLayout {
    /// Lay out a buffer for `chunk_count` chunks of the given channels.
    #[must_use]
    pub fn new(
        chunk_count: u32,
        bands: ShBands,
        channels: ChannelSet,
        with_probe_occlusion: bool,
    ) -> Self {
        let count = chunk_count as usize;
        // Four u32 per destination chunk, shader-side addressing.
        let dest_run = count * 4 * std::mem::size_of::<u32>();

        let mut cursor = 0;
        let mut take = |bytes: usize| {
            let offset = cursor;
            cursor += bytes;
            offset
        };

        let dest_chunks_offset = take(dest_run);
        let shared_dest_chunks_offset = take(dest_run);

        let sh_l0_l1rx_offset = take(count * chunk_channel_bytes(TexelFormat::Rgba16F));
        let sh_l1g_l1ry_offset = take(count * chunk_channel_bytes(TexelFormat::Rgba8));
        let sh_l1b_l1rz_offset = take(count * chunk_channel_bytes(TexelFormat::Rgba8));
        let sh_l2_offsets = (bands == ShBands::L2).then(|| {
            [
                take(count * chunk_channel_bytes(TexelFormat::Rgba8)),
                take(count * chunk_channel_bytes(TexelFormat::Rgba8)),
                take(count * chunk_channel_bytes(TexelFormat::Rgba8)),
                take(count * chunk_channel_bytes(TexelFormat::Rgba8)),
            ]
        });
        let probe_occlusion_offset = (with_probe_occlusion && channels.probe_occlusion)
            .then(|| take(count * chunk_channel_bytes(TexelFormat::Rgba8)));
        let validity_offset =
            channels.validity.then(|| take(count * chunk_channel_bytes(TexelFormat::R8)));
        let sky_occlusion_offset = channels
            .sky_occlusion
            .then(|| take(count * chunk_channel_bytes(TexelFormat::Rgba16F)));
        let sky_shading_direction_offset = channels
            .sky_shading_direction
            .then(|| take(count * chunk_channel_bytes(TexelFormat::R8)));

        Self {
            chunk_count,
            dest_chunks_offset,
            shared_dest_chunks_offset,
            sh_l0_l1rx_offset,
            sh_l1g_l1ry_offset,
            sh_l1b_l1rz_offset,
            sh_l2_offsets,
            probe_occlusion_offset,
            validity_offset,
            sky_occlusion_offset,
            sky_shading_direction_offset,
            buffer_size: cursor,
        }
    }
}

/// A pooled staging buffer with a double-buffered upload target.
///
/// The frame loop fills `staging` from completed disk reads, then `upload`
/// publishes it to the back target and swaps, so a copy still in flight on
/// the front buffer is never overwritten.
#[derive(Debug)]
pub struct ScratchBuffer {
    chunk_count: u32,
    staging: Vec<u8>,
    targets: [Vec<u8>; 2],
    front: usize,
}

impl ScratchBuffer {
    #[must_use]
    pub fn new(chunk_count: u32, byte_size: usize) -> Self {
        Self {
            chunk_count,
            staging: vec![0; byte_size],
            targets: [vec![0; byte_size], vec![0; byte_size]],
            front: 0,
        }
    }

    /// Chunk capacity of this buffer's size class.
    #[must_use]
    pub fn chunk_count(&self) -> u32 {
        self.chunk_count
    }

    #[must_use]
    pub fn byte_size(&self) -> usize {
        self.staging.len()
    }

    pub fn staging_mut(&mut self) -> &mut [u8] {
        &mut self.staging
    }

    /// Write the destination chunk coordinate runs for a layout.
    pub fn write_dest_chunks(&mut self, layout: &ScratchBufferLayout, chunks: &[Chunk]) {
        debug_assert_eq!(chunks.len(), layout.chunk_count as usize);
        for (i, chunk) in chunks.iter().enumerate() {
            let words = [chunk.x, chunk.y, chunk.z, 0u32];
            for base in [layout.dest_chunks_offset, layout.shared_dest_chunks_offset] {
                let at = base + i * 4 * std::mem::size_of::<u32>();
                for (w, word) in words.iter().enumerate() {
                    let bytes = word.to_le_bytes();
                    let dst = at + w * std::mem::size_of::<u32>();
                    self.staging[dst..dst + 4].copy_from_slice(&bytes);
                }
            }
        }
    }

    /// Publish the staging contents to the back target and swap.
    pub fn upload(&mut self) {
        let back = 1 - self.front;
        let size = self.staging.len();
        self.targets[back][..size].copy_from_slice(&self.staging[..size]);
        self.front = back;
    }

    /// The most recently uploaded target.
    #[must_use]
    pub fn front(&self) -> &[u8] {
        &self.targets[self.front]
    }

    /// Per-channel views over the uploaded target, sized by `layout`.
    ///
    /// `used_chunks` may be smaller than the buffer's class when a cell
    /// does not fill its rounded-up size.
    #[must_use]
    pub fn payload<'a>(&'a self, layout: &ScratchBufferLayout) -> ChunkPayload<'a> {
        let front = self.front();
        let count = layout.chunk_count as usize;
        let section = |offset: usize, format: TexelFormat| {
            &front[offset..offset + count * chunk_channel_bytes(format)]
        };

        ChunkPayload {
            sh_l0_l1rx: section(layout.sh_l0_l1rx_offset, TexelFormat::Rgba16F),
            sh_l1g_l1ry: section(layout.sh_l1g_l1ry_offset, TexelFormat::Rgba8),
            sh_l1b_l1rz: section(layout.sh_l1b_l1rz_offset, TexelFormat::Rgba8),
            sh_l2: layout.sh_l2_offsets.map(|offsets| {
                [
                    section(offsets[0], TexelFormat::Rgba8),
                    section(offsets[1], TexelFormat::Rgba8),
                    section(offsets[2], TexelFormat::Rgba8),
                    section(offsets[3], TexelFormat::Rgba8),
                ]
            }),
            validity: layout
                .validity_offset
                .map(|offset| section(offset, TexelFormat::R8)),
            probe_occlusion: layout
                .probe_occlusion_offset
                .map(|offset| section(offset, TexelFormat::Rgba8)),
            sky_occlusion: layout
                .sky_occlusion_offset
                .map(|offset| section(offset, TexelFormat::Rgba16F)),
            sky_shading_direction: layout
                .sky_shading_direction_offset
                .map(|offset| section(offset, TexelFormat::R8)),
        }
    }
}

/// Recycling pool of scratch buffers in power-of-two chunk-count classes.
///
/// Live memory is capped; when a class is exhausted and the cap would be
/// exceeded, allocation fails and the request stays pending for a later
/// frame.
#[derive(Debug)]
pub struct ScratchBufferPool {
    bands: ShBands,
    channels: ChannelSet,
    with_probe_occlusion: bool,
    free: Vec<ScratchBuffer>,
    live_bytes: usize,
    max_live_bytes: usize,
}

impl ScratchBufferPool {
    #[must_use]
    pub fn new(
        bands: ShBands,
        channels: ChannelSet,
        with_probe_occlusion: bool,
        max_live_bytes: usize,
    ) -> Self {
        Self {
            bands,
            channels,
            with_probe_occlusion,
            free: Vec::new(),
            live_bytes: 0,
            max_live_bytes,
        }
    }

    /// Layout for a cell of `chunk_count` chunks with this pool's channels.
    #[must_use]
    pub fn layout(&self, chunk_count: u32) -> ScratchBufferLayout {
        ScratchBufferLayout::new(chunk_count, self.bands, self.channels, self.with_probe_occlusion)
    }

    /// Size class for a chunk count.
    #[must_use]
    fn class_of(chunk_count: u32) -> u32 {
        chunk_count.next_power_of_two()
    }

    /// Take a buffer fitting `chunk_count` chunks, or `None` when the live
    /// memory cap is reached.
    pub fn allocate(&mut self, chunk_count: u32) -> Option<ScratchBuffer> {
        let class = Self::class_of(chunk_count);
        if let Some(at) = self.free.iter().position(|b| b.chunk_count() == class) {
            return Some(self.free.swap_remove(at));
        }

        let class_layout =
            ScratchBufferLayout::new(class, self.bands, self.channels, self.with_probe_occlusion);
        if self.live_bytes + class_layout.buffer_size > self.max_live_bytes {
            tracing::debug!(
                chunks = chunk_count,
                live = self.live_bytes,
                cap = self.max_live_bytes,
                "scratch buffer pool exhausted"
            );
            return None;
        }
        self.live_bytes += class_layout.buffer_size;
        Some(ScratchBuffer::new(class, class_layout.buffer_size))
    }

    /// Return a buffer for reuse.
    pub fn release(&mut self, buffer: ScratchBuffer) {
        self.free.push(buffer);
    }

    /// Bytes of scratch memory ever allocated and still owned by the pool
    /// or its borrowers.
    #[must_use]
    pub fn live_bytes(&self) -> usize {
        self.live_bytes
    }
}
