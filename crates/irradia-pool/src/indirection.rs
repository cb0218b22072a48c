//! Global indirection table.
//!
//! One entry per coarse spatial block, three u32 words each, decoded per
//! sample on the GPU. The bit layout is a contract with the shader decoder:
//!
//! - word 0: `first_chunk_index` in bits 0..29, `min_subdiv` in bits 29..32
//! - word 1: min local brick index, 10 bits per axis (x | y << 10 | z << 20)
//! - word 2: size of the valid range, same 10-bit axis layout
//!
//! An all-ones entry is the "no data" sentinel; readers must skip it.

use glam::{IVec3, UVec3};
use irradia_core::cell::IndirectionEntryDesc;
use irradia_core::constants::ENTRY_MAX_SUBDIV_LEVEL;
use irradia_core::hierarchy::cell_size_in_bricks;

/// Words per entry in the flat buffer.
pub const WORDS_PER_ENTRY: usize = 3;

/// Packed sentinel meaning "no data for this entry".
pub const SENTINEL_WORDS: [u32; WORDS_PER_ENTRY] = [u32::MAX; WORDS_PER_ENTRY];

const CHUNK_INDEX_BITS: u32 = 29;
const CHUNK_INDEX_MASK: u32 = (1 << CHUNK_INDEX_BITS) - 1;
const AXIS_BITS: u32 = 10;
const AXIS_MASK: u32 = (1 << AXIS_BITS) - 1;

/// Decoded form of one indirection entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndirectionEntry {
    /// First index buffer chunk holding the entry's brick indices.
    pub first_chunk_index: u32,
    /// Smallest subdivision level with data in the entry.
    pub min_subdiv: u8,
    /// Minimum valid local brick index per axis.
    pub min_local_brick_index: UVec3,
    /// Valid range extent per axis, in minimum bricks.
    pub size_of_valid_range: UVec3,
}

impl IndirectionEntry {
    /// Pack into the three-word GPU layout.
    #[must_use]
    pub fn pack(&self) -> [u32; WORDS_PER_ENTRY] {
        debug_assert!(self.first_chunk_index <= CHUNK_INDEX_MASK);
        debug_assert!(u32::from(self.min_subdiv) < 8);

        let pack_axes = |v: UVec3| {
            debug_assert!(v.x <= AXIS_MASK && v.y <= AXIS_MASK && v.z <= AXIS_MASK);
            (v.x & AXIS_MASK) | ((v.y & AXIS_MASK) << AXIS_BITS) | ((v.z & AXIS_MASK) << (2 * AXIS_BITS))
        };

        [
            (self.first_chunk_index & CHUNK_INDEX_MASK)
                | (u32::from(self.min_subdiv) << CHUNK_INDEX_BITS),
            pack_axes(self.min_local_brick_index),
            pack_axes(self.size_of_valid_range),
        ]
    }

    /// Unpack from the three-word GPU layout.
    #[must_use]
    pub fn unpack(words: [u32; WORDS_PER_ENTRY]) -> Self {
        let unpack_axes = |w: u32| {
            UVec3::new(
                w & AXIS_MASK,
                (w >> AXIS_BITS) & AXIS_MASK,
                (w >> (2 * AXIS_BITS)) & AXIS_MASK,
            )
        };
        Self {
            first_chunk_index: words[0] & CHUNK_INDEX_MASK,
            min_subdiv: (words[0] >> CHUNK_INDEX_BITS) as u8,
            min_local_brick_index: unpack_axes(words[1]),
            size_of_valid_range: unpack_axes(words[2]),
        }
    }

    /// Build an entry from a baked entry descriptor and the index chunk its
    /// brick data landed in.
    #[must_use]
    pub fn from_desc(desc: &IndirectionEntryDesc, first_chunk_index: u32) -> Self {
        let entry_size = cell_size_in_bricks(ENTRY_MAX_SUBDIV_LEVEL);
        if desc.has_only_bigger_bricks {
            // Clipping is meaningless; expose the whole entry as valid.
            Self {
                first_chunk_index,
                min_subdiv: ENTRY_MAX_SUBDIV_LEVEL,
                min_local_brick_index: UVec3::ZERO,
                size_of_valid_range: UVec3::splat(entry_size),
            }
        } else {
            Self {
                first_chunk_index,
                min_subdiv: desc.min_subdiv,
                min_local_brick_index: desc.min_brick_pos.as_uvec3(),
                size_of_valid_range: (desc.max_brick_pos_plus_one - desc.min_brick_pos).as_uvec3(),
            }
        }
    }
}

/// CPU mirror of the flat indirection buffer with lazy GPU upload.
///
/// The mirror is mutated by the streaming system only; `compute_data`
/// copies it to the upload-side buffer on the first read after a dirty
/// write, so redundant uploads within a frame collapse into one.
#[derive(Debug, Clone)]
pub struct GlobalIndirection {
    /// Entries per cell along each axis.
    entries_per_cell: u32,
    /// Entry size in minimum bricks.
    entry_size_in_bricks: u32,
    bounds_min: IVec3,
    dims: UVec3,
    words: Vec<u32>,
    gpu_words: Vec<u32>,
    dirty: bool,
}

impl GlobalIndirection {
    /// Create a table for a set with the given maximum subdivision.
    #[must_use]
    pub fn new(max_subdivision: u8) -> Self {
        let entry_level = max_subdivision.min(ENTRY_MAX_SUBDIV_LEVEL);
        let entries_per_cell =
            cell_size_in_bricks(max_subdivision) / cell_size_in_bricks(entry_level);
        Self {
            entries_per_cell,
            entry_size_in_bricks: cell_size_in_bricks(entry_level),
            bounds_min: IVec3::ZERO,
            dims: UVec3::ZERO,
            words: Vec::new(),
            gpu_words: Vec::new(),
            dirty: false,
        }
    }

    /// Entries per cell along one axis.
    #[must_use]
    pub fn entries_per_cell(&self) -> u32 {
        self.entries_per_cell
    }

    /// Resize to cover a cell-space bounding box; all entries reset to the
    /// sentinel.
    pub fn set_cell_bounds(&mut self, min_cell: IVec3, cell_extent: UVec3) {
        self.bounds_min = min_cell * self.entries_per_cell as i32;
        self.dims = cell_extent * self.entries_per_cell;
        let entry_count = (self.dims.x * self.dims.y * self.dims.z) as usize;
        self.words = vec![u32::MAX; entry_count * WORDS_PER_ENTRY];
        self.gpu_words = self.words.clone();
        self.dirty = false;
    }

    /// Number of entries in the table.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.words.len() / WORDS_PER_ENTRY
    }

    /// Flat entry index for a baked entry of a cell, or `None` when outside
    /// the current bounds.
    #[must_use]
    pub fn entry_flat_index(&self, cell_position: IVec3, desc: &IndirectionEntryDesc) -> Option<u32> {
        let entry = cell_position * self.entries_per_cell as i32
            + desc.position_in_bricks / self.entry_size_in_bricks as i32;
        let local = entry - self.bounds_min;
        if local.min_element() < 0 {
            return None;
        }
        let local = local.as_uvec3();
        if local.x >= self.dims.x || local.y >= self.dims.y || local.z >= self.dims.z {
            return None;
        }
        Some(local.z * (self.dims.x * self.dims.y) + local.y * self.dims.x + local.x)
    }

    /// Write one entry's packed words.
    pub fn set_entry(&mut self, flat_index: u32, words: [u32; WORDS_PER_ENTRY]) {
        let start = flat_index as usize * WORDS_PER_ENTRY;
        self.words[start..start + WORDS_PER_ENTRY].copy_from_slice(&words);
        self.dirty = true;
    }

    /// Read one entry's packed words from the CPU mirror.
    #[must_use]
    pub fn entry(&self, flat_index: u32) -> [u32; WORDS_PER_ENTRY] {
        let start = flat_index as usize * WORDS_PER_ENTRY;
        [self.words[start], self.words[start + 1], self.words[start + 2]]
    }

    /// Write the sentinel to every listed entry.
    pub fn mark_entries_unloaded(&mut self, flat_indices: &[u32]) {
        for &index in flat_indices {
            self.set_entry(index, SENTINEL_WORDS);
        }
    }

    /// Whether a write happened since the last upload.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// The upload-side buffer, refreshed from the mirror if dirty.
    pub fn compute_data(&mut self) -> &[u32] {
        if self.dirty {
            self.gpu_words.copy_from_slice(&self.words);
            self.dirty = false;
            tracing::trace!(entries = self.entry_count(), "indirection buffer uploaded");
        }
        &self.gpu_words
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_round_trip() {
        let entry = IndirectionEntry {
            first_chunk_index: 12345,
            min_subdiv: 2,
            min_local_brick_index: UVec3::new(3, 1, 0),
            size_of_valid_range: UVec3::new(4, 4, 4),
        };
        assert_eq!(IndirectionEntry::unpack(entry.pack()), entry);
    }

    #[test]
    fn pack_uses_expected_bit_positions() {
        let entry = IndirectionEntry {
            first_chunk_index: 1,
            min_subdiv: 7,
            min_local_brick_index: UVec3::new(1, 2, 3),
            size_of_valid_range: UVec3::new(1023, 0, 1),
        };
        let words = entry.pack();
        assert_eq!(words[0], 1 | (7 << 29));
        assert_eq!(words[1], 1 | (2 << 10) | (3 << 20));
        assert_eq!(words[2], 1023 | (1 << 20));
    }

    #[test]
    fn pack_extremes_round_trip() {
        let entry = IndirectionEntry {
            first_chunk_index: (1 << 29) - 1,
            min_subdiv: 7,
            min_local_brick_index: UVec3::splat(1023),
            size_of_valid_range: UVec3::ZERO,
        };
        assert_eq!(IndirectionEntry::unpack(entry.pack()), entry);
    }

    fn entry_desc(position_in_bricks: IVec3) -> IndirectionEntryDesc {
        IndirectionEntryDesc {
            position_in_bricks,
            min_subdiv: 1,
            min_brick_pos: IVec3::ZERO,
            max_brick_pos_plus_one: IVec3::splat(27),
            has_only_bigger_bricks: false,
        }
    }

    #[test]
    fn table_starts_as_sentinel() {
        let mut table = GlobalIndirection::new(4);
        // 4 - 3 levels above entry size: 3 entries per cell axis.
        assert_eq!(table.entries_per_cell(), 3);

        table.set_cell_bounds(IVec3::new(-1, 0, 0), UVec3::new(2, 1, 1));
        assert_eq!(table.entry_count(), (2 * 3) * 3 * 3);
        for i in 0..table.entry_count() as u32 {
            assert_eq!(table.entry(i), SENTINEL_WORDS);
        }
    }

    #[test]
    fn flat_index_respects_bounds() {
        let mut table = GlobalIndirection::new(3); // one entry per cell
        table.set_cell_bounds(IVec3::ZERO, UVec3::new(2, 2, 2));

        let desc = entry_desc(IVec3::ZERO);
        assert_eq!(table.entry_flat_index(IVec3::ZERO, &desc), Some(0));
        assert_eq!(table.entry_flat_index(IVec3::new(1, 1, 1), &desc), Some(7));
        assert_eq!(table.entry_flat_index(IVec3::new(2, 0, 0), &desc), None);
        assert_eq!(table.entry_flat_index(IVec3::new(-1, 0, 0), &desc), None);
    }

    #[test]
    fn lazy_upload_only_when_dirty() {
        let mut table = GlobalIndirection::new(3);
        table.set_cell_bounds(IVec3::ZERO, UVec3::ONE);
        assert!(!table.is_dirty());

        let entry = IndirectionEntry {
            first_chunk_index: 9,
            min_subdiv: 1,
            min_local_brick_index: UVec3::ZERO,
            size_of_valid_range: UVec3::splat(27),
        };
        table.set_entry(0, entry.pack());
        assert!(table.is_dirty());

        let uploaded = table.compute_data().to_vec();
        assert_eq!(&uploaded[0..3], &entry.pack());
        assert!(!table.is_dirty());

        table.mark_entries_unloaded(&[0]);
        assert!(table.is_dirty());
        assert_eq!(&table.compute_data()[0..3], &SENTINEL_WORDS);
    }

    #[test]
    fn bigger_bricks_expose_full_entry() {
        let desc = IndirectionEntryDesc {
            position_in_bricks: IVec3::ZERO,
            min_subdiv: 5,
            min_brick_pos: IVec3::ZERO,
            max_brick_pos_plus_one: IVec3::ZERO,
            has_only_bigger_bricks: true,
        };
        let entry = IndirectionEntry::from_desc(&desc, 4);
        assert_eq!(entry.min_subdiv, ENTRY_MAX_SUBDIV_LEVEL);
        assert_eq!(entry.size_of_valid_range, UVec3::splat(27));
        assert_eq!(entry.first_chunk_index, 4);
    }
}
