//! Flat brick index buffer with chunked allocation.
//!
//! Cells get contiguous runs of index chunks, so unloading leaves holes;
//! the fragmentation rate below drives the defragmentation pass in the
//! streaming system.

use irradia_core::constants::INDEX_CHUNK_SIZE;

/// The flat per-voxel brick index buffer, allocated in fixed-size chunks.
#[derive(Debug, Clone)]
pub struct BrickIndex {
    used: Vec<bool>,
    used_count: u32,
    /// One past the highest chunk ever handed out and still in use.
    next_free_chunk: u32,
    data: Vec<u32>,
}

impl BrickIndex {
    /// All-ones entry meaning "no brick data here".
    pub const UNUSED_ENTRY: u32 = u32::MAX;

    /// Create an index buffer with the given chunk capacity.
    #[must_use]
    pub fn new(capacity_in_chunks: u32) -> Self {
        Self {
            used: vec![false; capacity_in_chunks as usize],
            used_count: 0,
            next_free_chunk: 0,
            data: vec![Self::UNUSED_ENTRY; (capacity_in_chunks * INDEX_CHUNK_SIZE) as usize],
        }
    }

    #[must_use]
    pub fn chunk_capacity(&self) -> u32 {
        self.used.len() as u32
    }

    #[must_use]
    pub fn remaining_chunks(&self) -> u32 {
        self.chunk_capacity() - self.used_count
    }

    /// Ratio of free holes below the allocation high-water mark.
    ///
    /// Zero when the used region is perfectly compact; approaches one as
    /// released runs accumulate between live ones.
    #[must_use]
    pub fn fragmentation_rate(&self) -> f32 {
        if self.next_free_chunk == 0 {
            return 0.0;
        }
        let used_below = self.used[..self.next_free_chunk as usize]
            .iter()
            .filter(|&&u| u)
            .count() as u32;
        (self.next_free_chunk - used_below) as f32 / self.next_free_chunk as f32
    }

    /// Allocate a contiguous run of `count` chunks, first fit.
    ///
    /// Returns the first chunk index, or `None` when no contiguous run
    /// exists (capacity or fragmentation).
    pub fn allocate(&mut self, count: u32) -> Option<u32> {
        if count == 0 || count > self.remaining_chunks() {
            return None;
        }
        let capacity = self.chunk_capacity();
        let mut run_start = 0;
        let mut run_len = 0;
        for i in 0..capacity {
            if self.used[i as usize] {
                run_start = i + 1;
                run_len = 0;
            } else {
                run_len += 1;
                if run_len == count {
                    for j in run_start..run_start + count {
                        self.used[j as usize] = true;
                    }
                    self.used_count += count;
                    self.next_free_chunk = self.next_free_chunk.max(run_start + count);
                    return Some(run_start);
                }
            }
        }
        None
    }

    /// Return a run of chunks to the free set and clear their entries.
    pub fn release(&mut self, first_chunk: u32, count: u32) {
        for i in first_chunk..first_chunk + count {
            debug_assert!(self.used[i as usize], "double release of index chunk {i}");
            self.used[i as usize] = false;
        }
        self.used_count -= count;

        let start = (first_chunk * INDEX_CHUNK_SIZE) as usize;
        let end = ((first_chunk + count) * INDEX_CHUNK_SIZE) as usize;
        self.data[start..end].fill(Self::UNUSED_ENTRY);

        // Lower the high-water mark past any trailing free run.
        while self.next_free_chunk > 0 && !self.used[self.next_free_chunk as usize - 1] {
            self.next_free_chunk -= 1;
        }
    }

    /// Write brick entries starting at the given chunk.
    ///
    /// # Panics
    ///
    /// Panics if the entries overrun the buffer; the caller allocated the
    /// run and owns sizing.
    pub fn write_entries(&mut self, first_chunk: u32, entries: &[u32]) {
        let start = (first_chunk * INDEX_CHUNK_SIZE) as usize;
        self.data[start..start + entries.len()].copy_from_slice(entries);
    }

    /// Read back entries starting at the given chunk.
    #[must_use]
    pub fn entries(&self, first_chunk: u32, count: usize) -> &[u32] {
        let start = (first_chunk * INDEX_CHUNK_SIZE) as usize;
        &self.data[start..start + count]
    }

    /// Drop all allocations and entries.
    pub fn clear(&mut self) {
        self.used.fill(false);
        self.used_count = 0;
        self.next_free_chunk = 0;
        self.data.fill(Self::UNUSED_ENTRY);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_contiguous_runs() {
        let mut index = BrickIndex::new(8);
        assert_eq!(index.allocate(3), Some(0));
        assert_eq!(index.allocate(2), Some(3));
        assert_eq!(index.remaining_chunks(), 3);
    }

    #[test]
    fn refuses_when_no_contiguous_run() {
        let mut index = BrickIndex::new(6);
        let a = index.allocate(2).unwrap();
        let _b = index.allocate(2).unwrap();
        let _c = index.allocate(2).unwrap();
        index.release(a, 2);

        // 2 free at the front, but nothing holds 3.
        assert_eq!(index.remaining_chunks(), 2);
        assert_eq!(index.allocate(3), None);
        assert_eq!(index.allocate(2), Some(0));
    }

    #[test]
    fn fragmentation_rate_tracks_holes() {
        let mut index = BrickIndex::new(10);
        let a = index.allocate(2).unwrap();
        let _b = index.allocate(2).unwrap();
        let c = index.allocate(2).unwrap();
        assert_eq!(index.fragmentation_rate(), 0.0);

        index.release(a, 2);
        // Holes 0..2 below high-water mark 6.
        assert!((index.fragmentation_rate() - 2.0 / 6.0).abs() < 1e-6);

        // Releasing the trailing run lowers the mark instead.
        index.release(c, 2);
        assert!((index.fragmentation_rate() - 2.0 / 4.0).abs() < 1e-6);
    }

    #[test]
    fn release_clears_entries() {
        let mut index = BrickIndex::new(2);
        let first = index.allocate(1).unwrap();
        index.write_entries(first, &[1, 2, 3]);
        assert_eq!(index.entries(first, 3), &[1, 2, 3]);

        index.release(first, 1);
        assert_eq!(index.entries(first, 3), &[BrickIndex::UNUSED_ENTRY; 3]);
    }
}
