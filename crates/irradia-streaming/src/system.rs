//! The streaming system: baking set activation, per-frame scheduling,
//! residency and scenario blending.
//!
//! One instance owns the GPU pools, the index and indirection tables, the
//! scratch memory and the disk reader. The host calls `update` once per
//! frame with the camera pose; everything else happens through explicit
//! operations on this type.

use glam::Vec3;
use hashbrown::HashMap;
use irradia_core::constants::{CHUNK_PROBE_COUNT_PER_DIM, CHUNK_SIZE_IN_BRICKS, INDEX_CHUNK_SIZE};
use irradia_core::{
    div_round_up, BlendingMemoryBudget, CellDesc, ChannelSet, Error, MemoryBudget, ProbeHierarchy,
    Result, ScenarioPayload, ShBands, VolumeBounds,
};
use irradia_pool::{
    BrickIndex, BrickPool, Chunk, ChunkPayload, GlobalIndirection, IndirectionEntry,
};
use serde::{Deserialize, Serialize};

use crate::blend::{blend_rgba16f, blend_unorm8};
use crate::cell::Cell;
use crate::format;
use crate::request::{CellStreamingRequest, PoolTarget, ReadKind, RequestId, RequestState};
use crate::scratch::{ScratchBufferLayout, ScratchBufferPool};
use crate::score::{streaming_score, Score};
use crate::settings::StreamingSettings;
use crate::source::{CellDataSource, CellLocation, DiskReader, ReadCommand, ReadStatus, SourceId};

/// Index buffer chunks provisioned per brick pool chunk.
const INDEX_CHUNKS_PER_POOL_CHUNK: u32 = 4;

/// Fragmentation rate above which the index buffer is compacted.
const INDEX_FRAGMENTATION_THRESHOLD: f32 = 0.2;

/// Static configuration of a streaming system instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    pub memory_budget: MemoryBudget,
    pub blending_memory_budget: BlendingMemoryBudget,
    pub settings: StreamingSettings,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            memory_budget: MemoryBudget::Medium,
            blending_memory_budget: BlendingMemoryBudget::Medium,
            settings: StreamingSettings::default(),
        }
    }
}

/// A baked data source wrapping the reader-side implementation.
pub struct StreamableAsset {
    source: Box<dyn CellDataSource>,
}

impl StreamableAsset {
    #[must_use]
    pub fn new(source: Box<dyn CellDataSource>) -> Self {
        Self { source }
    }
}

/// The backing assets of a baking set, one per data family.
pub struct BakingSetAssets {
    /// Per-scenario L0 and L1 chunk data, keyed by scenario name.
    pub cell_data: HashMap<String, StreamableAsset>,
    /// Per-scenario L2 and probe occlusion chunk data. Absent when the set
    /// carries neither.
    pub cell_optional_data: HashMap<String, StreamableAsset>,
    /// Validity and sky chunk data shared across scenarios.
    pub shared_data: StreamableAsset,
    /// Brick list records.
    pub bricks_data: StreamableAsset,
    /// Probe support records, editor and debug tooling only.
    pub support_data: Option<StreamableAsset>,
}

/// Everything the system needs to know about a baked set.
pub struct BakingSet {
    pub min_brick_size: f32,
    pub max_subdivision: u8,
    pub bands: ShBands,
    pub channels: ChannelSet,
    pub scenarios: Vec<String>,
    pub cells: Vec<CellDesc>,
    pub assets: BakingSetAssets,
}

/// Main-thread view of a registered asset: locations stay here while the
/// reader thread owns the file handle.
struct AssetRuntime {
    source: SourceId,
    locations: HashMap<u32, CellLocation>,
    element_size: u32,
}

impl AssetRuntime {
    fn cell_range(&self, cell_index: u32) -> Option<(u64, usize)> {
        self.locations.get(&cell_index).map(|loc| {
            (
                loc.offset,
                loc.element_count as usize * self.element_size as usize,
            )
        })
    }
}

struct SetAssets {
    cell_data: HashMap<String, AssetRuntime>,
    cell_optional_data: HashMap<String, AssetRuntime>,
    shared: AssetRuntime,
    bricks: AssetRuntime,
    support: Option<AssetRuntime>,
}

struct ActiveSet {
    hierarchy: ProbeHierarchy,
    bands: ShBands,
    channels: ChannelSet,
    scenarios: Vec<String>,
    assets: SetAssets,

    pool: BrickPool,
    blending_pools: Option<[BrickPool; 2]>,
    blending_texel_height: u32,
    index: BrickIndex,
    indirection: GlobalIndirection,
    scratch: ScratchBufferPool,

    cells: HashMap<u32, Cell>,
    requests: HashMap<RequestId, CellStreamingRequest>,
    next_request_id: RequestId,

    active_scenario: String,
    blending_scenario: Option<String>,
    blending_factor: f32,

    bounds: VolumeBounds,
}

/// GPU-facing buffers of the streaming system, refreshed for upload.
pub struct RuntimeResources<'a> {
    pub pool: &'a BrickPool,
    pub index_entries: &'a [u32],
    pub indirection: &'a [u32],
}

/// Owner of all probe streaming state. Explicitly constructed and passed
/// around by the host; there is exactly one per probe volume world.
pub struct ProbeStreamingSystem {
    config: StreamingConfig,
    reader: DiskReader,
    set: Option<ActiveSet>,
    frozen_camera: Option<(Vec3, Vec3)>,
}

impl ProbeStreamingSystem {
    #[must_use]
    pub fn new(config: StreamingConfig) -> Self {
        Self {
            config,
            reader: DiskReader::new(),
            set: None,
            frozen_camera: None,
        }
    }

    pub fn settings(&self) -> &StreamingSettings {
        &self.config.settings
    }

    pub fn settings_mut(&mut self) -> &mut StreamingSettings {
        &mut self.config.settings
    }

    /// Swap in a baked set. The previous set, if any, is fully unloaded
    /// and its sources dropped.
    pub fn activate_baking_set(&mut self, set: BakingSet) -> Result<()> {
        self.deactivate();

        let hierarchy = ProbeHierarchy::new(set.min_brick_size, set.max_subdivision)?;
        let Some(active_scenario) = set.scenarios.first().cloned() else {
            return Err(Error::InvalidConfiguration(
                "baking set has no lighting scenarios".to_string(),
            ));
        };

        for cell in &set.cells {
            let expected_chunks = div_round_up(cell.brick_count, CHUNK_SIZE_IN_BRICKS);
            if cell.sh_chunk_count != expected_chunks {
                return Err(Error::InvalidConfiguration(format!(
                    "cell {}: {} bricks need {} pool chunks, descriptor says {}",
                    cell.index, cell.brick_count, expected_chunks, cell.sh_chunk_count
                )));
            }
            if cell.brick_count > cell.index_chunk_count * INDEX_CHUNK_SIZE {
                return Err(Error::InvalidConfiguration(format!(
                    "cell {}: {} bricks exceed {} index chunks",
                    cell.index, cell.brick_count, cell.index_chunk_count
                )));
            }
        }

        let scenario_bytes = format::scenario_data_chunk_bytes();
        let optional_bytes = format::scenario_optional_chunk_bytes(set.bands, set.channels);
        let shared_bytes = format::shared_chunk_bytes(set.channels);

        let mut assets = set.assets;
        let mut cell_data = HashMap::new();
        for scenario in &set.scenarios {
            let Some(asset) = assets.cell_data.remove(scenario) else {
                return Err(Error::MissingAsset(format!(
                    "cell data for scenario {scenario}"
                )));
            };
            let runtime = self.register_asset(asset, &set.cells, |cell| {
                cell.sh_chunk_count as usize * scenario_bytes
            })?;
            cell_data.insert(scenario.clone(), runtime);
        }

        let mut cell_optional_data = HashMap::new();
        if optional_bytes > 0 {
            for scenario in &set.scenarios {
                let Some(asset) = assets.cell_optional_data.remove(scenario) else {
                    return Err(Error::MissingAsset(format!(
                        "optional cell data for scenario {scenario}"
                    )));
                };
                let runtime = self.register_asset(asset, &set.cells, |cell| {
                    cell.sh_chunk_count as usize * optional_bytes
                })?;
                cell_optional_data.insert(scenario.clone(), runtime);
            }
        }

        let shared = self.register_asset(assets.shared_data, &set.cells, |cell| {
            cell.sh_chunk_count as usize * shared_bytes
        })?;
        let bricks = self.register_asset(assets.bricks_data, &set.cells, |cell| {
            cell.brick_count as usize * format::BRICK_RECORD_SIZE
        })?;
        let support = match assets.support_data {
            Some(asset) => Some(self.register_asset(asset, &set.cells, |cell| {
                cell.probe_count as usize * format::SUPPORT_RECORD_SIZE
            })?),
            None => None,
        };

        let pool = BrickPool::new(
            self.config.memory_budget.texel_width(),
            set.bands,
            set.channels,
        );
        let index = BrickIndex::new(pool.chunk_capacity() as u32 * INDEX_CHUNKS_PER_POOL_CHUNK);
        let scratch = ScratchBufferPool::new(
            set.bands,
            set.channels,
            set.channels.probe_occlusion,
            self.config.settings.max_scratch_memory,
        );

        let cells = set
            .cells
            .into_iter()
            .map(|desc| (desc.index, Cell::new(desc)))
            .collect();

        tracing::info!(
            scenarios = set.scenarios.len(),
            pool_chunks = pool.chunk_capacity(),
            "baking set activated"
        );

        self.set = Some(ActiveSet {
            hierarchy,
            bands: set.bands,
            channels: set.channels,
            scenarios: set.scenarios,
            assets: SetAssets {
                cell_data,
                cell_optional_data,
                shared,
                bricks,
                support,
            },
            pool,
            blending_pools: None,
            blending_texel_height: self.config.blending_memory_budget.texel_width(),
            index,
            indirection: GlobalIndirection::new(set.max_subdivision),
            scratch,
            cells,
            requests: HashMap::new(),
            next_request_id: 0,
            active_scenario,
            blending_scenario: None,
            blending_factor: 0.0,
            bounds: VolumeBounds::empty(),
        });
        Ok(())
    }

    fn register_asset(
        &mut self,
        asset: StreamableAsset,
        cells: &[CellDesc],
        expected_bytes: impl Fn(&CellDesc) -> usize,
    ) -> Result<AssetRuntime> {
        if !asset.source.exists() {
            return Err(Error::MissingAsset("baked data source missing".to_string()));
        }
        let element_size = asset.source.element_size();

        let mut locations = HashMap::new();
        for cell in cells {
            let Some(location) = asset.source.cell_location(cell.index) else {
                return Err(Error::CorruptAsset(format!(
                    "cell {} has no data range",
                    cell.index
                )));
            };
            let bytes = location.element_count as usize * element_size as usize;
            let expected = expected_bytes(cell);
            if bytes != expected {
                return Err(Error::CorruptAsset(format!(
                    "cell {}: {bytes} bytes stored, {expected} expected",
                    cell.index
                )));
            }
            locations.insert(cell.index, location);
        }

        Ok(AssetRuntime {
            source: self.reader.register_source(asset.source),
            locations,
            element_size,
        })
    }

    /// Drop the active set and everything loaded from it.
    pub fn deactivate(&mut self) {
        let Some(mut set) = self.set.take() else {
            return;
        };
        let ids: Vec<RequestId> = set.requests.keys().copied().collect();
        for id in ids {
            cancel_request(&mut set, &mut self.reader, id);
        }
        for asset in set.assets.cell_data.values() {
            self.reader.unregister_source(asset.source);
        }
        for asset in set.assets.cell_optional_data.values() {
            self.reader.unregister_source(asset.source);
        }
        self.reader.unregister_source(set.assets.shared.source);
        self.reader.unregister_source(set.assets.bricks.source);
        if let Some(asset) = &set.assets.support {
            self.reader.unregister_source(asset.source);
        }
        self.frozen_camera = None;
    }

    fn set_mut(&mut self) -> Result<&mut ActiveSet> {
        self.set
            .as_mut()
            .ok_or_else(|| Error::InvalidConfiguration("no baking set active".to_string()))
    }

    /// Register a probe volume's interest in a cell. Referenced cells are
    /// scheduled for loading by `update`.
    pub fn reference_cell(&mut self, cell_index: u32) -> Result<()> {
        let set = self.set_mut()?;
        let Some(cell) = set.cells.get_mut(&cell_index) else {
            return Err(Error::OutOfBounds(format!(
                "cell {cell_index} not in the active baking set"
            )));
        };
        cell.reference_count += 1;

        let position = cell.desc.position;
        let mut bounds = set.bounds;
        bounds.expand(position);
        if bounds != set.bounds {
            set.bounds = bounds;
            rebuild_indirection(set);
        }
        Ok(())
    }

    /// Drop one reference to a cell. Unreferenced cells stay resident
    /// until evicted, but any in-flight load for them is canceled.
    pub fn unreference_cell(&mut self, cell_index: u32) -> Result<()> {
        // Field access, not set_mut: the reader is borrowed alongside.
        let Some(set) = self.set.as_mut() else {
            return Err(Error::InvalidConfiguration(
                "no baking set active".to_string(),
            ));
        };
        let Some(cell) = set.cells.get_mut(&cell_index) else {
            return Err(Error::OutOfBounds(format!(
                "cell {cell_index} not in the active baking set"
            )));
        };
        if cell.reference_count == 0 {
            tracing::warn!(cell = cell_index, "unreference of an unreferenced cell");
        }
        cell.reference_count = cell.reference_count.saturating_sub(1);

        if cell.reference_count == 0 {
            let ids: Vec<RequestId> = set
                .requests
                .iter()
                .filter(|(_, r)| r.cell_index == cell_index)
                .map(|(&id, _)| id)
                .collect();
            for id in ids {
                cancel_request(set, &mut self.reader, id);
            }
        }
        Ok(())
    }

    /// Unload a cell's GPU residency. Fails while the cell is referenced.
    pub fn unload_cell(&mut self, cell_index: u32) -> Result<()> {
        let Some(set) = self.set.as_mut() else {
            return Err(Error::InvalidConfiguration(
                "no baking set active".to_string(),
            ));
        };
        let Some(cell) = set.cells.get(&cell_index) else {
            return Err(Error::OutOfBounds(format!(
                "cell {cell_index} not in the active baking set"
            )));
        };
        if cell.reference_count > 0 {
            return Err(Error::InvalidConfiguration(format!(
                "cell {cell_index} is still referenced"
            )));
        }
        let ids: Vec<RequestId> = set
            .requests
            .iter()
            .filter(|(_, r)| r.cell_index == cell_index)
            .map(|(&id, _)| id)
            .collect();
        for id in ids {
            cancel_request(set, &mut self.reader, id);
        }
        unload_cell(set, cell_index);
        Ok(())
    }

    /// Switch the lit scenario. Loaded cells keep their chunks and get
    /// their scenario channels streamed again; blending residency of the
    /// old scenario pair is dropped wholesale.
    pub fn set_active_scenario(&mut self, scenario: &str) -> Result<()> {
        let Some(set) = self.set.as_mut() else {
            return Err(Error::InvalidConfiguration(
                "no baking set active".to_string(),
            ));
        };
        if !set.scenarios.iter().any(|s| s == scenario) {
            return Err(Error::MissingAsset(format!(
                "scenario {scenario} not in the active baking set"
            )));
        }
        if set.active_scenario == scenario && set.blending_scenario.is_none() {
            return Ok(());
        }
        set.active_scenario = scenario.to_string();
        set.blending_scenario = None;
        set.blending_factor = 0.0;

        let blending_requests: Vec<RequestId> = set
            .requests
            .iter()
            .filter(|(_, r)| matches!(r.target, PoolTarget::Blending(_)))
            .map(|(&id, _)| id)
            .collect();
        for id in blending_requests {
            cancel_request(set, &mut self.reader, id);
        }
        for cell in set.cells.values_mut() {
            if !cell.blending_info.chunks.is_empty() {
                if let Some(pools) = set.blending_pools.as_mut() {
                    pools[0].release(&cell.blending_info.chunks);
                }
                cell.blending_info.chunks.clear();
            }
            if cell.loaded {
                cell.streaming_score = Score::ForceReupload;
            }
            cell.blending_info.mark_up_to_date();
        }
        tracing::debug!(scenario, "active scenario changed");
        Ok(())
    }

    /// Blend the active scenario toward another one. `factor` is the mix
    /// weight of the target scenario, clamped to 0..=1.
    pub fn blend_scenario(&mut self, scenario: &str, factor: f32) -> Result<()> {
        let set = self.set_mut()?;
        if !set.scenarios.iter().any(|s| s == scenario) {
            return Err(Error::MissingAsset(format!(
                "scenario {scenario} not in the active baking set"
            )));
        }
        if scenario == set.active_scenario {
            set.blending_scenario = None;
            return Ok(());
        }

        let factor = factor.clamp(0.0, 1.0);
        let pair_changed = set.blending_scenario.as_deref() != Some(scenario);
        set.blending_scenario = Some(scenario.to_string());

        if pair_changed || (set.blending_factor - factor).abs() > f32::EPSILON {
            set.blending_factor = factor;
            for cell in set.cells.values_mut() {
                if !cell.loaded {
                    continue;
                }
                if pair_changed && cell.blending_info.is_resident() {
                    cell.blending_info.force_reupload();
                } else if cell.blending_info.is_up_to_date() {
                    // Re-scored next frame; any finite value re-enters the queue.
                    cell.blending_info.score = Score::Scheduled(0.0);
                }
            }
        }
        Ok(())
    }

    /// Per-frame streaming step.
    pub fn update(&mut self, camera_position: Vec3, camera_forward: Vec3) {
        self.reader.poll();
        if !self.config.settings.enabled {
            return;
        }
        let camera = if self.config.settings.freeze_streaming {
            *self
                .frozen_camera
                .get_or_insert((camera_position, camera_forward.normalize_or_zero()))
        } else {
            let camera = (camera_position, camera_forward.normalize_or_zero());
            self.frozen_camera = Some(camera);
            camera
        };
        let settings = self.config.settings.clone();
        let Some(set) = self.set.as_mut() else {
            return;
        };

        compute_scores(set, camera.0, camera.1);
        schedule_loads(set, &settings);
        activate_pending_requests(set, &mut self.reader);
        finalize_requests(set, &mut self.reader);
        update_blending(set, &mut self.reader, &settings);
        defragment_index(set);
    }

    /// Whether any cell's data made it to the pools.
    #[must_use]
    pub fn data_has_been_loaded(&self) -> bool {
        self.set
            .as_ref()
            .is_some_and(|set| set.cells.values().any(|c| c.loaded))
    }

    /// Current fragmentation of the brick index buffer.
    #[must_use]
    pub fn index_fragmentation_rate(&self) -> f32 {
        self.set
            .as_ref()
            .map_or(0.0, |set| set.index.fragmentation_rate())
    }

    /// Lowest and highest distance scores among referenced cells, for
    /// streaming debug views.
    #[must_use]
    pub fn streaming_score_bounds(&self) -> Option<(f32, f32)> {
        let set = self.set.as_ref()?;
        let mut bounds: Option<(f32, f32)> = None;
        for cell in set.cells.values() {
            if cell.reference_count == 0 {
                continue;
            }
            if let Score::Scheduled(score) = cell.streaming_score {
                if score == f32::MAX {
                    continue;
                }
                bounds = Some(match bounds {
                    Some((min, max)) => (min.min(score), max.max(score)),
                    None => (score, score),
                });
            }
        }
        bounds
    }

    /// GPU-facing buffers, with the indirection refreshed if dirty.
    pub fn runtime_resources(&mut self) -> Option<RuntimeResources<'_>> {
        let set = self.set.as_mut()?;
        let index_len = (set.index.chunk_capacity() * INDEX_CHUNK_SIZE) as usize;
        Some(RuntimeResources {
            pool: &set.pool,
            index_entries: set.index.entries(0, index_len),
            indirection: set.indirection.compute_data(),
        })
    }

    /// Runtime state of a cell, for tooling and tests.
    #[must_use]
    pub fn cell(&self, cell_index: u32) -> Option<&Cell> {
        self.set.as_ref()?.cells.get(&cell_index)
    }
}

impl Drop for ProbeStreamingSystem {
    fn drop(&mut self) {
        self.deactivate();
    }
}

/// Refresh distance scores. Sentinel scores and up-to-date blending marks
/// are left alone.
fn compute_scores(set: &mut ActiveSet, camera_position: Vec3, camera_forward: Vec3) {
    let cell_size = set.hierarchy.max_brick_size();
    for cell in set.cells.values_mut() {
        let score = streaming_score(cell.desc.center(cell_size), camera_position, camera_forward);
        if matches!(cell.streaming_score, Score::Scheduled(_)) {
            cell.streaming_score = Score::Scheduled(score);
        }
        if matches!(cell.blending_info.score, Score::Scheduled(_))
            && !cell.blending_info.is_up_to_date()
        {
            cell.blending_info.score = Score::Scheduled(score);
        }
    }
}

/// Pick the best load candidates this frame and start their requests,
/// evicting worse-scored resident cells when the pools run dry.
fn schedule_loads(set: &mut ActiveSet, settings: &StreamingSettings) {
    // Unbounded in load-max mode; the list then holds every candidate
    // in score order.
    let budget = (settings.cells_loaded_per_frame() as usize).min(set.cells.len());

    // Reduced insertion list instead of sorting the whole cell set.
    let mut best: Vec<(Score, u32)> = Vec::with_capacity(budget);
    for cell in set.cells.values() {
        let wants_load = cell.reference_count > 0
            && !cell.load_error
            && !cell.is_streaming()
            && (!cell.loaded || cell.streaming_score == Score::ForceReupload);
        if !wants_load {
            continue;
        }
        let key = (cell.streaming_score, cell.desc.index);
        let at = best.partition_point(|e| *e < key);
        if at < budget {
            best.insert(at, key);
            best.truncate(budget);
        }
    }

    for (score, cell_index) in best {
        if !try_start_load(set, cell_index, score) {
            break;
        }
    }
}

/// Allocate residency for a cell and queue its streaming request. Returns
/// false when the pools are exhausted even after eviction.
fn try_start_load(set: &mut ActiveSet, cell_index: u32, score: Score) -> bool {
    for attempt in 0..2 {
        if allocate_residency(set, cell_index) {
            let id = set.next_request_id;
            set.next_request_id += 1;
            let Some(cell) = set.cells.get_mut(&cell_index) else {
                return false;
            };
            let mut request =
                CellStreamingRequest::new(cell_index, set.active_scenario.clone(), PoolTarget::Main);
            request.full_load = !cell.index_info.index_updated;
            cell.streaming_request = Some(id);
            set.requests.insert(id, request);
            return true;
        }
        if attempt == 0 && !evict_one_worse_than(set, score) {
            return false;
        }
    }
    false
}

/// Reserve pool chunks and an index run for a cell. Reuploads keep their
/// existing residency.
fn allocate_residency(set: &mut ActiveSet, cell_index: u32) -> bool {
    let Some(cell) = set.cells.get_mut(&cell_index) else {
        return false;
    };
    if cell.loaded {
        return true;
    }
    let Some(first_index_chunk) = set.index.allocate(cell.desc.index_chunk_count) else {
        return false;
    };
    let chunks = set.pool.allocate(cell.desc.sh_chunk_count as usize);
    if chunks.len() < cell.desc.sh_chunk_count as usize {
        set.pool.release(&chunks);
        set.index
            .release(first_index_chunk, cell.desc.index_chunk_count);
        return false;
    }
    cell.pool_info.chunks = chunks;
    cell.index_info.first_index_chunk = first_index_chunk;
    cell.index_info.index_chunk_count = cell.desc.index_chunk_count;
    cell.index_info.index_updated = false;
    true
}

/// Evict the worst-scored resident cell if it scores worse than the given
/// candidate. Unreferenced cells go first.
fn evict_one_worse_than(set: &mut ActiveSet, candidate: Score) -> bool {
    let mut victim: Option<(bool, Score, u32)> = None;
    for cell in set.cells.values() {
        if !cell.loaded || cell.is_streaming() {
            continue;
        }
        if cell.streaming_score <= candidate {
            continue;
        }
        let key = (cell.reference_count == 0, cell.streaming_score, cell.desc.index);
        let better_victim = match victim {
            None => true,
            // Prefer unreferenced cells, then the worst score.
            Some((unreferenced, score, _)) => {
                (key.0 && !unreferenced) || (key.0 == unreferenced && key.1 > score)
            }
        };
        if better_victim {
            victim = Some(key);
        }
    }
    let Some((_, _, cell_index)) = victim else {
        return false;
    };
    tracing::debug!(cell = cell_index, "evicting cell for a closer one");
    unload_cell(set, cell_index);
    true
}

/// Tear down a cell's GPU residency. Indirection entries go first so the
/// table never points at released chunks.
fn unload_cell(set: &mut ActiveSet, cell_index: u32) {
    let Some(cell) = set.cells.get_mut(&cell_index) else {
        return;
    };
    set.indirection
        .mark_entries_unloaded(&cell.index_info.flat_indices);
    if cell.index_info.index_chunk_count > 0 {
        set.index.release(
            cell.index_info.first_index_chunk,
            cell.index_info.index_chunk_count,
        );
    }
    set.pool.release(&cell.pool_info.chunks);
    if let Some(pools) = set.blending_pools.as_mut() {
        pools[0].release(&cell.blending_info.chunks);
    }
    cell.clear_residency();
}

/// Cancel a request and invalidate whatever residency it reserved.
fn cancel_request(set: &mut ActiveSet, reader: &mut DiskReader, id: RequestId) {
    let Some(mut request) = set.requests.remove(&id) else {
        return;
    };
    for (_, read) in &request.reads {
        reader.cancel(*read);
    }
    if let Some(buffer) = request.take_scratch() {
        set.scratch.release(buffer);
    }
    request.set_state(RequestState::Canceled);

    let cell_index = request.cell_index;
    match request.target {
        PoolTarget::Main => {
            let Some(cell) = set.cells.get_mut(&cell_index) else {
                return;
            };
            cell.streaming_request = None;
            if !cell.loaded {
                // The canceled load may have partially staged chunks.
                set.indirection
                    .mark_entries_unloaded(&cell.index_info.flat_indices);
                if cell.index_info.index_chunk_count > 0 {
                    set.index.release(
                        cell.index_info.first_index_chunk,
                        cell.index_info.index_chunk_count,
                    );
                }
                set.pool.release(&cell.pool_info.chunks);
                cell.clear_residency();
            }
        }
        PoolTarget::Blending(slot) => {
            let Some(cell) = set.cells.get_mut(&cell_index) else {
                return;
            };
            cell.blending_requests[slot] = None;
            // Cancel the twin too; half a blend pair is useless.
            let twin = cell.blending_requests[1 - slot].take();
            if let Some(pools) = set.blending_pools.as_mut() {
                pools[0].release(&cell.blending_info.chunks);
            }
            cell.blending_info.chunks.clear();
            cell.blending_info.mark_up_to_date();
            if let Some(twin) = twin {
                cancel_request(set, reader, twin);
            }
        }
    }
    tracing::debug!(cell = cell_index, request = id, "streaming request canceled");
}

/// Give pending requests scratch memory and submit their reads.
fn activate_pending_requests(set: &mut ActiveSet, reader: &mut DiskReader) {
    let ids: Vec<RequestId> = set
        .requests
        .iter()
        .filter(|(_, r)| r.state() == RequestState::Pending)
        .map(|(&id, _)| id)
        .collect();

    for id in ids {
        let Some(request) = set.requests.get(&id) else {
            continue;
        };
        let cell_index = request.cell_index;
        let scenario = request.scenario.clone();
        let target = request.target;
        let full_load = request.full_load;
        let Some(cell) = set.cells.get(&cell_index) else {
            continue;
        };
        let chunk_count = cell.desc.sh_chunk_count;

        let layout = match target {
            PoolTarget::Main => set.scratch.layout(chunk_count),
            PoolTarget::Blending(_) => ScratchBufferLayout::new(
                chunk_count,
                set.bands,
                blending_channels(set.channels),
                set.channels.probe_occlusion,
            ),
        };
        let Some(mut buffer) = set.scratch.allocate(chunk_count) else {
            // Stays pending until scratch memory frees up.
            continue;
        };

        let mut reads = Vec::new();
        let mut submit = |asset: &AssetRuntime, kind: ReadKind| {
            if let Some((offset, size)) = asset.cell_range(cell_index) {
                if size > 0 {
                    let read = reader.submit(
                        asset.source,
                        vec![ReadCommand {
                            offset,
                            size,
                            dest_offset: 0,
                        }],
                        size,
                    );
                    reads.push((kind, read));
                }
            }
        };

        if let Some(asset) = set.assets.cell_data.get(&scenario) {
            submit(asset, ReadKind::ScenarioData);
        }
        if let Some(asset) = set.assets.cell_optional_data.get(&scenario) {
            submit(asset, ReadKind::ScenarioOptional);
        }
        if full_load && matches!(target, PoolTarget::Main) {
            submit(&set.assets.shared, ReadKind::Shared);
            submit(&set.assets.bricks, ReadKind::Bricks);
            if let Some(asset) = &set.assets.support {
                submit(asset, ReadKind::Support);
            }
        }

        let chunks = match target {
            PoolTarget::Main => &set.cells[&cell_index].pool_info.chunks,
            PoolTarget::Blending(_) => &set.cells[&cell_index].blending_info.chunks,
        };
        buffer.write_dest_chunks(&layout, chunks);

        let Some(request) = set.requests.get_mut(&id) else {
            continue;
        };
        request.reads = reads;
        request.layout = Some(layout);
        request.scratch = Some(buffer);
        request.set_state(RequestState::Active);
    }
}

/// Shared channels never enter the blending pools.
fn blending_channels(channels: ChannelSet) -> ChannelSet {
    ChannelSet {
        probe_occlusion: channels.probe_occlusion,
        ..ChannelSet::default()
    }
}

/// Retire active requests whose reads finished.
fn finalize_requests(set: &mut ActiveSet, reader: &mut DiskReader) {
    let ids: Vec<RequestId> = set
        .requests
        .iter()
        .filter(|(_, r)| r.state() == RequestState::Active)
        .map(|(&id, _)| id)
        .collect();

    for id in ids {
        let Some(request) = set.requests.get(&id) else {
            continue;
        };
        let mut all_complete = true;
        let mut any_failed = false;
        for (_, read) in &request.reads {
            match reader.status(*read) {
                ReadStatus::Complete => {}
                ReadStatus::InFlight => all_complete = false,
                ReadStatus::Failed => any_failed = true,
            }
        }
        if any_failed {
            fail_request(set, reader, id);
        } else if all_complete {
            complete_request(set, reader, id);
        }
    }
}

/// A read failed: the cell is marked permanently unloadable and all its
/// residency is rolled back.
fn fail_request(set: &mut ActiveSet, reader: &mut DiskReader, id: RequestId) {
    let Some(mut request) = set.requests.remove(&id) else {
        return;
    };
    for (_, read) in &request.reads {
        reader.cancel(*read);
    }
    if let Some(buffer) = request.take_scratch() {
        set.scratch.release(buffer);
    }
    request.set_state(RequestState::Invalid);

    let cell_index = request.cell_index;
    match request.target {
        PoolTarget::Main => {
            tracing::warn!(
                cell = cell_index,
                "cell data unreadable, cell marked unloadable"
            );
            if let Some(cell) = set.cells.get_mut(&cell_index) {
                cell.streaming_request = None;
                cell.blending_requests = [None, None];
                cell.load_error = true;
            }
            unload_cell(set, cell_index);
        }
        PoolTarget::Blending(slot) => {
            tracing::warn!(cell = cell_index, "blending data unreadable");
            let mut twin = None;
            let mut chunks = Vec::new();
            if let Some(cell) = set.cells.get_mut(&cell_index) {
                cell.blending_requests[slot] = None;
                twin = cell.blending_requests[1 - slot].take();
                chunks = std::mem::take(&mut cell.blending_info.chunks);
                cell.blending_info.mark_up_to_date();
            }
            if let Some(pools) = set.blending_pools.as_mut() {
                pools[0].release(&chunks);
            }
            if let Some(twin) = twin {
                cancel_request(set, reader, twin);
            }
        }
    }
}

/// All reads of a request finished: stage, upload and publish the cell.
///
/// The pool copy is always issued before the index write, and the index
/// write before the indirection entry, so a sampler never follows the
/// table into stale chunk data.
fn complete_request(set: &mut ActiveSet, reader: &mut DiskReader, id: RequestId) {
    let Some(mut request) = set.requests.remove(&id) else {
        return;
    };
    let (Some(layout), Some(mut scratch)) = (request.layout.take(), request.scratch.take()) else {
        return;
    };
    let cell_index = request.cell_index;

    let mut bricks = None;
    let mut support = None;
    let mut corrupt = false;
    for (kind, read) in &request.reads {
        let Some((buffer, _)) = reader.take_buffer(*read) else {
            corrupt = true;
            break;
        };
        match kind {
            ReadKind::ScenarioData => {
                let at = layout.sh_l0_l1rx_offset;
                scratch.staging_mut()[at..at + buffer.len()].copy_from_slice(&buffer);
            }
            ReadKind::ScenarioOptional => {
                let at = layout
                    .sh_l2_offsets
                    .map(|o| o[0])
                    .or(layout.probe_occlusion_offset);
                if let Some(at) = at {
                    scratch.staging_mut()[at..at + buffer.len()].copy_from_slice(&buffer);
                }
            }
            ReadKind::Shared => {
                let at = layout
                    .validity_offset
                    .or(layout.sky_occlusion_offset)
                    .or(layout.sky_shading_direction_offset);
                if let Some(at) = at {
                    scratch.staging_mut()[at..at + buffer.len()].copy_from_slice(&buffer);
                }
            }
            ReadKind::Bricks => match format::parse_bricks(&buffer) {
                Ok(parsed) => bricks = Some(parsed),
                Err(err) => {
                    tracing::warn!(cell = cell_index, %err, "brick data corrupt");
                    corrupt = true;
                }
            },
            ReadKind::Support => match format::parse_support(&buffer) {
                Ok(parsed) => support = Some(parsed),
                Err(err) => {
                    tracing::warn!(cell = cell_index, %err, "support data corrupt");
                    corrupt = true;
                }
            },
        }
        if corrupt {
            break;
        }
    }
    if corrupt {
        set.scratch.release(scratch);
        request.set_state(RequestState::Invalid);
        if let Some(cell) = set.cells.get_mut(&cell_index) {
            cell.streaming_request = None;
            cell.blending_requests = [None, None];
            cell.load_error = true;
        }
        unload_cell(set, cell_index);
        return;
    }

    scratch.upload();
    let mut payload = scratch.payload(&layout);
    if !request.full_load {
        // No shared read was submitted: the recycled staging buffer holds
        // stale bytes in those sections. Only scenario channels move.
        payload.validity = None;
        payload.sky_occlusion = None;
        payload.sky_shading_direction = None;
    }

    match request.target {
        PoolTarget::Main => {
            let Some(cell) = set.cells.get_mut(&cell_index) else {
                set.scratch.release(scratch);
                return;
            };
            set.pool.update(&cell.pool_info.chunks, &payload);

            if let Some(bricks) = bricks {
                let entries = compute_index_entries(&set.pool, &cell.pool_info.chunks, &bricks);
                set.index
                    .write_entries(cell.index_info.first_index_chunk, &entries);
                cell.data.bricks = bricks;
            }
            cell.index_info.index_updated = true;

            cell.data
                .scenarios
                .insert(request.scenario.clone(), parse_scenario_payload(&payload));
            if request.full_load {
                cell.data.validity_neigh_mask =
                    payload.validity.map(<[u8]>::to_vec).unwrap_or_default();
                cell.data.sky_occlusion_l0l1 = payload.sky_occlusion.map(bytes_to_u16);
                cell.data.sky_shading_direction_indices =
                    payload.sky_shading_direction.map(<[u8]>::to_vec);
                cell.data.support = support;
            }

            write_cell_indirection(&mut set.indirection, cell);
            cell.loaded = true;
            cell.streaming_request = None;
            cell.streaming_score = Score::Scheduled(f32::MAX);
            if set.blending_scenario.is_some() {
                // Catch up with the scenario mix before distance order.
                cell.blending_info.prioritize();
            }
            tracing::debug!(cell = cell_index, "cell loaded");
        }
        PoolTarget::Blending(slot) => {
            let Some(cell) = set.cells.get_mut(&cell_index) else {
                set.scratch.release(scratch);
                return;
            };
            if let Some(pools) = set.blending_pools.as_mut() {
                pools[slot].update(&cell.blending_info.chunks, &payload);
            }
            cell.blending_requests[slot] = None;
        }
    }

    set.scratch.release(scratch);
    request.set_state(RequestState::Complete);
}

/// Brick index entry: pool chunk flat index and the brick's slot in it.
fn compute_index_entries(
    pool: &BrickPool,
    chunks: &[Chunk],
    bricks: &[irradia_core::Brick],
) -> Vec<u32> {
    (0..bricks.len())
        .map(|i| {
            let chunk = chunks[i / CHUNK_SIZE_IN_BRICKS as usize];
            pool.chunk_flat_index(chunk) * CHUNK_SIZE_IN_BRICKS
                + (i as u32 % CHUNK_SIZE_IN_BRICKS)
        })
        .collect()
}

fn bytes_to_u16(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks_exact(2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .collect()
}

fn parse_scenario_payload(payload: &ChunkPayload<'_>) -> ScenarioPayload {
    ScenarioPayload {
        sh_l0_l1rx: bytes_to_u16(payload.sh_l0_l1rx),
        sh_l1g_l1ry: payload.sh_l1g_l1ry.to_vec(),
        sh_l1b_l1rz: payload.sh_l1b_l1rz.to_vec(),
        sh_l2: payload
            .sh_l2
            .map(|s| [s[0].to_vec(), s[1].to_vec(), s[2].to_vec(), s[3].to_vec()]),
        probe_occlusion: payload.probe_occlusion.map(<[u8]>::to_vec),
    }
}

/// Write a loaded cell's entries into the indirection table.
fn write_cell_indirection(indirection: &mut GlobalIndirection, cell: &mut Cell) {
    let mut flat_indices = Vec::with_capacity(cell.desc.indirection_entries.len());
    for (ordinal, desc) in cell.desc.indirection_entries.iter().enumerate() {
        let Some(flat) = indirection.entry_flat_index(cell.desc.position, desc) else {
            continue;
        };
        // Entries share the tail chunk when the cell has more entries
        // than index chunks.
        let chunk_offset =
            (ordinal as u32).min(cell.index_info.index_chunk_count.saturating_sub(1));
        let entry = IndirectionEntry::from_desc(
            desc,
            cell.index_info.first_index_chunk + chunk_offset,
        );
        indirection.set_entry(flat, entry.pack());
        flat_indices.push(flat);
    }
    cell.index_info.flat_indices = flat_indices;
}

/// Resize the indirection table to the referenced bounds and re-publish
/// every loaded cell.
fn rebuild_indirection(set: &mut ActiveSet) {
    let extent = set.bounds.extent().as_uvec3();
    set.indirection.set_cell_bounds(set.bounds.min(), extent);
    for cell in set.cells.values_mut() {
        if cell.loaded && cell.index_info.index_updated {
            write_cell_indirection(&mut set.indirection, cell);
        }
    }
}

/// Advance scenario blending: stream blending data for the best cells and
/// blend resident ones into the main pool.
fn update_blending(set: &mut ActiveSet, reader: &mut DiskReader, settings: &StreamingSettings) {
    let Some(target_scenario) = set.blending_scenario.clone() else {
        return;
    };
    let factor = set.blending_factor;
    let budget = settings.cells_blended_per_frame() as usize;

    let mut candidates: Vec<(Score, u32)> = set
        .cells
        .values()
        .filter(|c| {
            c.loaded && !c.blending_info.is_up_to_date() && c.streaming_request.is_none()
        })
        .map(|c| (c.blending_info.score, c.desc.index))
        .collect();
    candidates.sort_unstable();
    candidates.truncate(budget);
    if candidates.is_empty() {
        return;
    }

    if set.blending_pools.is_none() {
        // One chunk wide; the blending budget goes into the atlas height.
        let width = CHUNK_PROBE_COUNT_PER_DIM;
        let height = set.blending_texel_height;
        let channels = blending_channels(set.channels);
        let make = || BrickPool::with_dimensions(width, height, 4, set.bands, channels);
        set.blending_pools = Some([make(), make()]);
    }
    let mut turnover_left = blending_turnover_budget(set, settings);

    for (score, cell_index) in candidates {
        let cell = &set.cells[&cell_index];
        if cell.blending_requests.iter().any(Option::is_some) {
            continue;
        }
        let needs_upload = !cell.blending_info.is_resident() || cell.blending_info.needs_reupload();
        if needs_upload {
            if !ensure_blending_residency(set, cell_index, score, &mut turnover_left) {
                break;
            }
            start_blending_requests(set, cell_index, &target_scenario);
        } else {
            blend_cell(set, cell_index, factor);
        }
    }
}

fn blending_turnover_budget(set: &ActiveSet, settings: &StreamingSettings) -> usize {
    let capacity = set
        .blending_pools
        .as_ref()
        .map_or(0, |pools| pools[0].chunk_capacity());
    ((capacity as f32 * settings.turnover_rate()) as usize).max(1)
}

/// Allocate blending pool chunks for a cell, evicting worse blending
/// cells within the turnover budget.
fn ensure_blending_residency(
    set: &mut ActiveSet,
    cell_index: u32,
    score: Score,
    turnover_left: &mut usize,
) -> bool {
    let chunk_count = set.cells[&cell_index].desc.sh_chunk_count as usize;
    if set.cells[&cell_index].blending_info.is_resident() {
        return true;
    }
    loop {
        let Some(pools) = set.blending_pools.as_mut() else {
            return false;
        };
        let chunks = pools[0].allocate(chunk_count);
        if chunks.len() == chunk_count {
            let Some(cell) = set.cells.get_mut(&cell_index) else {
                pools[0].release(&chunks);
                return false;
            };
            cell.blending_info.chunks = chunks;
            return true;
        }
        pools[0].release(&chunks);

        if *turnover_left == 0 {
            return false;
        }
        // Recycle the worst blending-resident cell if it scores worse.
        let mut victim: Option<(Score, u32)> = None;
        for cell in set.cells.values() {
            if !cell.blending_info.is_resident()
                || cell.blending_requests.iter().any(Option::is_some)
                || cell.desc.index == cell_index
            {
                continue;
            }
            let key = (cell.blending_info.score, cell.desc.index);
            if key.0 > score && victim.as_ref().map_or(true, |v| key.0 > v.0) {
                victim = Some(key);
            }
        }
        let Some((_, victim_index)) = victim else {
            return false;
        };
        *turnover_left -= 1;
        let Some(victim_cell) = set.cells.get_mut(&victim_index) else {
            return false;
        };
        let chunks = std::mem::take(&mut victim_cell.blending_info.chunks);
        // Still needs blending once it gets chunks again.
        victim_cell.blending_info.force_reupload();
        if let Some(pools) = set.blending_pools.as_mut() {
            pools[0].release(&chunks);
        }
    }
}

/// Queue the two scenario uploads feeding a cell's blend.
fn start_blending_requests(set: &mut ActiveSet, cell_index: u32, target_scenario: &str) {
    for (slot, scenario) in [
        (0usize, set.active_scenario.clone()),
        (1usize, target_scenario.to_string()),
    ] {
        let id = set.next_request_id;
        set.next_request_id += 1;
        let request = CellStreamingRequest::new(cell_index, scenario, PoolTarget::Blending(slot));
        set.requests.insert(id, request);
        if let Some(cell) = set.cells.get_mut(&cell_index) {
            cell.blending_requests[slot] = Some(id);
            cell.blending_info.score = Score::Scheduled(0.0);
        }
    }
}

/// Lerp a cell's two resident scenario payloads into the main pool.
fn blend_cell(set: &mut ActiveSet, cell_index: u32, factor: f32) {
    let Some(pools) = set.blending_pools.as_ref() else {
        return;
    };
    let Some(cell) = set.cells.get(&cell_index) else {
        return;
    };
    let extent = Chunk::texel_extent();
    let chunks = &cell.blending_info.chunks;

    let blend_channel = |a: &irradia_pool::ChannelTexture,
                         b: &irradia_pool::ChannelTexture,
                         half_float: bool| {
        let mut out = Vec::new();
        for chunk in chunks {
            let origin = chunk.texel_offset();
            let src0 = a.read_region(origin, extent);
            let src1 = b.read_region(origin, extent);
            let mut blended = vec![0u8; src0.len()];
            if half_float {
                blend_rgba16f(&src0, &src1, factor, &mut blended);
            } else {
                blend_unorm8(&src0, &src1, factor, &mut blended);
            }
            out.extend_from_slice(&blended);
        }
        out
    };

    let l0 = blend_channel(pools[0].l0_l1rx(), pools[1].l0_l1rx(), true);
    let l1g = blend_channel(pools[0].l1g_l1ry(), pools[1].l1g_l1ry(), false);
    let l1b = blend_channel(pools[0].l1b_l1rz(), pools[1].l1b_l1rz(), false);
    let l2 = match (pools[0].l2(), pools[1].l2()) {
        (Some(a), Some(b)) => Some([
            blend_channel(&a[0], &b[0], false),
            blend_channel(&a[1], &b[1], false),
            blend_channel(&a[2], &b[2], false),
            blend_channel(&a[3], &b[3], false),
        ]),
        _ => None,
    };
    let occlusion = match (pools[0].probe_occlusion(), pools[1].probe_occlusion()) {
        (Some(a), Some(b)) => Some(blend_channel(a, b, false)),
        _ => None,
    };

    let payload = ChunkPayload {
        sh_l0_l1rx: &l0,
        sh_l1g_l1ry: &l1g,
        sh_l1b_l1rz: &l1b,
        sh_l2: l2
            .as_ref()
            .map(|l2| [l2[0].as_slice(), l2[1].as_slice(), l2[2].as_slice(), l2[3].as_slice()]),
        probe_occlusion: occlusion.as_deref(),
        ..ChunkPayload::default()
    };

    let Some(cell) = set.cells.get(&cell_index) else {
        return;
    };
    let main_chunks = cell.pool_info.chunks.clone();
    set.pool.update(&main_chunks, &payload);

    if let Some(cell) = set.cells.get_mut(&cell_index) {
        // Not mark_up_to_date: the reached factor must survive the mark.
        cell.blending_info.score = Score::UP_TO_DATE;
        cell.blending_info.blending_factor = factor;
    }
}

/// Compact the index buffer once fragmentation crosses the threshold.
///
/// Runs and entry values move but never change; the indirection table is
/// re-published afterwards so readers only ever see a consistent pair.
fn defragment_index(set: &mut ActiveSet) {
    if set.index.fragmentation_rate() < INDEX_FRAGMENTATION_THRESHOLD {
        return;
    }
    tracing::info!(
        rate = set.index.fragmentation_rate(),
        "defragmenting brick index"
    );

    let mut resident: Vec<u32> = set
        .cells
        .values()
        .filter(|c| c.index_info.index_chunk_count > 0)
        .map(|c| c.desc.index)
        .collect();
    resident.sort_unstable_by_key(|i| set.cells[i].index_info.first_index_chunk);

    let mut compacted = BrickIndex::new(set.index.chunk_capacity());
    for cell_index in resident {
        let Some(cell) = set.cells.get_mut(&cell_index) else {
            continue;
        };
        let count = cell.index_info.index_chunk_count;
        let Some(new_first) = compacted.allocate(count) else {
            // Cannot happen: the compacted buffer has the same capacity.
            tracing::warn!(cell = cell_index, "defragmentation ran out of chunks");
            return;
        };
        let entries = set
            .index
            .entries(
                cell.index_info.first_index_chunk,
                (count * INDEX_CHUNK_SIZE) as usize,
            )
            .to_vec();
        compacted.write_entries(new_first, &entries);
        cell.index_info.first_index_chunk = new_first;
        if cell.loaded && cell.index_info.index_updated {
            write_cell_indirection(&mut set.indirection, cell);
        }
    }
    set.index = compacted;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blend::f32_to_f16;
    use crate::format::BrickRecord;
    use crate::source::MemoryCellSource;
    use glam::IVec3;
    use irradia_core::IndirectionEntryDesc;
    use std::time::Duration;

    fn cell_desc(index: u32, position: IVec3, chunks: u32) -> CellDesc {
        let brick_count = chunks * CHUNK_SIZE_IN_BRICKS;
        CellDesc {
            position,
            index,
            probe_count: brick_count * 64,
            brick_count,
            min_subdiv: 0,
            index_chunk_count: div_round_up(brick_count, INDEX_CHUNK_SIZE),
            sh_chunk_count: chunks,
            indirection_entries: vec![IndirectionEntryDesc {
                position_in_bricks: IVec3::ZERO,
                min_subdiv: 0,
                min_brick_pos: IVec3::ZERO,
                max_brick_pos_plus_one: IVec3::splat(27),
                has_only_bigger_bricks: false,
            }],
        }
    }

    fn test_channels() -> ChannelSet {
        ChannelSet {
            validity: true,
            ..ChannelSet::default()
        }
    }

    fn scenario_source(cells: &[CellDesc], l0: u16, l1: u8) -> StreamableAsset {
        let mut bytes = Vec::new();
        let mut locations = HashMap::new();
        for cell in cells {
            let n = cell.sh_chunk_count as usize;
            locations.insert(
                cell.index,
                CellLocation {
                    offset: bytes.len() as u64,
                    element_count: cell.sh_chunk_count,
                },
            );
            for _ in 0..n * 8192 * 4 {
                bytes.extend_from_slice(&l0.to_le_bytes());
            }
            bytes.extend(std::iter::repeat(l1).take(n * 8192 * 8));
        }
        StreamableAsset::new(Box::new(MemoryCellSource::new(
            bytes,
            format::scenario_data_chunk_bytes() as u32,
            locations,
        )))
    }

    fn shared_source(cells: &[CellDesc]) -> StreamableAsset {
        let mut bytes = Vec::new();
        let mut locations = HashMap::new();
        for cell in cells {
            locations.insert(
                cell.index,
                CellLocation {
                    offset: bytes.len() as u64,
                    element_count: cell.sh_chunk_count,
                },
            );
            bytes.extend(std::iter::repeat(0xAAu8).take(cell.sh_chunk_count as usize * 8192));
        }
        StreamableAsset::new(Box::new(MemoryCellSource::new(
            bytes,
            format::shared_chunk_bytes(test_channels()) as u32,
            locations,
        )))
    }

    fn bricks_source(cells: &[CellDesc]) -> StreamableAsset {
        let mut records = Vec::new();
        let mut locations = HashMap::new();
        for cell in cells {
            locations.insert(
                cell.index,
                CellLocation {
                    offset: (records.len() * format::BRICK_RECORD_SIZE) as u64,
                    element_count: cell.brick_count,
                },
            );
            for i in 0..cell.brick_count {
                records.push(BrickRecord {
                    x: (i % 27) as i32,
                    y: ((i / 27) % 27) as i32,
                    z: 0,
                    subdivision_level: 0,
                });
            }
        }
        StreamableAsset::new(Box::new(MemoryCellSource::new(
            bytemuck::cast_slice(&records).to_vec(),
            format::BRICK_RECORD_SIZE as u32,
            locations,
        )))
    }

    fn build_set(cells: Vec<CellDesc>, scenarios: &[(&str, u16, u8)]) -> BakingSet {
        let mut cell_data = HashMap::new();
        for (name, l0, l1) in scenarios {
            cell_data.insert((*name).to_string(), scenario_source(&cells, *l0, *l1));
        }
        BakingSet {
            min_brick_size: 1.0,
            max_subdivision: 3,
            bands: ShBands::L1,
            channels: test_channels(),
            scenarios: scenarios.iter().map(|(n, _, _)| (*n).to_string()).collect(),
            cells: cells.clone(),
            assets: BakingSetAssets {
                cell_data,
                cell_optional_data: HashMap::new(),
                shared_data: shared_source(&cells),
                bricks_data: bricks_source(&cells),
                support_data: None,
            },
        }
    }

    fn low_budget_system() -> ProbeStreamingSystem {
        ProbeStreamingSystem::new(StreamingConfig {
            memory_budget: MemoryBudget::Low,
            blending_memory_budget: BlendingMemoryBudget::Low,
            settings: StreamingSettings::default(),
        })
    }

    fn pump_until(
        system: &mut ProbeStreamingSystem,
        camera: Vec3,
        mut done: impl FnMut(&ProbeStreamingSystem) -> bool,
    ) {
        for _ in 0..300 {
            system.update(camera, Vec3::Z);
            if done(system) {
                return;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        panic!("streaming did not settle");
    }

    #[test]
    fn activation_validates_chunk_counts() {
        let mut cells = vec![cell_desc(0, IVec3::ZERO, 1)];
        cells[0].sh_chunk_count = 2;
        let mut system = low_budget_system();
        let err = system
            .activate_baking_set(build_set(cells, &[("day", 1, 1)]))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration(_)));
    }

    #[test]
    fn activation_requires_scenario_assets() {
        let cells = vec![cell_desc(0, IVec3::ZERO, 1)];
        let mut set = build_set(cells, &[("day", 1, 1)]);
        set.scenarios.push("night".to_string());
        let mut system = low_budget_system();
        let err = system.activate_baking_set(set).unwrap_err();
        assert!(matches!(err, Error::MissingAsset(_)));
    }

    #[test]
    fn activation_rejects_wrong_payload_sizes() {
        let cells = vec![cell_desc(0, IVec3::ZERO, 1)];
        let mut set = build_set(cells.clone(), &[("day", 1, 1)]);
        // Shared data claims twice the bytes the cell needs.
        let mut locations = HashMap::new();
        locations.insert(0, CellLocation { offset: 0, element_count: 2 });
        set.assets.shared_data = StreamableAsset::new(Box::new(MemoryCellSource::new(
            vec![0; 2 * 8192],
            format::shared_chunk_bytes(test_channels()) as u32,
            locations,
        )));
        let mut system = low_budget_system();
        let err = system.activate_baking_set(set).unwrap_err();
        assert!(matches!(err, Error::CorruptAsset(_)));
    }

    #[test]
    fn referenced_cells_load() {
        let cells = vec![
            cell_desc(0, IVec3::ZERO, 1),
            cell_desc(1, IVec3::new(1, 0, 0), 1),
        ];
        let day = f32_to_f16(2.0);
        let mut system = low_budget_system();
        system
            .activate_baking_set(build_set(cells, &[("day", day, 100)]))
            .unwrap();
        system.reference_cell(0).unwrap();
        system.reference_cell(1).unwrap();
        assert!(!system.data_has_been_loaded());

        pump_until(&mut system, Vec3::ZERO, |s| {
            s.cell(0).unwrap().loaded && s.cell(1).unwrap().loaded
        });

        let cell = system.cell(0).unwrap();
        assert_eq!(cell.pool_info.chunks.len(), 1);
        assert!(cell.index_info.index_updated);
        assert_eq!(cell.data.bricks.len(), 128);
        assert_eq!(cell.data.validity_neigh_mask.len(), 8192);
        let chunk = cell.pool_info.chunks[0];
        let flat = cell.index_info.flat_indices[0];
        let first_index_chunk = cell.index_info.first_index_chunk;

        let resources = system.runtime_resources().unwrap();
        // Pool copy landed.
        let l0 = resources
            .pool
            .l0_l1rx()
            .read_region(chunk.texel_offset(), Chunk::texel_extent());
        assert!(l0.chunks_exact(2).all(|b| b == day.to_le_bytes()));
        let validity = resources
            .pool
            .validity()
            .unwrap()
            .read_region(chunk.texel_offset(), Chunk::texel_extent());
        assert!(validity.iter().all(|&b| b == 0xAA));

        // Index entries point into the pool chunk.
        let chunk_flat = resources.pool.chunk_flat_index(chunk);
        let start = (first_index_chunk * INDEX_CHUNK_SIZE) as usize;
        assert_eq!(resources.index_entries[start], chunk_flat * 128);
        assert_eq!(resources.index_entries[start + 127], chunk_flat * 128 + 127);

        // Indirection entry decodes back to the index run.
        let words = [
            resources.indirection[flat as usize * 3],
            resources.indirection[flat as usize * 3 + 1],
            resources.indirection[flat as usize * 3 + 2],
        ];
        let entry = IndirectionEntry::unpack(words);
        assert_eq!(entry.first_chunk_index, first_index_chunk);
        assert_eq!(entry.min_subdiv, 0);
        assert!(system.data_has_been_loaded());
    }

    #[test]
    fn unreferencing_midflight_cancels_and_rolls_back() {
        let cells = vec![cell_desc(0, IVec3::ZERO, 1)];
        let mut system = low_budget_system();
        system
            .activate_baking_set(build_set(cells, &[("day", 1, 1)]))
            .unwrap();
        system.reference_cell(0).unwrap();

        // One frame: the request is active, reads in flight, nothing
        // published yet.
        system.update(Vec3::ZERO, Vec3::Z);
        assert!(system.cell(0).unwrap().is_streaming());
        system.unreference_cell(0).unwrap();

        let cell = system.cell(0).unwrap();
        assert!(!cell.is_streaming());
        assert!(!cell.loaded);
        assert!(cell.pool_info.chunks.is_empty());

        // Late read completions are dropped, nothing loads.
        for _ in 0..20 {
            system.update(Vec3::ZERO, Vec3::Z);
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(!system.data_has_been_loaded());
    }

    #[test]
    fn unreference_floor_is_zero() {
        let cells = vec![cell_desc(0, IVec3::ZERO, 1)];
        let mut system = low_budget_system();
        system
            .activate_baking_set(build_set(cells, &[("day", 1, 1)]))
            .unwrap();
        system.unreference_cell(0).unwrap();
        system.unreference_cell(0).unwrap();
        assert_eq!(system.cell(0).unwrap().reference_count, 0);
        system.reference_cell(0).unwrap();
        assert_eq!(system.cell(0).unwrap().reference_count, 1);
    }

    #[test]
    fn eviction_frees_worse_cells_for_closer_ones() {
        // Three 43-chunk cells against a 128 chunk pool: only two fit.
        let cells = vec![
            cell_desc(0, IVec3::ZERO, 43),
            cell_desc(1, IVec3::new(1, 0, 0), 43),
            cell_desc(2, IVec3::new(5, 0, 0), 43),
        ];
        let mut system = low_budget_system();
        system.settings_mut().load_max_cells_per_frame = true;
        system
            .activate_baking_set(build_set(cells, &[("day", 1, 1)]))
            .unwrap();
        for i in 0..3 {
            system.reference_cell(i).unwrap();
        }

        // Camera near cells 0 and 1: they win the pool, 2 does not fit
        // and cannot evict better-scored cells.
        let near = Vec3::splat(13.5);
        pump_until(&mut system, near, |s| {
            s.cell(0).unwrap().loaded && s.cell(1).unwrap().loaded
        });
        for _ in 0..10 {
            system.update(near, Vec3::Z);
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(!system.cell(2).unwrap().loaded);

        // Camera jumps to cell 2: it now outranks a resident cell, which
        // gets evicted to make room.
        let far = Vec3::new(5.5 * 27.0, 13.5, 13.5);
        pump_until(&mut system, far, |s| s.cell(2).unwrap().loaded);
        let still_loaded = [0, 1]
            .iter()
            .filter(|&&i| system.cell(i).unwrap().loaded)
            .count();
        assert_eq!(still_loaded, 1);
    }

    #[test]
    fn scenario_switch_restreams_into_same_chunks() {
        let cells = vec![cell_desc(0, IVec3::ZERO, 1)];
        let day = f32_to_f16(2.0);
        let night = f32_to_f16(4.0);
        let mut system = low_budget_system();
        system
            .activate_baking_set(build_set(cells, &[("day", day, 100), ("night", night, 200)]))
            .unwrap();
        system.reference_cell(0).unwrap();
        pump_until(&mut system, Vec3::ZERO, |s| s.cell(0).unwrap().loaded);
        let chunks_before = system.cell(0).unwrap().pool_info.chunks.clone();

        system.set_active_scenario("night").unwrap();
        assert_eq!(system.cell(0).unwrap().streaming_score, Score::ForceReupload);
        pump_until(&mut system, Vec3::ZERO, |s| {
            let cell = s.cell(0).unwrap();
            cell.loaded && !cell.is_streaming() && cell.data.scenarios.contains_key("night")
        });

        let cell = system.cell(0).unwrap();
        assert_eq!(cell.pool_info.chunks, chunks_before);
        let chunk = cell.pool_info.chunks[0];
        let resources = system.runtime_resources().unwrap();
        let l0 = resources
            .pool
            .l0_l1rx()
            .read_region(chunk.texel_offset(), Chunk::texel_extent());
        assert!(l0.chunks_exact(2).all(|b| b == night.to_le_bytes()));
    }

    #[test]
    fn load_max_starts_every_pending_cell() {
        let cells = vec![
            cell_desc(0, IVec3::ZERO, 1),
            cell_desc(1, IVec3::new(1, 0, 0), 1),
            cell_desc(2, IVec3::new(2, 0, 0), 1),
        ];
        let mut system = low_budget_system();
        system.settings_mut().load_max_cells_per_frame = true;
        system
            .activate_baking_set(build_set(cells, &[("day", 1, 1)]))
            .unwrap();
        for i in 0..3 {
            system.reference_cell(i).unwrap();
        }

        // Default budget would start two; load-max mode starts them all.
        system.update(Vec3::ZERO, Vec3::Z);
        for i in 0..3 {
            assert!(system.cell(i).unwrap().is_streaming());
        }
    }

    #[test]
    fn scenario_reupload_preserves_shared_channels() {
        let cells = vec![
            cell_desc(0, IVec3::ZERO, 1),
            cell_desc(1, IVec3::new(1, 0, 0), 1),
        ];
        let night = f32_to_f16(4.0);
        let mut set = build_set(
            cells.clone(),
            &[("day", f32_to_f16(2.0), 100), ("night", night, 200)],
        );
        // Distinct validity per cell so a stale staging copy is visible.
        let mut bytes = Vec::new();
        let mut locations = HashMap::new();
        for cell in &cells {
            locations.insert(
                cell.index,
                CellLocation {
                    offset: bytes.len() as u64,
                    element_count: cell.sh_chunk_count,
                },
            );
            bytes.extend(
                std::iter::repeat(0xA0 | cell.index as u8)
                    .take(cell.sh_chunk_count as usize * 8192),
            );
        }
        set.assets.shared_data = StreamableAsset::new(Box::new(MemoryCellSource::new(
            bytes,
            format::shared_chunk_bytes(test_channels()) as u32,
            locations,
        )));

        let mut system = low_budget_system();
        // Sequential loads so the cells pass through the same recycled
        // scratch buffer.
        system.settings_mut().set_cells_loaded_per_frame(1);
        system.activate_baking_set(set).unwrap();
        system.reference_cell(0).unwrap();
        system.reference_cell(1).unwrap();
        pump_until(&mut system, Vec3::ZERO, |s| {
            s.cell(0).unwrap().loaded && s.cell(1).unwrap().loaded
        });

        system.set_active_scenario("night").unwrap();
        pump_until(&mut system, Vec3::ZERO, |s| {
            (0..2).all(|i| {
                let cell = s.cell(i).unwrap();
                cell.loaded && !cell.is_streaming() && cell.data.scenarios.contains_key("night")
            })
        });

        let chunk0 = system.cell(0).unwrap().pool_info.chunks[0];
        let chunk1 = system.cell(1).unwrap().pool_info.chunks[0];
        let resources = system.runtime_resources().unwrap();
        let validity = |chunk: Chunk| {
            resources
                .pool
                .validity()
                .unwrap()
                .read_region(chunk.texel_offset(), Chunk::texel_extent())
        };
        // Shared channels kept their original per-cell contents.
        assert!(validity(chunk0).iter().all(|&b| b == 0xA0));
        assert!(validity(chunk1).iter().all(|&b| b == 0xA1));
        // Scenario channels did restream.
        let l0 = resources
            .pool
            .l0_l1rx()
            .read_region(chunk0.texel_offset(), Chunk::texel_extent());
        assert!(l0.chunks_exact(2).all(|b| b == night.to_le_bytes()));
    }

    #[test]
    fn scenario_blending_lerps_into_main_pool() {
        let cells = vec![cell_desc(0, IVec3::ZERO, 1)];
        let day = f32_to_f16(2.0);
        let night = f32_to_f16(4.0);
        let mut system = low_budget_system();
        system
            .activate_baking_set(build_set(cells, &[("day", day, 100), ("night", night, 200)]))
            .unwrap();
        system.reference_cell(0).unwrap();
        pump_until(&mut system, Vec3::ZERO, |s| s.cell(0).unwrap().loaded);

        system.blend_scenario("night", 0.5).unwrap();
        pump_until(&mut system, Vec3::ZERO, |s| {
            s.cell(0).unwrap().blending_info.is_up_to_date()
                && s.cell(0).unwrap().blending_info.blending_factor == 0.5
        });

        let chunk = system.cell(0).unwrap().pool_info.chunks[0];
        let resources = system.runtime_resources().unwrap();
        let l0 = resources
            .pool
            .l0_l1rx()
            .read_region(chunk.texel_offset(), Chunk::texel_extent());
        let blended = f32_to_f16(3.0).to_le_bytes();
        assert!(l0.chunks_exact(2).all(|b| b == blended));
        let l1 = resources
            .pool
            .l1g_l1ry()
            .read_region(chunk.texel_offset(), Chunk::texel_extent());
        assert!(l1.iter().all(|&b| b == 150));
    }

    #[test]
    fn index_defragments_past_threshold() {
        let cells = vec![
            cell_desc(0, IVec3::ZERO, 1),
            cell_desc(1, IVec3::new(0, 0, 1), 1),
            cell_desc(2, IVec3::new(0, 0, 2), 1),
        ];
        let mut system = low_budget_system();
        system
            .activate_baking_set(build_set(cells, &[("day", 1, 1)]))
            .unwrap();
        for i in 0..3 {
            system.reference_cell(i).unwrap();
        }
        pump_until(&mut system, Vec3::ZERO, |s| {
            (0..3).all(|i| s.cell(i).unwrap().loaded)
        });

        // Unload the middle run to open a hole below the high-water mark.
        let middle = (0..3)
            .find(|&i| system.cell(i).unwrap().index_info.first_index_chunk == 1)
            .unwrap();
        system.unreference_cell(middle).unwrap();
        system.unload_cell(middle).unwrap();
        assert!(system.index_fragmentation_rate() > INDEX_FRAGMENTATION_THRESHOLD);

        system.update(Vec3::ZERO, Vec3::Z);
        assert_eq!(system.index_fragmentation_rate(), 0.0);

        // Survivors were compacted and republished.
        let survivors: Vec<u32> = (0..3).filter(|&i| i != middle).collect();
        let mut firsts: Vec<u32> = survivors
            .iter()
            .map(|&i| system.cell(i).unwrap().index_info.first_index_chunk)
            .collect();
        firsts.sort_unstable();
        assert_eq!(firsts, vec![0, 1]);

        for &i in &survivors {
            let cell = system.cell(i).unwrap();
            let flat = cell.index_info.flat_indices[0];
            let first = cell.index_info.first_index_chunk;
            let chunk_flat = {
                let resources = system.runtime_resources().unwrap();
                let words = [
                    resources.indirection[flat as usize * 3],
                    resources.indirection[flat as usize * 3 + 1],
                    resources.indirection[flat as usize * 3 + 2],
                ];
                IndirectionEntry::unpack(words).first_chunk_index
            };
            assert_eq!(chunk_flat, first);
        }
    }

    #[test]
    fn unreadable_cells_are_marked_unloadable() {
        let cells = vec![cell_desc(0, IVec3::ZERO, 1)];
        let mut set = build_set(cells.clone(), &[("day", 1, 1)]);
        // Bricks range points past the end of the blob; sizes pass
        // validation, the read itself fails.
        let mut locations = HashMap::new();
        locations.insert(
            0,
            CellLocation {
                offset: 1 << 30,
                element_count: cells[0].brick_count,
            },
        );
        set.assets.bricks_data = StreamableAsset::new(Box::new(MemoryCellSource::new(
            vec![0; 64],
            format::BRICK_RECORD_SIZE as u32,
            locations,
        )));
        let mut system = low_budget_system();
        system.activate_baking_set(set).unwrap();
        system.reference_cell(0).unwrap();

        pump_until(&mut system, Vec3::ZERO, |s| s.cell(0).unwrap().load_error);
        let cell = system.cell(0).unwrap();
        assert!(!cell.loaded);
        assert!(cell.pool_info.chunks.is_empty());

        // Never retried.
        for _ in 0..10 {
            system.update(Vec3::ZERO, Vec3::Z);
        }
        assert!(!system.cell(0).unwrap().is_streaming());
    }
}
