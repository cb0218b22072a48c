//! Streaming behaviour knobs.

use serde::{Deserialize, Serialize};

/// Upper clamp for `set_cells_loaded_per_frame`.
pub const MAX_CELLS_LOADED_PER_FRAME: u32 = 10;

/// Runtime configuration of the streaming system.
///
/// Values are clamped on the way in, setters and deserialization both,
/// so a config file cannot push the system outside its tested envelope.
#[derive(Debug, Clone, Serialize)]
pub struct StreamingSettings {
    /// Master switch. When off, resident data stays put and no requests
    /// are issued.
    pub enabled: bool,
    /// Ignore camera movement and keep scoring against the last pose.
    pub freeze_streaming: bool,
    /// Load every pending cell each frame instead of
    /// `cells_loaded_per_frame` of them.
    pub load_max_cells_per_frame: bool,
    cells_loaded_per_frame: u32,
    cells_blended_per_frame: u32,
    turnover_rate: f32,
    /// Cap on live scratch staging memory in bytes.
    pub max_scratch_memory: usize,
}

impl Default for StreamingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            freeze_streaming: false,
            load_max_cells_per_frame: false,
            cells_loaded_per_frame: 2,
            cells_blended_per_frame: 10_000,
            turnover_rate: 0.1,
            max_scratch_memory: 32 << 20,
        }
    }
}

impl StreamingSettings {
    /// Cells allowed to start loading this frame.
    #[must_use]
    pub fn cells_loaded_per_frame(&self) -> u32 {
        if self.load_max_cells_per_frame {
            u32::MAX
        } else {
            self.cells_loaded_per_frame
        }
    }

    pub fn set_cells_loaded_per_frame(&mut self, value: u32) {
        self.cells_loaded_per_frame = value.clamp(1, MAX_CELLS_LOADED_PER_FRAME);
    }

    /// Cells advanced one blend step per frame.
    #[must_use]
    pub fn cells_blended_per_frame(&self) -> u32 {
        self.cells_blended_per_frame
    }

    pub fn set_cells_blended_per_frame(&mut self, value: u32) {
        self.cells_blended_per_frame = value.max(1);
    }

    /// Fraction of the blending pool recycled per frame toward closer
    /// cells once the pool is full.
    #[must_use]
    pub fn turnover_rate(&self) -> f32 {
        self.turnover_rate
    }

    pub fn set_turnover_rate(&mut self, value: f32) {
        self.turnover_rate = value.clamp(0.0, 1.0);
    }
}

// Hand-written so the private fields go through the clamping setters
// instead of landing in the struct raw.
impl<'de> Deserialize<'de> for StreamingSettings {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(default)]
        struct Raw {
            enabled: bool,
            freeze_streaming: bool,
            load_max_cells_per_frame: bool,
            cells_loaded_per_frame: u32,
            cells_blended_per_frame: u32,
            turnover_rate: f32,
            max_scratch_memory: usize,
        }

        impl Default for Raw {
            fn default() -> Self {
                let d = StreamingSettings::default();
                Self {
                    enabled: d.enabled,
                    freeze_streaming: d.freeze_streaming,
                    load_max_cells_per_frame: d.load_max_cells_per_frame,
                    cells_loaded_per_frame: d.cells_loaded_per_frame,
                    cells_blended_per_frame: d.cells_blended_per_frame,
                    turnover_rate: d.turnover_rate,
                    max_scratch_memory: d.max_scratch_memory,
                }
            }
        }

        let raw = Raw::deserialize(deserializer)?;
        let mut settings = Self {
            enabled: raw.enabled,
            freeze_streaming: raw.freeze_streaming,
            load_max_cells_per_frame: raw.load_max_cells_per_frame,
            max_scratch_memory: raw.max_scratch_memory,
            ..Self::default()
        };
        settings.set_cells_loaded_per_frame(raw.cells_loaded_per_frame);
        settings.set_cells_blended_per_frame(raw.cells_blended_per_frame);
        settings.set_turnover_rate(raw.turnover_rate);
        Ok(settings)
    }
}
