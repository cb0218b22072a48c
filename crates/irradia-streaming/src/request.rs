//! In-flight streaming requests.

use crate::scratch::{ScratchBuffer, ScratchBufferLayout};
use crate::source::ReadId;

/// Identifier of a request held by the streaming system.
pub type RequestId = u64;

/// Which baked asset a read belongs to, deciding where its bytes land.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadKind {
    /// Per-scenario L0 and L1 chunk data.
    ScenarioData,
    /// Per-scenario L2 and probe occlusion chunk data.
    ScenarioOptional,
    /// Validity and sky chunk data shared across scenarios.
    Shared,
    /// Brick list records.
    Bricks,
    /// Probe support records.
    Support,
}

/// Where a request's data lands once the reads complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolTarget {
    /// The main brick pool, plus index and indirection updates.
    Main,
    /// One of the two scenario blending pools.
    Blending(usize),
}

/// Lifecycle of a streaming request.
///
/// `Pending` requests hold no scratch memory yet. `Active` requests own a
/// scratch buffer and have reads in flight. The three terminal states are
/// never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Pending,
    Active,
    Complete,
    Canceled,
    Invalid,
}

impl RequestState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Canceled | Self::Invalid)
    }
}

/// One cell load in flight, covering every backing file the cell needs.
#[derive(Debug)]
pub struct CellStreamingRequest {
    pub cell_index: u32,
    pub scenario: String,
    pub target: PoolTarget,
    state: RequestState,
    /// First load of the cell, reading bricks and shared channels too.
    /// Scenario reuploads only refresh the scenario channels.
    pub full_load: bool,
    /// Owned while active; handed back to the scratch pool on completion
    /// or cancelation.
    pub scratch: Option<ScratchBuffer>,
    pub layout: Option<ScratchBufferLayout>,
    /// Reads backing this request, all of which must complete.
    pub reads: Vec<(ReadKind, ReadId)>,
}

impl CellStreamingRequest {
    #[must_use]
    pub fn new(cell_index: u32, scenario: String, target: PoolTarget) -> Self {
        Self {
            cell_index,
            scenario,
            target,
            state: RequestState::Pending,
            full_load: false,
            scratch: None,
            layout: None,
            reads: Vec::new(),
        }
    }

    #[must_use]
    pub fn state(&self) -> RequestState {
        self.state
    }

    /// Advance the request lifecycle. Terminal states stick; a late
    /// completion racing a cancelation is ignored.
    pub fn set_state(&mut self, next: RequestState) {
        if !self.state.is_terminal() {
            self.state = next;
        }
    }

    /// Take the scratch buffer back for recycling.
    pub fn take_scratch(&mut self) -> Option<ScratchBuffer> {
        self.layout = None;
        self.scratch.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_to_active_to_complete() {
        let mut request = CellStreamingRequest::new(3, "day".to_string(), PoolTarget::Main);
        assert_eq!(request.state(), RequestState::Pending);
        request.set_state(RequestState::Active);
        request.set_state(RequestState::Complete);
        assert!(request.state().is_terminal());
    }

    #[test]
    fn terminal_states_stick() {
        let mut request = CellStreamingRequest::new(0, "day".to_string(), PoolTarget::Blending(1));
        request.set_state(RequestState::Canceled);
        request.set_state(RequestState::Complete);
        assert_eq!(request.state(), RequestState::Canceled);
    }
}
