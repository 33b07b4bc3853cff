//! Ordered storage of attached stages.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::core::{PhaseMask, PhaseSpec};
use crate::stages::StageHandle;

/// Identifier handed out when a stage is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageId(u32);

impl StageId {
    /// Wraps a raw id.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// The raw id.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One attached stage.
#[derive(Debug, Clone)]
pub struct PipelineEntry {
    /// Registry id.
    pub id: StageId,
    /// Phase and modifier.
    pub spec: PhaseSpec,
    /// Order within the phase and modifier.
    pub priority: i32,
    /// The stage.
    pub handle: Arc<StageHandle>,
}

/// Stages sorted by phase, then modifier, then priority.
///
/// Entries comparing equal keep their attach order.
#[derive(Debug, Default)]
pub(crate) struct StageRegistry {
    entries: Vec<PipelineEntry>,
    seqnum: u32,
}

impl StageRegistry {
    pub(crate) fn next_id(&mut self) -> StageId {
        self.seqnum += 1;
        StageId(self.seqnum)
    }

    /// Inserts `entry` and returns its index.
    pub(crate) fn insert(&mut self, entry: PipelineEntry) -> usize {
        let id = entry.id;
        self.entries.push(entry);
        self.entries
            .sort_by_key(|e| (e.spec.sort_key(), e.priority));
        self.position_of(id).unwrap_or(self.entries.len() - 1)
    }

    /// Removes the entry with `id`, returning it and its former index.
    pub(crate) fn remove(&mut self, id: StageId) -> Option<(usize, PipelineEntry)> {
        let position = self.position_of(id)?;
        Some((position, self.entries.remove(position)))
    }

    pub(crate) fn position_of(&self, id: StageId) -> Option<usize> {
        self.entries.iter().position(|e| e.id == id)
    }

    pub(crate) fn get(&self, index: usize) -> Option<&PipelineEntry> {
        self.entries.get(index)
    }

    pub(crate) fn entries(&self) -> &[PipelineEntry] {
        &self.entries
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Marks every stage whose phase is in `mask` incomplete.
    pub(crate) fn invalidate(&self, mask: PhaseMask) {
        for entry in &self.entries {
            if mask.contains(entry.spec.phase) {
                entry.handle.set_completed(false);
            }
        }
    }
}
