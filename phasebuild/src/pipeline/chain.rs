//! Folding consecutive stages into one build.

use std::sync::Arc;

use super::registry::PipelineEntry;
use crate::core::PhaseMask;
use crate::stages::StageHandle;

/// Binds the stages after `start` that `stage` can absorb.
///
/// Walks forward while entries stay inside `mask`, skipping disabled ones,
/// and stops at the first stage `stage` cannot chain with. Each absorbed
/// stage mirrors `stage`'s completed flag until the bindings are cleared.
/// Returns the index of the last absorbed entry.
pub(crate) fn try_chain(
    entries: &[PipelineEntry],
    stage: &Arc<StageHandle>,
    start: usize,
    mask: PhaseMask,
) -> Option<usize> {
    let mut last = None;

    for (index, entry) in entries.iter().enumerate().skip(start) {
        if !mask.contains(entry.spec.phase) {
            break;
        }
        if entry.handle.disabled() {
            continue;
        }
        if !stage.stage().can_chain(&entry.handle) {
            break;
        }

        stage.bind_completed(&entry.handle);
        last = Some(index);
    }

    last
}
