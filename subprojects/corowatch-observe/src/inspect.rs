//! Whole-process snapshot aggregation.

use corowatch_registry::{PromiseSnapshot, process_directory};

/// Captures a snapshot of every promise in every live registry.
///
/// Each registry is walked under its own iteration lock, so the result
/// is per-registry consistent and per-field plausible, which is what a
/// diagnostic endpoint or serializer needs. Records that are marked but
/// not yet collected show up with a `Deleted` state.
pub fn snapshot_all() -> Vec<PromiseSnapshot> {
    let mut out = Vec::new();
    process_directory().for_each(|registry| {
        registry.for_promise(|record| out.push(record.snapshot()));
    });
    out
}
