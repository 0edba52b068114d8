//! Rebuild and startup recovery.
//!
//! One algorithm core: resolve a base snapshot, then replay the longest
//! contiguous, integrity-valid diff chain atop it. A chain break is a
//! normal stopping condition, not an error; the engine always hands back
//! the best provably-good state it can reconstruct.

use crate::apply::apply_operations;
use crate::diffs::DiffLog;
use crate::error::Result;
use crate::snapshots::SnapshotStore;
use crate::types::{SnapshotId, WorldDiff, WorldState};
use tracing::{info, warn};

/// Replay diffs atop a base state until the chain breaks or the source is
/// exhausted.
///
/// Stops cleanly at the first diff whose declared base does not match the
/// running version (a gap), at the first diff the source fails to produce
/// (invalid envelope), or at the first diff that fails to apply. All three
/// are recovery boundaries: the state reached so far is returned.
pub fn replay<I>(base: WorldState, diffs: I) -> WorldState
where
    I: IntoIterator<Item = Result<WorldDiff>>,
{
    let mut state = base;

    for next in diffs {
        let diff = match next {
            Ok(diff) => diff,
            Err(e) => {
                warn!(at = %state.world_version, error = %e, "replay stopped at invalid diff");
                break;
            }
        };

        if diff.base_world_version != state.world_version {
            warn!(
                at = %state.world_version,
                diff_base = %diff.base_world_version,
                "replay stopped at chain break"
            );
            break;
        }

        state = match apply_operations(&state, &diff.operations) {
            Ok(next_state) => next_state,
            Err(e) => {
                warn!(at = %state.world_version, error = %e, "replay stopped at unapplicable diff");
                break;
            }
        };
        // The diff's declared tick wins; ticks may be driven externally.
        state.tick = diff.tick;
    }

    state
}

/// Reconstruct world state from a snapshot plus the diff chain above it.
///
/// With an explicit id, load failures surface to the caller. With `None`,
/// the newest snapshot that passes validation anchors the rebuild; when
/// every snapshot is invalid or none exist, the engine degrades to the
/// empty bootstrap state rather than failing.
pub fn rebuild(
    snapshots: &SnapshotStore,
    diffs: &DiffLog,
    snapshot: Option<&SnapshotId>,
) -> Result<WorldState> {
    let base = match snapshot {
        Some(id) => snapshots.load_snapshot(id)?,
        None => match snapshots.load_latest_valid()? {
            Some((id, state)) => {
                info!(snapshot = %id, version = %state.world_version, "rebuild anchored on snapshot");
                state
            }
            None => {
                warn!("no valid snapshot found; degrading to empty bootstrap state");
                WorldState::bootstrap()
            }
        },
    };

    let stream = diffs.stream_from(base.world_version)?;
    let state = replay(base, stream);
    info!(version = %state.world_version, tick = state.tick, "rebuild complete");
    Ok(state)
}

/// Recover the authoritative state at process start.
///
/// Identical semantics to `rebuild(latest)`.
pub fn recover_startup_state(snapshots: &SnapshotStore, diffs: &DiffLog) -> Result<WorldState> {
    rebuild(snapshots, diffs, None)
}
