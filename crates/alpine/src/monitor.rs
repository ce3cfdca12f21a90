//! State Monitor (Section 4.5): watches the state file and publishes
//! `state_snapshot` events on change.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::Utc;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

use alpine_core::events::{Event, EventPayload, StateSnapshotPayload};
use alpine_core::state_store;
use alpine_core::types::{RunId, TaskState};

const POLL_INTERVAL: Duration = Duration::from_millis(300);

/// Runs until `ctx` is cancelled, polling `state_path`'s mtime and
/// publishing a deduplicated `state_snapshot` event on every observed
/// change. Corrupt or transiently missing states are tolerated: the
/// writer may be mid-rename.
pub async fn run(
    ctx: CancellationToken,
    run_id: RunId,
    state_path: PathBuf,
    mut seq: impl FnMut() -> u64 + Send,
    publish: impl Fn(Event) + Send,
) {
    let mut last_mtime: Option<SystemTime> = None;
    let mut last_state: Option<TaskState> = None;

    loop {
        if ctx.is_cancelled() {
            return;
        }

        if let Some(mtime) = mtime(&state_path) {
            let changed = last_mtime != Some(mtime);
            if changed {
                last_mtime = Some(mtime);
                if let Ok(state) = state_store::load(&state_path) {
                    let is_dup = last_state.as_ref().is_some_and(|prev| prev.equal(&state));
                    if !is_dup {
                        last_state = Some(state.clone());
                        publish(Event {
                            run_id,
                            seq: seq(),
                            timestamp: Utc::now(),
                            payload: EventPayload::StateSnapshot(StateSnapshotPayload { state }),
                        });
                    }
                }
                // Corrupt/missing during polling: retry on next tick.
            }
        }

        tokio::select! {
            () = sleep(POLL_INTERVAL) => {}
            () = ctx.cancelled() => return,
        }
    }
}

fn mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).ok()?.modified().ok()
}
