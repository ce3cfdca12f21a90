//! Workflow Engine (Section 4.6): the iteration loop that ties the State
//! Store, Worktree Manager, Assistant Executor, and State Monitor together
//! for one task.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use alpine_core::config::Config;
use alpine_core::events::{
    Event, EventPayload, IterationFinishedPayload, IterationStartedPayload, RunErrorPayload,
    RunFinishedPayload, RunStartedPayload, ToolCallStartPayload,
};
use alpine_core::state_store::{self, StateStoreError};
use alpine_core::types::{RunId, TaskState, TaskStatus};
use alpine_core::RunError;

use crate::event_bus::EventBus;
use crate::executor::{self, ExecutorConfig, ExecutorError};
use crate::monitor;
use crate::worktree::{self, WorktreeError};

/// Opaque bootstrap prompt prefixes. Treated as meaningless strings by the
/// engine; the assistant interprets them.
const PLANNING_PREFIX: &str = "Draft an implementation plan, then begin executing it, for:";
const EXECUTION_PREFIX: &str = "Implement the following, end to end:";

/// Per-iteration budget for `wait_for_state_change` (Section 4.6).
const ITERATION_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const STATE_POLL_INTERVAL: Duration = Duration::from_millis(300);

const STATE_FILE_RELATIVE_PATH: &str = "agent_state/agent_state.json";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("task must be non-empty unless --continue is set")]
    EmptyTask,
    #[error("no existing state file to resume (--continue with nothing to continue)")]
    NoStateToResume,
    #[error("state file corrupt: {0}")]
    Corrupt(String),
    #[error("timed out waiting for the next state update")]
    StateUpdateTimeout,
    #[error("worktree error: {0}")]
    Worktree(#[from] WorktreeError),
    #[error("assistant error: {0}")]
    Executor(#[from] ExecutorError),
    #[error("cancelled")]
    Cancelled,
}

impl From<EngineError> for RunError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::EmptyTask => RunError::Validation(err.to_string()),
            EngineError::NoStateToResume => RunError::NotFound(err.to_string()),
            EngineError::Corrupt(msg) => RunError::Corrupt(msg),
            EngineError::StateUpdateTimeout => RunError::Timeout(err.to_string()),
            EngineError::Worktree(e) => RunError::Infrastructure(e.to_string()),
            EngineError::Executor(ExecutorError::Timeout(d)) => {
                RunError::Timeout(format!("assistant exceeded {d:?}"))
            }
            EngineError::Executor(ExecutorError::ExitCode(code)) => RunError::Subprocess { code },
            EngineError::Executor(ExecutorError::NotFound(bin)) => {
                RunError::NotFound(format!("assistant binary not found: {bin}"))
            }
            EngineError::Executor(ExecutorError::Cancelled) => RunError::Cancelled,
            EngineError::Executor(e) => RunError::Infrastructure(e.to_string()),
            EngineError::Cancelled => RunError::Cancelled,
        }
    }
}

/// Flags that tune one run, layered over the process-wide `Config`.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub generate_plan: bool,
    pub no_worktree: bool,
    pub continue_mode: bool,
}

pub struct Engine<'a> {
    pub config: &'a Config,
    pub bus: EventBus,
    pub run_id: RunId,
}

impl<'a> Engine<'a> {
    pub fn new(config: &'a Config, bus: EventBus, run_id: RunId) -> Self {
        Self { config, bus, run_id }
    }

    fn publish(&self, seq: &AtomicU64, payload: EventPayload) {
        let seq = seq.fetch_add(1, Ordering::Relaxed);
        self.bus.publish(Event {
            run_id: self.run_id,
            seq,
            timestamp: Utc::now(),
            payload,
        });
    }

    /// Run one task to completion (or failure/cancellation).
    ///
    /// `parent_repo` is the repository the worktree (if any) is created
    /// from; it is also the working directory used when worktrees are
    /// disabled.
    pub async fn run(
        &self,
        ctx: CancellationToken,
        parent_repo: &std::path::Path,
        task: &str,
        options: RunOptions,
    ) -> Result<(), EngineError> {
        let seq = AtomicU64::new(0);

        if task.is_empty() && !options.continue_mode {
            return Err(EngineError::EmptyTask);
        }
        if !task.is_empty() && options.continue_mode {
            return Err(EngineError::EmptyTask);
        }

        self.publish(
            &seq,
            EventPayload::RunStarted(RunStartedPayload {
                task: task.to_string(),
            }),
        );

        let result = self
            .run_inner(&ctx, parent_repo, task, &options, &seq)
            .await;

        match &result {
            Ok(()) => {
                self.publish(&seq, EventPayload::RunFinished(RunFinishedPayload {}));
            }
            Err(e) => {
                self.publish(
                    &seq,
                    EventPayload::RunError(RunErrorPayload {
                        kind: error_kind(e),
                        message: e.to_string(),
                    }),
                );
            }
        }

        result
    }

    async fn run_inner(
        &self,
        ctx: &CancellationToken,
        parent_repo: &std::path::Path,
        task: &str,
        options: &RunOptions,
        seq: &AtomicU64,
    ) -> Result<(), EngineError> {
        // Continue mode resumes an existing state file in place: a freshly
        // created worktree could never contain it, so a new worktree is
        // never created here regardless of `git_enabled`.
        let worktree_enabled =
            self.config.git_enabled && !options.no_worktree && !options.continue_mode;

        let mut owned_worktree = None;
        let work_dir = if worktree_enabled {
            let wt = worktree::create(ctx, parent_repo, task, &self.config.git_base_branch).await?;
            let path = wt.path.clone();
            owned_worktree = Some(wt);
            path
        } else {
            parent_repo.to_path_buf()
        };

        let state_path = work_dir.join(STATE_FILE_RELATIVE_PATH);

        if options.continue_mode {
            match state_store::load(&state_path) {
                Ok(_) => {}
                Err(StateStoreError::NotFound) => return Err(EngineError::NoStateToResume),
                Err(StateStoreError::Corrupt(msg)) => return Err(EngineError::Corrupt(msg)),
                Err(StateStoreError::Io(e)) => {
                    return Err(EngineError::Corrupt(format!("io error reading state: {e}")))
                }
            }
        } else {
            let prompt = if options.generate_plan {
                format!("{PLANNING_PREFIX} {task}")
            } else {
                format!("{EXECUTION_PREFIX} {task}")
            };
            state_store::save(
                &state_path,
                &TaskState {
                    current_step_description: "starting".to_string(),
                    next_step_prompt: prompt,
                    status: TaskStatus::Running,
                },
            )
            .map_err(|e| EngineError::Corrupt(e.to_string()))?;
        }

        let monitor_ctx = CancellationToken::new();
        let monitor_handle = {
            let monitor_ctx = monitor_ctx.clone();
            let run_id = self.run_id;
            let state_path = state_path.clone();
            let bus = self.bus.clone();
            let seq_counter = std::sync::Arc::new(AtomicU64::new(seq.load(Ordering::Relaxed)));
            tokio::spawn(async move {
                monitor::run(
                    monitor_ctx,
                    run_id,
                    state_path,
                    {
                        let seq_counter = seq_counter.clone();
                        move || seq_counter.fetch_add(1, Ordering::Relaxed)
                    },
                    move |event| bus.publish(event),
                )
                .await;
            })
        };

        let loop_result = self
            .main_loop(ctx, &state_path, &work_dir, seq)
            .await;

        monitor_ctx.cancel();
        let _ = monitor_handle.await;

        match &loop_result {
            Ok(()) => {
                if self.config.auto_cleanup {
                    state_store::delete(&state_path).ok();
                }
                if let Some(wt) = &owned_worktree {
                    if self.config.git_auto_cleanup {
                        if let Err(e) = worktree::cleanup(ctx, wt).await {
                            warn!(error = %e, "worktree cleanup failed after successful run");
                        }
                    }
                }
            }
            Err(_) => {
                if let Some(wt) = &owned_worktree {
                    if self.config.git_auto_cleanup {
                        if let Err(e) = worktree::cleanup(ctx, wt).await {
                            warn!(error = %e, "worktree cleanup failed after unsuccessful run");
                        }
                    }
                }
            }
        }

        loop_result
    }

    async fn main_loop(
        &self,
        ctx: &CancellationToken,
        state_path: &PathBuf,
        work_dir: &PathBuf,
        seq: &AtomicU64,
    ) -> Result<(), EngineError> {
        let mut iteration: u32 = 0;

        loop {
            if ctx.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let state = state_store::load(state_path).map_err(|e| match e {
                StateStoreError::NotFound => {
                    EngineError::Corrupt("state file disappeared mid-run".to_string())
                }
                StateStoreError::Corrupt(msg) => EngineError::Corrupt(msg),
                StateStoreError::Io(e) => EngineError::Corrupt(e.to_string()),
            })?;

            if state.is_completed() {
                return Ok(());
            }

            iteration += 1;
            self.publish(
                seq,
                EventPayload::IterationStarted(IterationStartedPayload {
                    iteration,
                    prompt: state.next_step_prompt.clone(),
                }),
            );

            let start = Instant::now();
            let bus = self.bus.clone();
            let run_id = self.run_id;
            let seq_for_sink = std::sync::Arc::new(AtomicU64::new(0));
            let sink_seq = seq_for_sink.clone();
            let sink = move |payload: ToolCallStartPayload| {
                bus.publish(Event {
                    run_id,
                    seq: sink_seq.fetch_add(1, Ordering::Relaxed),
                    timestamp: Utc::now(),
                    payload: EventPayload::ToolCallStart(payload),
                });
            };

            let mut exec_config =
                ExecutorConfig::new(state.next_step_prompt.clone(), work_dir.clone());
            exec_config.assistant_bin = self.config.assistant_bin.clone();
            exec_config.extra_args = self.config.assistant_args.clone();
            let exec_result = executor::execute(ctx, &exec_config, &sink).await;
            let ok = exec_result.is_ok();

            self.publish(
                seq,
                EventPayload::IterationFinished(IterationFinishedPayload {
                    iteration,
                    duration_ms: start.elapsed().as_millis() as u64,
                    ok,
                }),
            );

            if let Err(e) = exec_result {
                return Err(EngineError::Executor(e));
            }

            self.wait_for_state_change(ctx, state_path, &state).await?;
        }
    }

    async fn wait_for_state_change(
        &self,
        ctx: &CancellationToken,
        state_path: &PathBuf,
        previous: &TaskState,
    ) -> Result<(), EngineError> {
        let deadline = Instant::now() + ITERATION_TIMEOUT;

        loop {
            if ctx.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            if Instant::now() >= deadline {
                return Err(EngineError::StateUpdateTimeout);
            }

            match state_store::load(state_path) {
                Ok(state) if !state.equal(previous) => return Ok(()),
                Ok(_) => {}
                Err(StateStoreError::NotFound | StateStoreError::Corrupt(_)) => {}
                Err(StateStoreError::Io(_)) => {}
            }

            tokio::select! {
                () = sleep(STATE_POLL_INTERVAL) => {}
                () = ctx.cancelled() => return Err(EngineError::Cancelled),
            }
        }
    }
}

fn error_kind(err: &EngineError) -> String {
    let run_error: RunError = match err {
        EngineError::EmptyTask => RunError::Validation(err.to_string()),
        EngineError::NoStateToResume => RunError::NotFound(err.to_string()),
        EngineError::Corrupt(msg) => RunError::Corrupt(msg.clone()),
        EngineError::StateUpdateTimeout => RunError::Timeout(err.to_string()),
        EngineError::Worktree(e) => RunError::Infrastructure(e.to_string()),
        EngineError::Executor(ExecutorError::Timeout(d)) => {
            RunError::Timeout(format!("assistant exceeded {d:?}"))
        }
        EngineError::Executor(ExecutorError::ExitCode(code)) => RunError::Subprocess { code: *code },
        EngineError::Executor(ExecutorError::NotFound(bin)) => {
            RunError::NotFound(format!("assistant binary not found: {bin}"))
        }
        EngineError::Executor(ExecutorError::Cancelled) => RunError::Cancelled,
        EngineError::Executor(e) => RunError::Infrastructure(e.to_string()),
        EngineError::Cancelled => RunError::Cancelled,
    };
    match run_error {
        RunError::Validation(_) => "validation",
        RunError::NotFound(_) => "not_found",
        RunError::Corrupt(_) => "corrupt",
        RunError::Timeout(_) => "timeout",
        RunError::Subprocess { .. } => "subprocess",
        RunError::Cancelled => "cancelled",
        RunError::Infrastructure(_) => "infrastructure",
    }
    .to_string()
}
