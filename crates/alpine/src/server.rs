//! HTTP Control Plane (Section 4.7): run submission, status, and SSE event
//! streams.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Path as AxumPath, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use alpine_core::config::Config;
use alpine_core::types::{RunId, RunStatus};

use crate::engine::{Engine, EngineError, RunOptions};
use crate::event_bus::EventBus;
use crate::run_registry::RunRegistry;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5);

pub struct AppState {
    pub config: Arc<Config>,
    pub bus: EventBus,
    pub registry: Arc<RunRegistry>,
    pub runs_root: std::path::PathBuf,
    pub errors_total: AtomicU64,
    pub started_at: Instant,
    pub root_cancel: CancellationToken,
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/runs", post(create_run))
        .route("/runs/{run_id}", get(get_run))
        .route("/runs/{run_id}/events", get(stream_events))
        .route("/runs/{run_id}/cancel", post(cancel_run))
        .route("/healthz", get(health_check))
        .route("/observability", get(observability))
        .with_state(state)
}

/// Bind `config.http_port` (0 = OS-assigned) and serve until `root_cancel`
/// fires. Logs the bound address on startup.
pub async fn start_server(state: Arc<AppState>) -> std::io::Result<()> {
    let addr = format!("127.0.0.1:{}", state.config.http_port);
    let listener = TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;
    info!(address = %local_addr, "http control plane listening");

    let router = create_router(state.clone());
    let root_cancel = state.root_cancel.clone();

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            root_cancel.cancelled().await;
            info!("shutting down http control plane");
            tokio::time::sleep(SHUTDOWN_GRACE_PERIOD).await;
        })
        .await
}

#[derive(Debug, Deserialize)]
struct CreateRunRequest {
    task: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct CreateRunResponse {
    run_id: String,
}

async fn create_run(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateRunRequest>,
) -> impl IntoResponse {
    if request.task.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "task must be non-empty").into_response();
    }

    let run_id = RunId::new();
    let work_dir = state.runs_root.join(run_id.to_string());
    if let Err(e) = std::fs::create_dir_all(work_dir.join("agent_state")) {
        state.errors_total.fetch_add(1, Ordering::Relaxed);
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to allocate run directory: {e}"),
        )
            .into_response();
    }

    let cancel = state
        .registry
        .insert(run_id, request.task.clone(), work_dir.clone());
    state.registry.set_status(run_id, RunStatus::Running);

    let config = state.config.clone();
    let bus = state.bus.clone();
    let registry = state.registry.clone();
    let state_for_task = state.clone();

    tokio::spawn(async move {
        let engine = Engine::new(&config, bus, run_id);
        // Server-mode runs execute directly inside their pre-allocated
        // `runs/<run_id>/` directory rather than via a worktree: there is
        // no natural "parent repository" for an HTTP submission to branch
        // from, and the per-run directory already gives the isolation a
        // worktree would otherwise provide.
        let options = RunOptions {
            generate_plan: true,
            no_worktree: true,
            continue_mode: false,
        };
        let result = engine.run(cancel, &work_dir, &request.task, options).await;
        match result {
            Ok(()) => registry.finish(run_id, RunStatus::Completed, None),
            Err(e) => {
                state_for_task.errors_total.fetch_add(1, Ordering::Relaxed);
                registry.finish(run_id, RunStatus::Failed, Some(engine_error_message(&e)));
            }
        }
    });

    (StatusCode::OK, Json(CreateRunResponse {
        run_id: run_id.to_string(),
    }))
        .into_response()
}

fn engine_error_message(err: &EngineError) -> String {
    err.to_string()
}

async fn get_run(
    State(state): State<Arc<AppState>>,
    AxumPath(run_id): AxumPath<String>,
) -> impl IntoResponse {
    let Some(run_id) = RunId::from_string(&run_id) else {
        return (StatusCode::BAD_REQUEST, "invalid run id").into_response();
    };
    match state.registry.get(run_id) {
        Some(snapshot) => Json(snapshot).into_response(),
        None => (StatusCode::NOT_FOUND, "unknown run id").into_response(),
    }
}

async fn cancel_run(
    State(state): State<Arc<AppState>>,
    AxumPath(run_id): AxumPath<String>,
) -> impl IntoResponse {
    let Some(run_id) = RunId::from_string(&run_id) else {
        return (StatusCode::BAD_REQUEST, "invalid run id").into_response();
    };
    if state.registry.cancel(run_id) {
        StatusCode::NO_CONTENT.into_response()
    } else {
        (StatusCode::NOT_FOUND, "unknown run id").into_response()
    }
}

async fn stream_events(
    State(state): State<Arc<AppState>>,
    AxumPath(run_id): AxumPath<String>,
) -> impl IntoResponse {
    let Some(run_id) = RunId::from_string(&run_id) else {
        return (StatusCode::BAD_REQUEST, "invalid run id").into_response();
    };

    match state.bus.subscribe(run_id) {
        Ok(subscription) => {
            let stream = stream::unfold(subscription, |subscription| async move {
                let event = subscription.recv().await?;
                let sse_event = SseEvent::default()
                    .event(event.event_type().as_str())
                    .id(event.seq.to_string())
                    .data(event.to_json());
                Some((Ok::<_, std::convert::Infallible>(sse_event), subscription))
            });

            Sse::new(stream)
                .keep_alive(
                    KeepAlive::new()
                        .interval(HEARTBEAT_INTERVAL)
                        .text("keepalive"),
                )
                .into_response()
        }
        Err(e) => (StatusCode::TOO_MANY_REQUESTS, e.to_string()).into_response(),
    }
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

#[derive(Debug, Serialize, Deserialize)]
struct ObservabilityResponse {
    events_published: u64,
    errors_total: u64,
    uptime_seconds: u64,
    active_runs: usize,
}

async fn observability(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(ObservabilityResponse {
        events_published: state.bus.published_total(),
        errors_total: state.errors_total.load(Ordering::Relaxed),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        active_runs: state.registry.active_count(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use tempfile::tempdir;
    use tower::ServiceExt;

    fn test_state(runs_root: std::path::PathBuf) -> Arc<AppState> {
        Arc::new(AppState {
            config: Arc::new(Config::default()),
            bus: EventBus::new(256, 10),
            registry: Arc::new(RunRegistry::new()),
            runs_root,
            errors_total: AtomicU64::new(0),
            started_at: Instant::now(),
            root_cancel: CancellationToken::new(),
        })
    }

    #[tokio::test]
    async fn health_check_returns_ok() {
        let dir = tempdir().unwrap();
        let router = create_router(test_state(dir.path().to_path_buf()));
        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .uri("/healthz")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn get_unknown_run_is_404() {
        let dir = tempdir().unwrap();
        let router = create_router(test_state(dir.path().to_path_buf()));
        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .uri(format!("/runs/{}", RunId::new()))
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn create_run_rejects_empty_task() {
        let dir = tempdir().unwrap();
        let router = create_router(test_state(dir.path().to_path_buf()));
        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/runs")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(r#"{"task":""}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn create_run_returns_run_id_and_is_queryable() {
        let dir = tempdir().unwrap();
        let router = create_router(test_state(dir.path().to_path_buf()));
        let response = router
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/runs")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(r#"{"task":"add flag parsing"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: CreateRunResponse = serde_json::from_slice(&body).unwrap();

        let get_response = router
            .oneshot(
                axum::http::Request::builder()
                    .uri(format!("/runs/{}", parsed.run_id))
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(get_response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn cancel_unknown_run_is_404() {
        let dir = tempdir().unwrap();
        let router = create_router(test_state(dir.path().to_path_buf()));
        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri(format!("/runs/{}/cancel", RunId::new()))
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn events_stream_has_sse_content_type_for_known_run() {
        let dir = tempdir().unwrap();
        let state = test_state(dir.path().to_path_buf());
        let run_id = RunId::new();
        state
            .registry
            .insert(run_id, "t".to_string(), dir.path().to_path_buf());
        let router = create_router(state);
        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .uri(format!("/runs/{run_id}/events"))
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap();
        assert!(content_type.starts_with("text/event-stream"));
    }

    #[tokio::test]
    async fn observability_reports_counters() {
        let dir = tempdir().unwrap();
        let router = create_router(test_state(dir.path().to_path_buf()));
        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .uri("/observability")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: ObservabilityResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed.errors_total, 0);
    }

    /// Seed scenario 6 (Section 8): a full run driven by a fake assistant
    /// script, observed by a subscriber that connected before the run
    /// started — events arrive in order and end with `run_finished`, and
    /// `GET /runs/{id}` reports the terminal status afterward.
    #[tokio::test]
    async fn serve_mode_full_run_emits_ordered_events_ending_in_run_finished() {
        use alpine_core::events::EventType;
        use alpine_core::types::RunSnapshot;
        use std::time::Duration;

        let runs_root = tempdir().unwrap();
        let assistant_dir = tempdir().unwrap();
        let script = assistant_dir.path().join("fake_assistant.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\nset -e\nmkdir -p agent_state\nprintf '{\"current_step_description\":\"done\",\"next_step_prompt\":\"\",\"status\":\"completed\"}' > agent_state/agent_state.json.tmp\nmv agent_state/agent_state.json.tmp agent_state/agent_state.json\n",
        )
        .unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let mut config = Config::default();
        config.assistant_bin = "/bin/sh".to_string();
        config.assistant_args = vec![script.to_string_lossy().into_owned()];
        let config = Arc::new(config);

        let bus = EventBus::new(256, 10);
        let registry = Arc::new(RunRegistry::new());
        let run_id = RunId::new();
        let work_dir = runs_root.path().join(run_id.to_string());
        std::fs::create_dir_all(work_dir.join("agent_state")).unwrap();
        let cancel = registry.insert(run_id, "add flag parsing".to_string(), work_dir.clone());
        registry.set_status(run_id, RunStatus::Running);

        // Subscribe before the run starts, exactly as an SSE client that
        // connected right after submission would.
        let sub = bus.subscribe(run_id).unwrap();

        let engine = Engine::new(config.as_ref(), bus.clone(), run_id);
        let options = RunOptions {
            generate_plan: true,
            no_worktree: true,
            continue_mode: false,
        };
        let result = engine
            .run(cancel, &work_dir, "add flag parsing", options)
            .await;
        assert!(result.is_ok(), "{result:?}");
        registry.finish(run_id, RunStatus::Completed, None);

        let mut kinds = Vec::new();
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(200), sub.recv()).await
        {
            kinds.push(event.event_type());
        }
        assert_eq!(kinds.first(), Some(&EventType::RunStarted));
        assert_eq!(kinds.last(), Some(&EventType::RunFinished));

        let state = Arc::new(AppState {
            config,
            bus,
            registry,
            runs_root: runs_root.path().to_path_buf(),
            errors_total: AtomicU64::new(0),
            started_at: Instant::now(),
            root_cancel: CancellationToken::new(),
        });
        let router = create_router(state);
        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .uri(format!("/runs/{run_id}"))
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let snapshot: RunSnapshot = serde_json::from_slice(&body).unwrap();
        assert_eq!(snapshot.status, RunStatus::Completed);
    }
}
