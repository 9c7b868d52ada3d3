//! Control HTTP server (C8): the engine's wire surface, served over a
//! Unix-domain socket rather than TCP.
//!
//! Router construction follows `trunk-rs-trunk/src/serve/mod.rs` closely —
//! state behind an `Arc`, `TraceLayer` for request logging — but binds a
//! `tokio::net::UnixListener` and drives connections through
//! `hyper_util::server::conn::auto` by hand, since `axum::serve` targets
//! `TcpListener`-shaped listeners and there is no off-the-shelf UDS adapter
//! in this stack.

pub mod types;

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Path as AxumPath, Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use hyper_util::rt::{TokioExecutor, TokioIo};
use time::OffsetDateTime;
use tokio::net::UnixListener;
use tokio::sync::broadcast;
use tokio_util::task::TaskTracker;
use tower::Service;
use tower_http::trace::TraceLayer;

use crate::cache::InstanceCache;
use crate::digest::ShortDigest;
use crate::error::{EngineError, EngineResult};
use crate::registry::Registry;

use types::{
    decode_payload, BuildRequest, BuildResponse, CallOnceRequest, CallRequest,
    FunctionKeyRequest, ListRequest, LoadRequest, LoadResponse, LoadedEntryResponse, LogsQuery,
    ReassignTagRequest, StatusResponse,
};

pub struct AppState {
    pub registry: Registry,
    pub cache: Arc<InstanceCache>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/load", post(load))
        .route("/unload", post(unload))
        .route("/stop", post(stop))
        .route("/call", post(call))
        .route("/call-once", post(call_once))
        .route("/build", post(build))
        .route("/list", post(list))
        .route("/loaded", get(loaded))
        .route("/reassign-tag", post(reassign_tag))
        .route("/logs/{namespace}/{name}", get(logs))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Accept connections on `socket_path` until `shutdown_rx` fires. Each
/// connection is served on its own tracked task; on shutdown, new
/// connections stop being accepted but in-flight ones are given a chance to
/// finish naturally rather than being aborted mid-response.
#[tracing::instrument(level = "info", skip(state, shutdown_rx))]
pub async fn serve_uds(
    socket_path: &Path,
    state: Arc<AppState>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let listener = UnixListener::bind(socket_path)?;
    let app = router(state);
    let tracker = TaskTracker::new();
    tracing::info!(socket = %socket_path.display(), "control server listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _addr) = accepted?;
                let mut tower_service = app.clone();
                tracker.spawn(async move {
                    let io = TokioIo::new(stream);
                    let hyper_service = hyper::service::service_fn(move |request| {
                        tower_service.call(request)
                    });
                    if let Err(err) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                        .serve_connection_with_upgrades(io, hyper_service)
                        .await
                    {
                        tracing::debug!(error = %err, "error serving control connection");
                    }
                });
            }
            _ = shutdown_rx.recv() => {
                tracing::info!("control server shutting down, draining in-flight connections");
                break;
            }
        }
    }

    tracker.close();
    tracker.wait().await;
    Ok(())
}

async fn status() -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        timestamp: OffsetDateTime::now_utc(),
    })
}

async fn load(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoadRequest>,
) -> EngineResult<Json<LoadResponse>> {
    let outcome = state
        .cache
        .load(&req.namespace, &req.name, &req.digest, req.config, req.force_load)
        .await?;
    Ok(Json(LoadResponse {
        namespace: outcome.namespace,
        name: outcome.name,
        digest: outcome.digest.to_string(),
        load_time_millis: outcome.load_time.as_millis() as u64,
    }))
}

async fn unload(
    State(state): State<Arc<AppState>>,
    Json(req): Json<FunctionKeyRequest>,
) -> EngineResult<Json<serde_json::Value>> {
    state.cache.unload(&req.namespace, &req.name).await?;
    Ok(Json(serde_json::json!({})))
}

async fn stop(
    State(state): State<Arc<AppState>>,
    Json(req): Json<FunctionKeyRequest>,
) -> EngineResult<Json<serde_json::Value>> {
    state.cache.stop(&req.namespace, &req.name).await?;
    Ok(Json(serde_json::json!({})))
}

async fn call(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CallRequest>,
) -> EngineResult<Response> {
    let payload = decode_payload(&req.payload)?;
    let (bytes, _elapsed) = state
        .cache
        .call(&req.namespace, &req.name, &req.entrypoint, payload, req.config)
        .await?;
    Ok(raw_response(bytes))
}

async fn call_once(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CallOnceRequest>,
) -> EngineResult<Response> {
    let payload = decode_payload(&req.payload)?;
    let bytes = state
        .cache
        .one_off_call(
            &req.namespace,
            &req.name,
            &req.reference,
            &req.entrypoint,
            payload,
            req.config,
        )
        .await?;
    Ok(raw_response(bytes))
}

/// Plugin output is raw bytes of unknown shape; advertise JSON when the
/// bytes happen to parse as JSON, opaque bytes otherwise.
fn raw_response(bytes: Vec<u8>) -> Response {
    let content_type = if serde_json::from_slice::<serde_json::Value>(&bytes).is_ok() {
        "application/json"
    } else {
        "application/octet-stream"
    };
    ([(axum::http::header::CONTENT_TYPE, content_type)], bytes).into_response()
}

async fn build(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BuildRequest>,
) -> EngineResult<Json<BuildResponse>> {
    let started = Instant::now();
    let language = req.language()?.to_string();
    let outcome = crate::builder::build_and_push(
        &state.registry,
        &req.namespace,
        &req.name,
        &language,
        Path::new(&req.path),
        req.tag.as_deref(),
        &req.manifest,
    )
    .await?;

    Ok(Json(BuildResponse {
        name: req.name,
        namespace: req.namespace,
        digest: outcome.resolved.short_digest.to_string(),
        tag: req.tag,
        build_time_millis: started.elapsed().as_millis() as u64,
        reused: outcome.reused,
    }))
}

async fn list(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ListRequest>,
) -> EngineResult<Response> {
    match (req.namespace, req.name) {
        (Some(namespace), Some(name)) => {
            let meta = state
                .registry
                .get(&namespace, &name)
                .map_err(EngineError::Internal)?
                .ok_or_else(|| EngineError::NotFound(format!("{namespace}/{name}")))?;
            Ok(Json(meta).into_response())
        }
        _ => {
            let all = state.registry.list_all().map_err(EngineError::Internal)?;
            Ok(Json(all).into_response())
        }
    }
}

async fn loaded(State(state): State<Arc<AppState>>) -> Json<Vec<LoadedEntryResponse>> {
    let entries = state.cache.list().await;
    Json(
        entries
            .into_iter()
            .map(|e| LoadedEntryResponse {
                namespace: e.namespace,
                name: e.name,
                status: e.status.as_str().to_string(),
            })
            .collect(),
    )
}

async fn reassign_tag(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ReassignTagRequest>,
) -> EngineResult<Json<serde_json::Value>> {
    let digest = ShortDigest::parse(&req.digest)
        .map_err(|e| EngineError::BadRequest(format!("invalid digest: {e}")))?;
    state
        .registry
        .reassign_tag(&req.namespace, &req.name, &req.tag, &digest)?;
    Ok(Json(serde_json::json!({})))
}

async fn logs(
    State(state): State<Arc<AppState>>,
    AxumPath((namespace, name)): AxumPath<(String, String)>,
    Query(query): Query<LogsQuery>,
) -> EngineResult<Json<Vec<String>>> {
    let ring = state
        .cache
        .logs(&namespace, &name)
        .await
        .ok_or_else(|| EngineError::NotFound(format!("{namespace}/{name}")))?;
    let since = query.since.map(Duration::from_secs);
    let entries = ring.query(since, query.tail);
    Ok(Json(entries.into_iter().map(|e| e.line).collect()))
}
