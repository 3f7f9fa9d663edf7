//! HTTP façade over the feedback store and the watch registry.
//!
//! Every `/api` route takes an optional `?target=` query parameter naming a
//! configured review root; without it the first configured target is used.
//! All `/api` routes sit behind [`require_local_origin`].

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use redpen_core::schema::{self, FeedbackRecord};
use redpen_core::{FeedbackItem, FeedbackStore, ItemKey, StoreError, StoreRegistry, WatchError, WatchRegistry};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch as flag};
use tracing::{debug, error, info, warn};

use crate::agent::{self, AgentWake, WakeError};
use crate::config::Config;
use crate::transport;

/// Hostnames a request may come from.
const LOCAL_HOSTS: &[&str] = &["localhost", "127.0.0.1"];

/// Shared state handed to every handler.
pub struct AppState {
    pub config: Config,
    pub stores: StoreRegistry,
    pub watch: WatchRegistry,
    pub wake: Arc<dyn AgentWake>,
    /// Flipped to `true` once graceful shutdown begins; ends open push streams.
    shutdown: flag::Sender<bool>,
}

impl AppState {
    pub fn new(config: Config, wake: Arc<dyn AgentWake>) -> Self {
        let watch = WatchRegistry::new(config.watch_config());
        let (shutdown, _) = flag::channel(false);
        Self { config, stores: StoreRegistry::new(), watch, wake, shutdown }
    }

    /// Tells every open push stream to finish so in-flight responses can drain.
    pub fn begin_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Resolves the `?target=` parameter to a name and root directory.
    fn target(&self, query: &TargetQuery) -> Result<(String, PathBuf), ApiError> {
        self.config
            .target(query.target.as_deref())
            .map(|(name, dir)| (name.to_owned(), dir.to_path_buf()))
            .ok_or_else(|| ApiError::UnknownTarget(query.target.clone().unwrap_or_default()))
    }

    fn store(&self, query: &TargetQuery) -> Result<(String, Arc<FeedbackStore>), ApiError> {
        let (name, dir) = self.target(query)?;
        Ok((name, self.stores.get(dir)))
    }
}

/// Builds the application router.
pub fn router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/targets", get(list_targets))
        .route("/feedback", get(list_active).post(upsert).put(replace).delete(delete))
        .route("/feedback/resolved", get(list_resolved))
        .route("/feedback/resolve", post(resolve))
        .route("/feedback/unresolve", post(unresolve))
        .route("/submit", post(submit))
        .route("/approve", post(approve))
        .route("/watch", get(watch))
        .layer(middleware::from_fn(require_local_origin));

    Router::new()
        .route("/health", get(|| async { "OK" }))
        .nest("/api", api)
        .with_state(state)
}

/// Serves `state` on `listener` until `signal` resolves, then drains.
///
/// The signal also ends open push streams, which never finish on their own.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    signal: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let app = router(Arc::clone(&state));
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            signal.await;
            state.begin_shutdown();
        })
        .await
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("unknown target: {0:?}")]
    UnknownTarget(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Watch(#[from] WatchError),

    #[error("could not reach the agent: {0}")]
    Wake(#[from] WakeError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::UnknownTarget(_) => StatusCode::NOT_FOUND,
            ApiError::Store(StoreError::Validation(_)) => StatusCode::BAD_REQUEST,
            ApiError::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Store(StoreError::Conflict(_)) => StatusCode::CONFLICT,
            ApiError::Store(_) | ApiError::Watch(_) | ApiError::Wake(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        } else {
            debug!(error = %self, %status, "request rejected");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

// ---------------------------------------------------------------------------
// Origin guard
// ---------------------------------------------------------------------------

/// Rejects requests whose `Origin` (or, absent that, `Host`) is not local.
async fn require_local_origin(request: Request, next: Next) -> Response {
    match check_origin(request.headers()) {
        Ok(()) => next.run(request).await,
        Err(reason) => {
            warn!(%reason, path = %request.uri().path(), "rejected non-local request");
            ApiError::Forbidden(reason).into_response()
        }
    }
}

fn check_origin(headers: &HeaderMap) -> Result<(), String> {
    let header_str = |name: header::HeaderName| headers.get(name).and_then(|v| v.to_str().ok());

    if let Some(origin) = header_str(header::ORIGIN) {
        let host = origin
            .split_once("://")
            .map_or(origin, |(_, rest)| rest)
            .split(['/', ':'])
            .next()
            .unwrap_or_default();
        return if LOCAL_HOSTS.contains(&host) {
            Ok(())
        } else {
            Err(format!("origin not allowed: {origin}"))
        };
    }
    if let Some(host) = header_str(header::HOST) {
        let name = host.split(':').next().unwrap_or_default();
        return if LOCAL_HOSTS.contains(&name) {
            Ok(())
        } else {
            Err(format!("host not allowed: {host}"))
        };
    }
    Err("an Origin or Host header is required".to_owned())
}

// ---------------------------------------------------------------------------
// Request bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct TargetQuery {
    pub target: Option<String>,
}

/// One item as posted by the browser.
///
/// Line numbers are signed so negative input is rejected with a message
/// instead of a generic decode error.
#[derive(Debug, Deserialize)]
struct ItemRequest {
    file_path: String,
    line_number: i64,
    #[serde(default)]
    line_number_end: Option<i64>,
    comment: String,
}

impl ItemRequest {
    /// A range selected bottom-up arrives reversed; it is swapped, and an
    /// end equal to the start is dropped.
    fn into_item(self) -> Result<FeedbackItem, ApiError> {
        let (mut start, mut end) = (self.line_number, self.line_number_end);
        if let Some(e) = end {
            if start > e {
                (start, end) = (e, Some(start));
            }
        }
        let line = |n: i64| {
            u32::try_from(n).map_err(|_| ApiError::BadRequest(format!("line number out of range: {n}")))
        };
        let mut item = FeedbackItem::draft(self.file_path, line(start)?, self.comment);
        item.line_number_end = end.map(line).transpose()?;
        Ok(item.normalized())
    }
}

#[derive(Debug, Deserialize)]
struct KeyRequest {
    file_path: String,
    line_number: u32,
    #[serde(default)]
    line_number_end: Option<u32>,
}

impl From<KeyRequest> for ItemKey {
    /// Reversed ranges are swapped, as for [`ItemRequest`].
    fn from(k: KeyRequest) -> Self {
        let (start, end) = match k.line_number_end {
            Some(end) if end < k.line_number => (end, Some(k.line_number)),
            end => (k.line_number, end),
        };
        ItemKey::new(&k.file_path, start, end)
    }
}

/// Either a single object or `{ "items": [...] }`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many { items: Vec<T> },
    One(T),
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::Many { items } => items,
            OneOrMany::One(item) => vec![item],
        }
    }
}

/// Parses a JSON body, turning any decode failure into a 400 with a reason.
fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|err| ApiError::BadRequest(format!("invalid request body: {err}")))
}

#[derive(Debug, Serialize)]
struct ItemsResponse {
    items: Vec<FeedbackRecord>,
}

impl From<Vec<FeedbackItem>> for ItemsResponse {
    fn from(items: Vec<FeedbackItem>) -> Self {
        Self { items: items.iter().map(FeedbackRecord::from).collect() }
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn list_targets(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let targets = state.config.target_names();
    let default_target = targets.first().cloned();
    Json(json!({ "targets": targets, "defaultTarget": default_target }))
}

async fn list_active(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TargetQuery>,
) -> Result<Json<ItemsResponse>, ApiError> {
    let (_, store) = state.store(&query)?;
    Ok(Json(store.list_active().await.into()))
}

async fn list_resolved(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TargetQuery>,
) -> Result<Json<ItemsResponse>, ApiError> {
    let (_, store) = state.store(&query)?;
    Ok(Json(store.list_resolved().await.into()))
}

async fn upsert(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TargetQuery>,
    body: Bytes,
) -> Result<Json<ItemsResponse>, ApiError> {
    let (_, store) = state.store(&query)?;
    let items = parse_body::<OneOrMany<ItemRequest>>(&body)?
        .into_vec()
        .into_iter()
        .map(ItemRequest::into_item)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(store.upsert_many(items).await?.into()))
}

#[derive(Debug, Deserialize)]
struct ReplaceRequest {
    items: Vec<ItemRequest>,
}

async fn replace(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TargetQuery>,
    body: Bytes,
) -> Result<Json<ItemsResponse>, ApiError> {
    let (_, store) = state.store(&query)?;
    let items = parse_body::<ReplaceRequest>(&body)?
        .items
        .into_iter()
        .map(ItemRequest::into_item)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(store.replace_active(items).await?.into()))
}

async fn delete(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TargetQuery>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (_, store) = state.store(&query)?;
    let key: ItemKey = parse_body::<KeyRequest>(&body)?.into();
    let removed = store.delete(&key).await?;
    Ok(Json(json!({ "item": FeedbackRecord::from(&removed) })))
}

async fn resolve(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TargetQuery>,
    body: Bytes,
) -> Result<Json<ItemsResponse>, ApiError> {
    let (_, store) = state.store(&query)?;
    let keys: Vec<ItemKey> = parse_body::<OneOrMany<KeyRequest>>(&body)?
        .into_vec()
        .into_iter()
        .map(ItemKey::from)
        .collect();
    if keys.is_empty() {
        return Err(ApiError::BadRequest("no items to resolve".to_owned()));
    }
    Ok(Json(store.resolve_many(&keys).await?.into()))
}

async fn unresolve(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TargetQuery>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (_, store) = state.store(&query)?;
    let key: ItemKey = parse_body::<KeyRequest>(&body)?.into();
    let item = store.unresolve(&key).await?;
    Ok(Json(json!({ "item": FeedbackRecord::from(&item) })))
}

/// Writes a hand-off snapshot, points the agent at it, and only then stamps
/// the snapshot's drafts as submitted. A failed write or wake leaves the
/// store untouched.
async fn submit(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TargetQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (name, store) = state.store(&query)?;
    let snapshot = store.list_active().await;
    if snapshot.is_empty() {
        return Err(StoreError::Validation("nothing to submit".to_owned()).into());
    }

    let id = schema::new_handoff_id();
    let path = store.write_handoff(&snapshot, &id).await?;
    let handoff = relative_to(store.root(), &path);

    state.wake.wake(&name, &agent::review_instruction(&handoff)).await?;
    let keys: Vec<ItemKey> = snapshot.iter().map(FeedbackItem::key).collect();
    store.mark_submitted(&keys).await?;
    info!(target_name = %name, %handoff, items = snapshot.len(), "feedback handed to agent");
    Ok(Json(json!({ "ok": true, "handoff": handoff, "items": snapshot.len() })))
}

async fn approve(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TargetQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (name, _) = state.target(&query)?;
    state.wake.wake(&name, agent::COMMIT_INSTRUCTION).await?;
    info!(target_name = %name, "commit requested");
    Ok(Json(json!({ "ok": true })))
}

async fn watch(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TargetQuery>,
) -> Result<Response, ApiError> {
    let (_, dir) = state.target(&query)?;
    let (tx, rx) = mpsc::unbounded_channel();
    transport::spawn_connection(&state.watch, &dir, state.config.keepalive(), tx, state.shutdown.subscribe())?;
    Ok(transport::sse_stream(rx).into_response())
}

fn relative_to(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}
