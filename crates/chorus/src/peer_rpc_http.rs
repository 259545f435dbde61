//! HTTP binding of [`PeerTransport`]. `HttpPeerTransport` is the client
//! half, dialing a peer's `{ip}:{port}` directly (node identity is its
//! routable IP, see `chorus_raft::NodeId`); `router` is the server half, an
//! `axum` app that dispatches each route into the local [`Node`]. The wire
//! shape is plain JSON, `serde_json`, already pulled in for on-disk journal
//! persistence, doing double duty for on-wire payloads.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use chorus_raft::{AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse};
use chorus_util::ranges::ChunkRange;

use crate::entities::{Entity, Filter, MetaOp};
use crate::errors::{ChorusError, Result};
use crate::global_index::NodeId;
use crate::journal::JournalDump;
use crate::local_meta_store::ApplyOutcome;
use crate::node::Node;
use crate::peer_rpc::{PeerTransport, PrepareResult};

pub struct HttpPeerTransport {
    client: reqwest::Client,
    port: u16,
}

impl HttpPeerTransport {
    pub fn new(timeout: Duration, port: u16) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client builds with default tls backend");
        HttpPeerTransport { client, port }
    }

    fn url(&self, to: &NodeId, path: &str) -> String {
        format!("http://{to}:{}{path}", self.port)
    }

    async fn post_json<Req: Serialize + Sync, Resp: for<'de> Deserialize<'de>>(&self, to: &NodeId, path: &str, body: &Req) -> Result<Resp> {
        let resp = self
            .client
            .post(self.url(to, path))
            .json(body)
            .send()
            .await
            .map_err(|e| transient(to, e))?;
        read_response(to, resp).await
    }

    async fn get_json<Resp: for<'de> Deserialize<'de>>(&self, to: &NodeId, path: &str, query: &[(&str, &str)]) -> Result<Resp> {
        let resp = self
            .client
            .get(self.url(to, path))
            .query(query)
            .send()
            .await
            .map_err(|e| transient(to, e))?;
        read_response(to, resp).await
    }
}

fn transient(to: &NodeId, e: reqwest::Error) -> ChorusError {
    ChorusError::TransientPeer {
        node_id: to.clone(),
        message: e.to_string(),
    }
}

async fn read_response<Resp: for<'de> Deserialize<'de>>(to: &NodeId, resp: reqwest::Response) -> Result<Resp> {
    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        return Err(ChorusError::TransientPeer {
            node_id: to.clone(),
            message: format!("{status}: {body}"),
        });
    }
    resp.json().await.map_err(|e| transient(to, e))
}

#[async_trait]
impl PeerTransport for HttpPeerTransport {
    async fn request_vote(&self, to: &NodeId, req: RequestVoteRequest) -> Result<RequestVoteResponse> {
        self.post_json(to, "/raft/request_vote", &req).await
    }

    async fn append_entries(&self, to: &NodeId, req: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        self.post_json(to, "/raft/append_entries", &req).await
    }

    async fn get_data(&self, to: &NodeId, kind: &str, filters: &[Filter]) -> Result<Vec<Entity>> {
        self.post_json(to, "/meta/get", &GetDataRequest { kind: kind.to_string(), filters: filters.to_vec() })
            .await
    }

    async fn entity_exists(&self, to: &NodeId, kind: &str, id: &str) -> Result<bool> {
        self.get_json(to, "/meta/exists", &[("kind", kind), ("id", id)]).await
    }

    async fn prepare(&self, to: &NodeId, task_id: &str, op: MetaOp, entity: Entity, term: u64) -> Result<PrepareResult> {
        self.post_json(
            to,
            "/meta/prepare",
            &PrepareRequest {
                task_id: task_id.to_string(),
                op,
                entity,
                term,
            },
        )
        .await
    }

    async fn commit_operation(&self, to: &NodeId, task_id: &str) -> Result<bool> {
        self.post_json(to, "/meta/commit", &TaskIdRequest { task_id: task_id.to_string() }).await
    }

    async fn rollback_operation(&self, to: &NodeId, task_id: &str) -> Result<bool> {
        self.post_json(to, "/meta/rollback", &TaskIdRequest { task_id: task_id.to_string() }).await
    }

    async fn get_journal_dump(&self, to: &NodeId) -> Result<JournalDump> {
        self.get_json(to, "/journal/dump", &[]).await
    }

    async fn restore_journal_from_dump(&self, to: &NodeId, dump: JournalDump) -> Result<()> {
        self.post_json(to, "/journal/restore", &dump).await
    }

    async fn delete_journal(&self, to: &NodeId) -> Result<()> {
        self.post_json(to, "/journal/delete", &EmptyRequest {}).await
    }

    async fn get_full_dump(&self, to: &NodeId) -> Result<Vec<Entity>> {
        self.get_json(to, "/meta/full_dump", &[]).await
    }

    async fn restore_from_dump(&self, to: &NodeId, entities: Vec<Entity>) -> Result<()> {
        self.post_json(to, "/meta/restore", &entities).await
    }

    async fn list_files(&self, to: &NodeId) -> Result<Vec<String>> {
        self.get_json(to, "/ranges/list_files", &[]).await
    }

    async fn range_exists(&self, to: &NodeId, filename: &str) -> Result<bool> {
        self.get_json(to, "/ranges/exists", &[("filename", filename)]).await
    }

    async fn get_file_ranges(&self, to: &NodeId, filename: &str) -> Result<Vec<String>> {
        self.get_json(to, "/ranges/list_ranges", &[("filename", filename)]).await
    }

    async fn create_range(&self, to: &NodeId, filename: &str, range_key: &str, bytes: Vec<u8>) -> Result<()> {
        self.post_json(
            to,
            "/ranges/create",
            &CreateRangeRequest {
                filename: filename.to_string(),
                range_key: range_key.to_string(),
                bytes,
            },
        )
        .await
    }

    async fn get_chunk_range(&self, to: &NodeId, filename: &str, range_key: &str) -> Result<Vec<u8>> {
        self.get_json(to, "/ranges/get", &[("filename", filename), ("range_key", range_key)]).await
    }

    async fn delete_range(&self, to: &NodeId, filename: &str, range_key: &str) -> Result<bool> {
        self.post_json(
            to,
            "/ranges/delete",
            &RangeKeyRequest {
                filename: filename.to_string(),
                range_key: range_key.to_string(),
            },
        )
        .await
    }
}

#[derive(Serialize, Deserialize)]
struct GetDataRequest {
    kind: String,
    filters: Vec<Filter>,
}

#[derive(Serialize, Deserialize)]
struct PrepareRequest {
    task_id: String,
    op: MetaOp,
    entity: Entity,
    term: u64,
}

#[derive(Serialize, Deserialize)]
struct TaskIdRequest {
    task_id: String,
}

#[derive(Serialize, Deserialize)]
struct EmptyRequest {}

#[derive(Serialize, Deserialize)]
struct CreateRangeRequest {
    filename: String,
    range_key: String,
    bytes: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct RangeKeyRequest {
    filename: String,
    range_key: String,
}

#[derive(Deserialize)]
struct ExistsQuery {
    kind: Option<String>,
    id: Option<String>,
}

#[derive(Deserialize)]
struct FilenameQuery {
    filename: String,
}

#[derive(Deserialize)]
struct ChunkRangeQuery {
    filename: String,
    range_key: String,
}

struct ApiError(ChorusError);

impl From<ChorusError> for ApiError {
    fn from(e: ChorusError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ChorusError::NotFound { .. } => StatusCode::NOT_FOUND,
            ChorusError::NotLeader { .. } => StatusCode::CONFLICT,
            ChorusError::PrepareRejected { .. } => StatusCode::CONFLICT,
            ChorusError::ReplicationShortage { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ChorusError::StaleLeader { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.0.to_string()).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

async fn request_vote_handler(State(node): State<Arc<Node>>, Json(req): Json<RequestVoteRequest>) -> Json<RequestVoteResponse> {
    Json(node.handle_request_vote(req))
}

async fn append_entries_handler(State(node): State<Arc<Node>>, Json(req): Json<AppendEntriesRequest>) -> Json<AppendEntriesResponse> {
    Json(node.handle_append_entries(req).await)
}

async fn get_data_handler(State(node): State<Arc<Node>>, Json(req): Json<GetDataRequest>) -> ApiResult<Vec<Entity>> {
    Ok(Json(node.meta_store().get(&req.kind, &req.filters).await?))
}

async fn entity_exists_handler(State(node): State<Arc<Node>>, Query(q): Query<ExistsQuery>) -> ApiResult<bool> {
    let kind = q.kind.unwrap_or_default();
    let id = q.id.unwrap_or_default();
    Ok(Json(node.meta_store().exists(&kind, &id).await?))
}

async fn prepare_handler(State(node): State<Arc<Node>>, Json(req): Json<PrepareRequest>) -> ApiResult<PrepareResult> {
    let outcome = node.meta_store().prepare(&req.task_id, req.op, req.entity.clone()).await?;
    if matches!(outcome, ApplyOutcome::Applied | ApplyOutcome::AlreadyApplied) {
        node.journal().append_pending(req.term, req.task_id, req.op, req.entity).await?;
    }
    Ok(Json(PrepareResult {
        success: matches!(outcome, ApplyOutcome::Applied | ApplyOutcome::AlreadyApplied),
        outcome,
    }))
}

async fn commit_handler(State(node): State<Arc<Node>>, Json(req): Json<TaskIdRequest>) -> ApiResult<bool> {
    let committed = node.meta_store().commit(&req.task_id).await?;
    let marked = node.journal().mark_completed(&req.task_id).await?;
    Ok(Json(committed && marked))
}

async fn rollback_handler(State(node): State<Arc<Node>>, Json(req): Json<TaskIdRequest>) -> ApiResult<bool> {
    Ok(Json(node.meta_store().rollback(&req.task_id).await?))
}

async fn journal_dump_handler(State(node): State<Arc<Node>>) -> Json<JournalDump> {
    Json(node.journal().dump().await)
}

async fn journal_restore_handler(State(node): State<Arc<Node>>, Json(dump): Json<JournalDump>) -> ApiResult<()> {
    node.journal().restore_from_dump(dump).await?;
    Ok(Json(()))
}

async fn journal_delete_handler(State(node): State<Arc<Node>>, Json(_): Json<EmptyRequest>) -> ApiResult<()> {
    node.journal().delete_file().await?;
    Ok(Json(()))
}

async fn full_dump_handler(State(node): State<Arc<Node>>) -> ApiResult<Vec<Entity>> {
    Ok(Json(node.meta_store().dump().await?))
}

async fn restore_handler(State(node): State<Arc<Node>>, Json(entities): Json<Vec<Entity>>) -> ApiResult<()> {
    node.meta_store().restore(entities).await?;
    Ok(Json(()))
}

async fn list_files_handler(State(node): State<Arc<Node>>) -> ApiResult<Vec<String>> {
    Ok(Json(node.range_store().list_filenames().await?))
}

async fn range_exists_handler(State(node): State<Arc<Node>>, Query(q): Query<FilenameQuery>) -> ApiResult<bool> {
    Ok(Json(node.range_store().exists(&q.filename).await?))
}

async fn list_ranges_handler(State(node): State<Arc<Node>>, Query(q): Query<FilenameQuery>) -> ApiResult<Vec<String>> {
    let ranges = node.range_store().list_ranges(&q.filename).await?;
    Ok(Json(ranges.into_iter().map(|r| r.key()).collect()))
}

async fn create_range_handler(State(node): State<Arc<Node>>, Json(req): Json<CreateRangeRequest>) -> ApiResult<()> {
    let range = ChunkRange::parse_key(&req.range_key).ok_or_else(|| ChorusError::NotFound {
        what: format!("malformed range key {}", req.range_key),
    })?;
    node.range_store().put(&req.filename, range, &req.bytes).await?;
    Ok(Json(()))
}

async fn get_range_handler(State(node): State<Arc<Node>>, Query(q): Query<ChunkRangeQuery>) -> ApiResult<Vec<u8>> {
    let range = ChunkRange::parse_key(&q.range_key).ok_or_else(|| ChorusError::NotFound {
        what: format!("malformed range key {}", q.range_key),
    })?;
    Ok(Json(node.range_store().get(&q.filename, range).await?))
}

async fn delete_range_handler(State(node): State<Arc<Node>>, Json(req): Json<RangeKeyRequest>) -> ApiResult<bool> {
    let range = ChunkRange::parse_key(&req.range_key).ok_or_else(|| ChorusError::NotFound {
        what: format!("malformed range key {}", req.range_key),
    })?;
    Ok(Json(node.range_store().delete(&req.filename, range).await?))
}

/// Builds the full peer-facing `axum` app. A deployment binds this to
/// `0.0.0.0:<config.port>` alongside `Node::start` (see `main.rs`).
pub fn router(node: Arc<Node>) -> Router {
    Router::new()
        .route("/raft/request_vote", post(request_vote_handler))
        .route("/raft/append_entries", post(append_entries_handler))
        .route("/meta/get", post(get_data_handler))
        .route("/meta/exists", get(entity_exists_handler))
        .route("/meta/prepare", post(prepare_handler))
        .route("/meta/commit", post(commit_handler))
        .route("/meta/rollback", post(rollback_handler))
        .route("/meta/full_dump", get(full_dump_handler))
        .route("/meta/restore", post(restore_handler))
        .route("/journal/dump", get(journal_dump_handler))
        .route("/journal/restore", post(journal_restore_handler))
        .route("/journal/delete", post(journal_delete_handler))
        .route("/ranges/list_files", get(list_files_handler))
        .route("/ranges/exists", get(range_exists_handler))
        .route("/ranges/list_ranges", get(list_ranges_handler))
        .route("/ranges/create", post(create_range_handler))
        .route("/ranges/get", get(get_range_handler))
        .route("/ranges/delete", post(delete_range_handler))
        .with_state(node)
}
