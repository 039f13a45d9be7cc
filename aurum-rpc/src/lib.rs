pub mod ws;

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use aurum_chain::{
    ChainError, ChainStore, IngestOutcome, Mempool, MempoolError, NodeEvent,
};
use aurum_core::error::ValidationError;
use aurum_core::params::now_ts;
use aurum_core::transaction::Transaction;
use aurum_core::Block;
use aurum_spv::LightClientService;
use aurum_sync::{ChunkedSyncService, SyncDownloader};

/// Everything a request handler may touch. Handlers translate between the
/// wire and exactly one core operation; no business logic lives here.
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<ChainStore>,
    pub mempool: Arc<Mempool>,
    pub spv: Arc<LightClientService>,
    pub sync: Arc<ChunkedSyncService>,
    pub downloader: Arc<SyncDownloader>,
    pub events: broadcast::Sender<NodeEvent>,
}

/// Coded error envelope: `{"error": {code, message, details?}}`.
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<Value>,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self { status, code, message: message.into(), details: None }
    }

    fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    fn not_found(what: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", what)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "error": {
                "code": self.code,
                "message": self.message,
            }
        });
        if let Some(details) = self.details {
            body["error"]["details"] = details;
        }
        (self.status, Json(body)).into_response()
    }
}

impl From<MempoolError> for ApiError {
    fn from(e: MempoolError) -> Self {
        match e {
            MempoolError::Banned { retry_after } => Self::new(
                StatusCode::TOO_MANY_REQUESTS,
                "RATE_LIMITED",
                e.to_string(),
            )
            .with_details(json!({ "retry_after": retry_after })),
            MempoolError::Invalid(ValidationError::InsufficientFunds(_)) => Self::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                "INSUFFICIENT_BALANCE",
                e.to_string(),
            ),
            MempoolError::Invalid(_) => Self::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                "VALIDATION_ERROR",
                e.to_string(),
            ),
            _ => Self::new(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", e.to_string()),
        }
    }
}

impl From<ChainError> for ApiError {
    fn from(e: ChainError) -> Self {
        match e {
            ChainError::FatalState(_) => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", e.to_string())
            }
            _ => Self::new(StatusCode::UNPROCESSABLE_ENTITY, "VALIDATION_ERROR", e.to_string()),
        }
    }
}

impl From<aurum_sync::SyncError> for ApiError {
    fn from(e: aurum_sync::SyncError) -> Self {
        match e {
            aurum_sync::SyncError::NotFound(what) => Self::not_found(what),
            _ => Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", e.to_string()),
        }
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/tx", post(submit_tx))
        .route("/blocks", post(ingest_block))
        .route("/blocks/:height", get(get_block))
        .route("/headers", get(get_headers))
        .route("/proof/:txid", get(get_proof))
        .route("/balance/:address", get(get_balance))
        .route("/mempool", get(mempool_overview))
        .route("/sync/snapshot/latest", get(latest_snapshot))
        .route("/sync/snapshot/:id/chunk/:index", get(download_chunk))
        .route("/sync/snapshot/resume", post(resume_snapshot))
        .route("/sync/progress", get(sync_progress))
        .route("/ws", get(ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until the process exits.
pub async fn serve(addr: std::net::SocketAddr, state: ApiState) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("REST listening on {addr}");
    axum::serve(listener, router(state)).await
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn stats(State(state): State<ApiState>) -> Json<Value> {
    Json(json!({
        "chain": state.store.stats(),
        "mempool": state.mempool.stats(),
    }))
}

async fn submit_tx(
    State(state): State<ApiState>,
    Json(tx): Json<Transaction>,
) -> Result<Response, ApiError> {
    let txid = tx.txid.clone().unwrap_or_default();
    let fee_rate = tx.fee_rate();
    let sender = tx.sender.clone();
    let verdict = state
        .store
        .with_utxo(|utxo| state.mempool.add_transaction(tx, utxo, now_ts()));
    match verdict {
        Ok(()) => {
            let _ = state.events.send(NodeEvent::NewTx { txid: txid.clone(), sender, fee_rate });
            Ok(Json(json!({ "status": "accepted", "txid": txid })).into_response())
        }
        Err(MempoolError::Orphaned) => Ok((
            StatusCode::ACCEPTED,
            Json(json!({ "status": "orphaned", "txid": txid })),
        )
            .into_response()),
        Err(e) => Err(e.into()),
    }
}

async fn ingest_block(
    State(state): State<ApiState>,
    Json(block): Json<Block>,
) -> Result<Json<Value>, ApiError> {
    let outcome = state.store.ingest(block, &state.mempool)?;
    let outcome = match outcome {
        IngestOutcome::Appended => "appended",
        IngestOutcome::SideChained => "side_chained",
        IngestOutcome::Reorged { .. } => "reorged",
        IngestOutcome::Ignored => "ignored",
    };
    Ok(Json(json!({ "outcome": outcome })))
}

async fn get_block(
    State(state): State<ApiState>,
    Path(height): Path<u64>,
) -> Result<Json<Block>, ApiError> {
    state
        .store
        .get_block(height)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("no block at height {height}")))
}

#[derive(Deserialize)]
struct HeadersQuery {
    from: Option<u64>,
    count: Option<u64>,
}

async fn get_headers(
    State(state): State<ApiState>,
    Query(query): Query<HeadersQuery>,
) -> Json<aurum_spv::HeadersPage> {
    Json(state.spv.recent_headers(query.count.unwrap_or(20), query.from))
}

async fn get_proof(
    State(state): State<ApiState>,
    Path(txid): Path<String>,
) -> Result<Json<aurum_spv::TransactionProof>, ApiError> {
    state
        .spv
        .transaction_proof(&txid)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("transaction {txid} not on chain")))
}

async fn get_balance(
    State(state): State<ApiState>,
    Path(address): Path<String>,
) -> Json<Value> {
    Json(json!({
        "address": address,
        "balance": state.store.balance(&address),
    }))
}

async fn mempool_overview(State(state): State<ApiState>) -> Json<Value> {
    Json(state.mempool.overview(100))
}

async fn latest_snapshot(
    State(state): State<ApiState>,
) -> Result<Json<aurum_sync::SnapshotManifest>, ApiError> {
    state
        .sync
        .latest_manifest()?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("no snapshot available"))
}

/// Serve one chunk's raw bytes. Supports `Range: bytes=start-end` for
/// partial refetch; integrity metadata rides in `X-Chunk-*` headers.
async fn download_chunk(
    State(state): State<ApiState>,
    Path((id, index)): Path<(String, u32)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let chunk = state
        .sync
        .chunk(&id, index)?
        .ok_or_else(|| ApiError::not_found(format!("chunk {index} of snapshot {id}")))?;
    let total = chunk.data.len() as u64;

    let mut response_headers = HeaderMap::new();
    let insert = |headers: &mut HeaderMap, name: &'static str, value: String| {
        if let Ok(value) = value.parse() {
            headers.insert(name, value);
        }
    };
    insert(&mut response_headers, "x-chunk-index", chunk.chunk_index.to_string());
    insert(&mut response_headers, "x-total-chunks", chunk.total_chunks.to_string());
    insert(&mut response_headers, "x-chunk-checksum", chunk.checksum.clone());
    insert(&mut response_headers, "x-compressed", chunk.compressed.to_string());
    insert(
        &mut response_headers,
        "x-chunk-priority",
        format!("{:?}", chunk.priority).to_lowercase(),
    );
    insert(&mut response_headers, "accept-ranges", "bytes".to_string());

    if let Some(range) = headers.get(header::RANGE).and_then(|v| v.to_str().ok()) {
        let Some((start, end)) = parse_range(range, total) else {
            insert(
                &mut response_headers,
                "content-range",
                format!("bytes */{total}"),
            );
            return Ok((StatusCode::RANGE_NOT_SATISFIABLE, response_headers).into_response());
        };
        insert(
            &mut response_headers,
            "content-range",
            format!("bytes {start}-{end}/{total}"),
        );
        let body = chunk.data[start as usize..=end as usize].to_vec();
        return Ok((StatusCode::PARTIAL_CONTENT, response_headers, body).into_response());
    }

    Ok((StatusCode::OK, response_headers, chunk.data).into_response())
}

/// Parse `bytes=start-end` (end optional) against a body of `total` bytes.
fn parse_range(raw: &str, total: u64) -> Option<(u64, u64)> {
    let bounds = raw.strip_prefix("bytes=")?;
    let (start, end) = bounds.split_once('-')?;
    let start: u64 = start.parse().ok()?;
    let end: u64 = if end.is_empty() {
        total.checked_sub(1)?
    } else {
        end.parse().ok()?
    };
    if start > end || end >= total {
        return None;
    }
    Some((start, end))
}

#[derive(Deserialize)]
struct ResumeRequest {
    snapshot_id: String,
}

async fn resume_snapshot(
    State(state): State<ApiState>,
    Json(request): Json<ResumeRequest>,
) -> Result<Json<aurum_sync::SyncProgressRecord>, ApiError> {
    state
        .sync
        .load_progress(&request.snapshot_id)?
        .map(Json)
        .ok_or_else(|| {
            ApiError::not_found(format!("no progress for snapshot {}", request.snapshot_id))
        })
}

async fn sync_progress(State(state): State<ApiState>) -> Json<Value> {
    Json(json!({
        "download_state": state.downloader.state(),
        "headers": state.spv.sync_progress(now_ts()),
    }))
}
