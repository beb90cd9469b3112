use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use media::{ImageOptimizer, UploadEvent, PRODUCT_IMAGE_PREFIX};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use server_api::ApiContext;
use shared::{
    domain::{DocumentId, Role, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        ClientRequest, DocumentRef, MediaUploadResponse, PutDocumentResponse, QueryTarget,
        ReferralCodeResponse, ServerEvent,
    },
};
use storage::Storage;
use tokio::sync::broadcast;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

mod config;

use config::{load_settings, prepare_database_url};

const MEDIA_BUCKET: &str = "media";
const MAX_OBJECT_PATH_BYTES: usize = 512;

#[derive(Clone)]
struct AppState {
    api: ApiContext,
    changes: broadcast::Sender<ChangeNotice>,
    optimizer: Arc<ImageOptimizer>,
    max_upload_bytes: usize,
}

/// Fan-out signal: something in `collection` changed, re-run live queries
/// bound to it.
#[derive(Debug, Clone)]
struct ChangeNotice {
    collection: String,
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    role: Role,
}

#[derive(Debug, Serialize)]
struct LoginResponse {
    user_id: i64,
}

#[derive(Debug, Deserialize)]
struct AuthQuery {
    user_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct PutDocumentBody {
    #[serde(default)]
    doc_id: Option<String>,
    fields: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct MediaUploadQuery {
    user_id: Option<i64>,
    path: String,
    content_type: Option<String>,
}

#[derive(Debug, Serialize)]
struct DeleteDocumentResponse {
    deleted: bool,
}

#[derive(Debug, Serialize)]
struct ResolveReferralResponse {
    user_id: i64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let (changes, _) = broadcast::channel(256);
    let state = AppState {
        api: ApiContext { storage },
        changes,
        optimizer: Arc::new(ImageOptimizer::new()),
        max_upload_bytes: settings.media_max_upload_bytes,
    };
    let app = build_router(Arc::new(state), settings.media_max_upload_bytes);

    let addr: SocketAddr = settings.bind_addr.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/login", post(login))
        .route("/collections/:collection", post(http_put_document))
        .route(
            "/collections/:collection/:doc_id",
            get(http_get_document).delete(http_delete_document),
        )
        .route("/query", post(http_run_query))
        .route("/media/upload", post(upload_media))
        .route("/media/:bucket/*path", get(download_media))
        .route("/referrals", post(http_mint_referral))
        .route("/referrals/:code", get(http_resolve_referral))
        .route("/ws", get(ws_handler))
        // Body slack over the media cap so JSON routes never hit the layer
        // before their own validation does.
        .layer(RequestBodyLimitLayer::new(max_upload_bytes + 64 * 1024))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

type HandlerError = (StatusCode, Json<ApiError>);

fn api_error(error: ApiError) -> HandlerError {
    let status = match error.code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(error))
}

fn internal(error: anyhow::Error) -> HandlerError {
    api_error(ApiError::new(ErrorCode::Internal, error.to_string()))
}

async fn resolve_role(state: &AppState, user_id: Option<i64>) -> Result<Option<Role>, HandlerError> {
    let Some(user_id) = user_id else {
        return Ok(None);
    };
    state
        .api
        .storage
        .role_for_user(UserId(user_id))
        .await
        .map_err(internal)
}

fn notify_change(state: &AppState, collection: &str) {
    // Nobody subscribed is fine; ignore the send result.
    let _ = state.changes.send(ChangeNotice {
        collection: collection.to_string(),
    });
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, HandlerError> {
    let user_id = state
        .api
        .storage
        .create_user(&req.username, req.role)
        .await
        .map_err(|e| api_error(ApiError::new(ErrorCode::Validation, e.to_string())))?;
    Ok(Json(LoginResponse { user_id: user_id.0 }))
}

async fn http_put_document(
    State(state): State<Arc<AppState>>,
    Path(collection): Path<String>,
    Query(q): Query<AuthQuery>,
    Json(body): Json<PutDocumentBody>,
) -> Result<Json<PutDocumentResponse>, HandlerError> {
    let role = resolve_role(&state, q.user_id).await?;
    let doc_id = server_api::put_document(
        &state.api,
        role,
        &collection,
        body.doc_id.map(DocumentId),
        body.fields,
    )
    .await
    .map_err(api_error)?;
    notify_change(&state, &collection);
    Ok(Json(PutDocumentResponse { doc_id }))
}

async fn http_get_document(
    State(state): State<Arc<AppState>>,
    Path((collection, doc_id)): Path<(String, String)>,
    Query(q): Query<AuthQuery>,
) -> Result<Json<shared::protocol::DocumentRecord>, HandlerError> {
    let role = resolve_role(&state, q.user_id).await?;
    let record = server_api::get_document(&state.api, role, &DocumentRef::new(&collection, &doc_id))
        .await
        .map_err(api_error)?
        .ok_or_else(|| {
            api_error(ApiError::new(
                ErrorCode::NotFound,
                format!("document {collection}/{doc_id} not found"),
            ))
        })?;
    Ok(Json(record))
}

async fn http_delete_document(
    State(state): State<Arc<AppState>>,
    Path((collection, doc_id)): Path<(String, String)>,
    Query(q): Query<AuthQuery>,
) -> Result<Json<DeleteDocumentResponse>, HandlerError> {
    let role = resolve_role(&state, q.user_id).await?;
    let deleted =
        server_api::delete_document(&state.api, role, &DocumentRef::new(&collection, &doc_id))
            .await
            .map_err(api_error)?;
    if deleted {
        notify_change(&state, &collection);
    }
    Ok(Json(DeleteDocumentResponse { deleted }))
}

async fn http_run_query(
    State(state): State<Arc<AppState>>,
    Query(q): Query<AuthQuery>,
    Json(query): Json<shared::protocol::Query>,
) -> Result<Json<Vec<shared::protocol::DocumentRecord>>, HandlerError> {
    let role = resolve_role(&state, q.user_id).await?;
    let records = server_api::run_query(&state.api, role, &query)
        .await
        .map_err(api_error)?;
    Ok(Json(records))
}

fn can_upload_media(role: Option<Role>) -> bool {
    matches!(role, Some(Role::Seller) | Some(Role::Admin))
}

fn validate_object_path(path: &str) -> Result<(), ApiError> {
    let invalid = |message: &str| ApiError::new(ErrorCode::Validation, message);
    if path.is_empty() {
        return Err(invalid("object path cannot be empty"));
    }
    if path.len() > MAX_OBJECT_PATH_BYTES {
        return Err(invalid("object path is too long"));
    }
    if path.starts_with('/') || path.ends_with('/') || path.contains('\\') {
        return Err(invalid("object path must be a relative, forward-slash path"));
    }
    if path.split('/').any(|segment| segment.is_empty() || segment == "..") {
        return Err(invalid("object path must not contain empty or '..' segments"));
    }
    Ok(())
}

async fn upload_media(
    State(state): State<Arc<AppState>>,
    Query(q): Query<MediaUploadQuery>,
    body: Bytes,
) -> Result<Json<MediaUploadResponse>, HandlerError> {
    if body.is_empty() {
        return Err(api_error(ApiError::new(
            ErrorCode::Validation,
            "upload body cannot be empty",
        )));
    }
    if body.len() > state.max_upload_bytes {
        return Err((
            StatusCode::PAYLOAD_TOO_LARGE,
            Json(ApiError::new(
                ErrorCode::Validation,
                format!("upload exceeds {} bytes", state.max_upload_bytes),
            )),
        ));
    }
    validate_object_path(&q.path).map_err(api_error)?;

    let role = resolve_role(&state, q.user_id).await?;
    if !can_upload_media(role) {
        return Err(api_error(ApiError::new(
            ErrorCode::Forbidden,
            "only sellers and admins may upload media",
        )));
    }

    let mut custom_metadata = HashMap::new();
    if let Some(user_id) = q.user_id {
        custom_metadata.insert("uploader".to_string(), user_id.to_string());
    }

    state
        .api
        .storage
        .put_media_object(
            MEDIA_BUCKET,
            &q.path,
            &body,
            q.content_type.as_deref(),
            &custom_metadata,
        )
        .await
        .map_err(internal)?;

    // The landing of an object under the product prefix is what triggers the
    // optimize job; each upload gets its own isolated invocation.
    if q.path.starts_with(PRODUCT_IMAGE_PREFIX) {
        let storage = state.api.storage.clone();
        let optimizer = Arc::clone(&state.optimizer);
        let event = UploadEvent {
            bucket: MEDIA_BUCKET.to_string(),
            path: q.path.clone(),
            content_type: q.content_type.clone(),
            custom_metadata,
        };
        tokio::spawn(async move {
            optimizer.process(&storage, &event).await;
        });
    }

    Ok(Json(MediaUploadResponse {
        bucket: MEDIA_BUCKET.to_string(),
        path: q.path,
        size_bytes: body.len() as u64,
    }))
}

async fn download_media(
    State(state): State<Arc<AppState>>,
    Path((bucket, path)): Path<(String, String)>,
) -> Result<impl IntoResponse, HandlerError> {
    let object = state
        .api
        .storage
        .get_media_object(&bucket, &path)
        .await
        .map_err(internal)?
        .ok_or_else(|| {
            api_error(ApiError::new(
                ErrorCode::NotFound,
                format!("object {bucket}/{path} not found"),
            ))
        })?;

    let content_type = object
        .content_type
        .unwrap_or_else(|| "application/octet-stream".to_string());
    Ok(([(header::CONTENT_TYPE, content_type)], object.bytes))
}

async fn http_mint_referral(
    State(state): State<Arc<AppState>>,
    Query(q): Query<AuthQuery>,
) -> Result<Json<ReferralCodeResponse>, HandlerError> {
    let role = resolve_role(&state, q.user_id).await?;
    if !matches!(role, Some(Role::Affiliate) | Some(Role::Admin)) {
        return Err(api_error(ApiError::new(
            ErrorCode::Forbidden,
            "only affiliates and admins may mint referral codes",
        )));
    }
    let user_id = q.user_id.ok_or_else(|| {
        api_error(ApiError::new(ErrorCode::Unauthorized, "user_id is required"))
    })?;
    Ok(Json(ReferralCodeResponse {
        referral_code: server_api::mint_referral_code(UserId(user_id)),
    }))
}

async fn http_resolve_referral(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> Result<Json<ResolveReferralResponse>, HandlerError> {
    let user_id = server_api::resolve_referral_code(&code).map_err(api_error)?;
    let known = state
        .api
        .storage
        .username_for_user(user_id)
        .await
        .map_err(internal)?
        .is_some();
    if !known {
        return Err(api_error(ApiError::new(
            ErrorCode::NotFound,
            "referral code does not name a known user",
        )));
    }
    Ok(Json(ResolveReferralResponse { user_id: user_id.0 }))
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    user_id: Option<i64>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<WsQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(state, socket, q.user_id))
}

/// One task per socket: subscriptions live in a local map, every change
/// notice re-runs the affected queries and pushes the whole snapshot.
async fn ws_connection(state: Arc<AppState>, socket: WebSocket, user_id: Option<i64>) {
    let role = match resolve_role(&state, user_id).await {
        Ok(role) => role,
        Err(_) => {
            warn!(?user_id, "ws: failed to resolve role; treating as anonymous");
            None
        }
    };

    let (mut sender, mut receiver) = socket.split();
    let mut changes = state.changes.subscribe();
    let mut subscriptions: HashMap<Uuid, QueryTarget> = HashMap::new();

    loop {
        tokio::select! {
            message = receiver.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        if handle_client_request(&state, role, &text, &mut subscriptions, &mut sender)
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(%err, "ws: receive failed");
                        break;
                    }
                }
            }
            change = changes.recv() => {
                match change {
                    Ok(notice) => {
                        let affected: Vec<(Uuid, QueryTarget)> = subscriptions
                            .iter()
                            .filter(|(_, target)| target.collection_name() == notice.collection)
                            .map(|(id, target)| (*id, target.clone()))
                            .collect();
                        if push_snapshots(&state, affected, &mut sender).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Missed notices; resynchronize every subscription.
                        warn!(skipped, "ws: change feed lagged; re-pushing all subscriptions");
                        let all: Vec<(Uuid, QueryTarget)> = subscriptions
                            .iter()
                            .map(|(id, target)| (*id, target.clone()))
                            .collect();
                        if push_snapshots(&state, all, &mut sender).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

async fn handle_client_request(
    state: &AppState,
    role: Option<Role>,
    text: &str,
    subscriptions: &mut HashMap<Uuid, QueryTarget>,
    sender: &mut SplitSink<WebSocket, Message>,
) -> Result<(), axum::Error> {
    match serde_json::from_str::<ClientRequest>(text) {
        Ok(ClientRequest::Subscribe {
            subscription_id,
            target,
        }) => match server_api::authorize_read(role, &target) {
            Ok(()) => match server_api::snapshot_for_target(&state.api, &target).await {
                Ok(snapshot) => {
                    subscriptions.insert(subscription_id, target);
                    send_event(
                        sender,
                        &ServerEvent::SnapshotPushed {
                            subscription_id,
                            snapshot,
                        },
                    )
                    .await
                }
                Err(error) => send_event(sender, &ServerEvent::Error(error)).await,
            },
            Err(error) => {
                send_event(
                    sender,
                    &ServerEvent::SubscriptionDenied {
                        subscription_id,
                        error,
                    },
                )
                .await
            }
        },
        Ok(ClientRequest::Unsubscribe { subscription_id }) => {
            subscriptions.remove(&subscription_id);
            Ok(())
        }
        Err(err) => {
            send_event(
                sender,
                &ServerEvent::Error(ApiError::new(
                    ErrorCode::Validation,
                    format!("invalid client request: {err}"),
                )),
            )
            .await
        }
    }
}

async fn push_snapshots(
    state: &AppState,
    targets: Vec<(Uuid, QueryTarget)>,
    sender: &mut SplitSink<WebSocket, Message>,
) -> Result<(), axum::Error> {
    for (subscription_id, target) in targets {
        match server_api::snapshot_for_target(&state.api, &target).await {
            Ok(snapshot) => {
                send_event(
                    sender,
                    &ServerEvent::SnapshotPushed {
                        subscription_id,
                        snapshot,
                    },
                )
                .await?;
            }
            Err(error) => {
                warn!(%subscription_id, %error, "ws: snapshot refresh failed");
            }
        }
    }
    Ok(())
}

async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &ServerEvent,
) -> Result<(), axum::Error> {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(_) => return Ok(()),
    };
    sender.send(Message::Text(text)).await
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
