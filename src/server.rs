use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::access::{AccessControl, Permission, Role};
use crate::config::ServerConfig;
use crate::document::Cursor;
use crate::error::{AccessError, RepositoryError};
use crate::repository::DocumentRepository;
use crate::schema::Schema;
use crate::transport::{ChangesResponse, OpenResponse, SaveRequest, SaveResponse};

pub struct AppState {
    pub repository: Arc<DocumentRepository>,
    pub access: AccessControl,
}

impl AppState {
    pub fn new(repository: Arc<DocumentRepository>) -> Self {
        AppState {
            repository,
            access: AccessControl::new(),
        }
    }
}

#[derive(Deserialize)]
pub struct CreateRequest {
    #[serde(default)]
    pub document_id: Option<String>,
    pub schema: Schema,
    /// Name recorded as last editor for the owner's saves.
    #[serde(default = "default_owner")]
    pub owner: String,
}

fn default_owner() -> String {
    "owner".to_string()
}

#[derive(Serialize, Deserialize)]
pub struct CreateResponse {
    pub document_id: String,
    pub owner_token: String,
    pub cursor: Cursor,
}

#[derive(Deserialize)]
struct ChangesQuery {
    #[serde(default)]
    since: i64,
}

#[derive(Deserialize)]
pub struct InviteRequest {
    #[serde(default = "default_role")]
    pub role: Role,
    pub label: String,
    #[serde(default)]
    pub ttl_secs: Option<i64>,
}

fn default_role() -> Role {
    Role::Collaborator
}

#[derive(Serialize, Deserialize)]
pub struct InviteResponse {
    pub token: String,
}

/// Failure of a request, rendered as a status code plus a plain message.
#[derive(Debug)]
pub enum ApiError {
    Access(AccessError),
    Repository(RepositoryError),
}

impl From<AccessError> for ApiError {
    fn from(err: AccessError) -> Self {
        ApiError::Access(err)
    }
}

impl From<RepositoryError> for ApiError {
    fn from(err: RepositoryError) -> Self {
        ApiError::Repository(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Access(err) => (StatusCode::FORBIDDEN, err.to_string()),
            ApiError::Repository(err) => {
                let status = match &err {
                    RepositoryError::NotFound(_) => StatusCode::NOT_FOUND,
                    RepositoryError::AlreadyExists(_) => StatusCode::CONFLICT,
                    RepositoryError::Invalid(_) => StatusCode::BAD_REQUEST,
                    RepositoryError::Storage(e) => {
                        log::error!("storage failure: {}", e);
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                (status, err.to_string())
            }
        };
        (status, message).into_response()
    }
}

/// Routes of the document server, without binding a socket.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/documents", post(create_document))
        .route("/api/documents/:id", get(open_document))
        .route("/api/documents/:id/changes", get(get_changes))
        .route("/api/save", post(save_document))
        .route("/api/documents/:id/invites", post(create_invite))
        .route("/api/documents/:id/invites/:token", delete(revoke_invite))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run(config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let repository = match &config.data_dir {
        Some(dir) => DocumentRepository::open_dir(dir)?,
        None => DocumentRepository::in_memory(),
    };
    let state = Arc::new(AppState::new(Arc::new(repository)));

    let listener = TcpListener::bind(&config.bind).await?;
    log::info!("listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

async fn create_document(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateRequest>,
) -> Result<(StatusCode, Json<CreateResponse>), ApiError> {
    let document_id = request
        .document_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let cursor = state.repository.create(&document_id, request.schema, &request.owner)?;
    let owner_token = state.access.grant_owner(&document_id, &request.owner);
    log::info!("created document {} for {}", document_id, request.owner);
    Ok((
        StatusCode::CREATED,
        Json(CreateResponse {
            document_id,
            owner_token,
            cursor,
        }),
    ))
}

async fn open_document(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<OpenResponse>, ApiError> {
    state.access.check(bearer(&headers), &id, Permission::Read)?;
    let (document, cursor) = state.repository.open(&id)?;
    Ok(Json(OpenResponse { document, cursor }))
}

async fn get_changes(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<ChangesQuery>,
    headers: HeaderMap,
) -> Result<Json<ChangesResponse>, ApiError> {
    state.access.check(bearer(&headers), &id, Permission::Read)?;
    Ok(Json(state.repository.changes_since(&id, Cursor(query.since))?))
}

async fn save_document(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<SaveRequest>,
) -> Result<Json<SaveResponse>, ApiError> {
    let grant = state
        .access
        .check(bearer(&headers), &request.document_id, Permission::Write)?;
    let timestamp = state.repository.save(request, &grant.label)?;
    Ok(Json(SaveResponse { timestamp }))
}

async fn create_invite(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<InviteRequest>,
) -> Result<(StatusCode, Json<InviteResponse>), ApiError> {
    let owner = bearer(&headers);
    state.access.check(owner, &id, Permission::Share)?;
    state.repository.open(&id)?;
    let ttl = request.ttl_secs.map(chrono::Duration::seconds);
    let token = state.access.invite(owner, &id, request.role, &request.label, ttl)?;
    log::info!("invited {} to {} as {:?}", request.label, id, request.role);
    Ok((StatusCode::CREATED, Json(InviteResponse { token })))
}

async fn revoke_invite(
    State(state): State<Arc<AppState>>,
    Path((id, token)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    if state.access.revoke(bearer(&headers), &id, &token)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Ok(StatusCode::NOT_FOUND)
    }
}
