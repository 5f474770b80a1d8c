use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    config::Config,
    confirmation::FlowSignal,
    permissions::Requester,
    profile::{
        service::{
            DeletionOutcome, DeletionStatus, PendingDeletion, ProfileError, ProfileService,
        },
        types::Profile,
    },
};

pub const REQUESTER_ID_HEADER: &str = "x-requester-id";
pub const REQUESTER_ADMIN_HEADER: &str = "x-requester-admin";

#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    profiles: Arc<ProfileService>,
    started_at: chrono::DateTime<Utc>,
}

impl AppState {
    #[must_use]
    pub fn new(config: Config, profiles: Arc<ProfileService>) -> Self {
        Self {
            config: Arc::new(config),
            profiles,
            started_at: Utc::now(),
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: String,
    build_sha: String,
    uptime_seconds: i64,
    store: &'static str,
    pending_confirmations: usize,
}

#[derive(Debug, Deserialize)]
struct CreateProfileRequest {
    first_name: String,
    surname: String,
}

#[derive(Debug, Default, Deserialize)]
struct DeleteProfileRequest {
    #[serde(default)]
    uuid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProfileQuery {
    #[serde(default)]
    uuid: Option<String>,
}

#[derive(Debug, Serialize)]
struct ProfileResponse {
    profile: Profile,
    display_name: String,
}

impl From<Profile> for ProfileResponse {
    fn from(profile: Profile) -> Self {
        Self {
            display_name: profile.display_name(),
            profile,
        }
    }
}

#[derive(Debug, Serialize)]
struct ProfilesListResponse {
    total: usize,
    profiles: Vec<Profile>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/v1/profiles", get(list_profiles).post(create_profile))
        .route("/v1/profile", get(show_profile))
        .route("/v1/profiles/deletions", post(request_profile_deletion))
        .route("/v1/deletions/:flow_id", get(deletion_status))
        .route("/v1/deletions/:flow_id/confirm", post(confirm_deletion))
        .route("/v1/deletions/:flow_id/cancel", post(cancel_deletion))
        .route("/v1/dump", post(dump_profiles))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime_seconds = (Utc::now() - state.started_at).num_seconds();
    Json(HealthResponse {
        status: "ok",
        service: state.config.service_name.clone(),
        build_sha: state.config.build_sha.clone(),
        uptime_seconds,
        store: state.profiles.store_backend(),
        pending_confirmations: state.profiles.confirmations().pending_count().await,
    })
}

async fn create_profile(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateProfileRequest>,
) -> Result<(StatusCode, Json<ProfileResponse>), ApiError> {
    let requester = authorize(&state, &headers)?;
    let profile = state
        .profiles
        .create_profile(&requester.id, &body.first_name, &body.surname)
        .await
        .map_err(ApiError::from_profile)?;
    Ok((StatusCode::CREATED, Json(profile.into())))
}

async fn list_profiles(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ProfilesListResponse>, ApiError> {
    let requester = authorize(&state, &headers)?;
    let profiles = state
        .profiles
        .list_profiles(requester.is_admin)
        .await
        .map_err(ApiError::from_profile)?;
    Ok(Json(ProfilesListResponse {
        total: profiles.len(),
        profiles,
    }))
}

async fn show_profile(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ProfileQuery>,
) -> Result<Json<ProfileResponse>, ApiError> {
    let requester = authorize(&state, &headers)?;
    let profile = state
        .profiles
        .show_profile(&requester.id, query.uuid.as_deref())
        .await
        .map_err(ApiError::from_profile)?;
    Ok(Json(profile.into()))
}

async fn request_profile_deletion(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<Json<DeleteProfileRequest>>,
) -> Result<(StatusCode, Json<PendingDeletion>), ApiError> {
    let requester = authorize(&state, &headers)?;
    let body = body.map(|Json(body)| body).unwrap_or_default();
    let pending = state
        .profiles
        .delete_profile(&requester, body.uuid.as_deref())
        .await
        .map_err(ApiError::from_profile)?;
    Ok((StatusCode::ACCEPTED, Json(pending)))
}

async fn deletion_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(flow_id): Path<Uuid>,
) -> Result<Json<DeletionStatus>, ApiError> {
    let requester = authorize(&state, &headers)?;
    let status = state
        .profiles
        .deletion_status(&requester, flow_id)
        .await
        .map_err(ApiError::from_profile)?;
    Ok(Json(status))
}

async fn confirm_deletion(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(flow_id): Path<Uuid>,
) -> Result<Json<DeletionOutcome>, ApiError> {
    resolve_deletion(&state, &headers, flow_id, FlowSignal::Confirm).await
}

async fn cancel_deletion(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(flow_id): Path<Uuid>,
) -> Result<Json<DeletionOutcome>, ApiError> {
    resolve_deletion(&state, &headers, flow_id, FlowSignal::Cancel).await
}

async fn resolve_deletion(
    state: &AppState,
    headers: &HeaderMap,
    flow_id: Uuid,
    signal: FlowSignal,
) -> Result<Json<DeletionOutcome>, ApiError> {
    let requester = authorize(state, headers)?;
    let outcome = state
        .profiles
        .resolve_deletion(&requester, flow_id, signal)
        .await
        .map_err(ApiError::from_profile)?;
    Ok(Json(outcome))
}

async fn dump_profiles(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let requester = authorize(&state, &headers)?;
    let artifact = state
        .profiles
        .dump(&requester)
        .await
        .map_err(ApiError::from_profile)?;
    let disposition = format!("attachment; filename=\"{}\"", artifact.file_name);
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/sql".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        artifact.contents,
    ))
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<Requester, ApiError> {
    if let Some(expected) = state.config.internal_token.as_deref() {
        let presented = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim);
        if presented != Some(expected) {
            return Err(ApiError::Unauthorized(
                "missing or invalid internal token".to_string(),
            ));
        }
    }
    requester_from_headers(headers)
}

fn requester_from_headers(headers: &HeaderMap) -> Result<Requester, ApiError> {
    let id = headers
        .get(REQUESTER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ApiError::InvalidRequest(format!("{REQUESTER_ID_HEADER} is required")))?;
    let is_admin = match headers.get(REQUESTER_ADMIN_HEADER) {
        None => false,
        Some(value) => parse_admin_flag(value.to_str().unwrap_or_default()).ok_or_else(|| {
            ApiError::InvalidRequest(format!("{REQUESTER_ADMIN_HEADER} must be true or false"))
        })?,
    };
    Ok(Requester {
        id: id.to_string(),
        is_admin,
    })
}

fn parse_admin_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" | "" => Some(false),
        _ => None,
    }
}

#[derive(Debug)]
enum ApiError {
    Unauthorized(String),
    InvalidRequest(String),
    Profile(ProfileError),
}

impl ApiError {
    fn from_profile(error: ProfileError) -> Self {
        Self::Profile(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        match self {
            Self::Unauthorized(message) => (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({
                    "error": "unauthorized",
                    "message": message,
                })),
            )
                .into_response(),
            Self::InvalidRequest(message) => (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "error": "invalid_request",
                    "message": message,
                })),
            )
                .into_response(),
            Self::Profile(error) => {
                let status = match &error {
                    ProfileError::AlreadyExists => StatusCode::CONFLICT,
                    ProfileError::NotFound => StatusCode::NOT_FOUND,
                    ProfileError::Forbidden(_) => StatusCode::FORBIDDEN,
                    ProfileError::FlowExpired { .. } => StatusCode::GONE,
                    ProfileError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
                    ProfileError::StorageFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                let mut body = serde_json::json!({
                    "error": error.code(),
                    "message": error.message(),
                });
                if let ProfileError::FlowExpired { state: Some(state) } = &error {
                    body["state"] = serde_json::Value::from(state.as_str());
                }
                (status, Json(body)).into_response()
            }
        }
    }
}
