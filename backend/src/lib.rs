use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use draw_core::{ParticipantName, Roster};
use serde::{Deserialize, Serialize};

pub mod claim;
pub mod config;
pub mod draw;
pub mod store;

pub use claim::{ClaimCoordinator, ClaimError};
pub use config::{Config, ConfigError};
pub use draw::{DrawCoordinator, DrawFailure};
pub use store::{MemoryStore, RetryPolicy, StoreError, TransactionalStore};

/// Header carrying the caller's identity token.
pub const IDENTITY_HEADER: &str = "x-identity";

#[derive(Clone)]
pub struct AppState {
    roster: Arc<Roster>,
    claims: ClaimCoordinator<MemoryStore>,
    draws: DrawCoordinator<MemoryStore>,
}

impl Default for AppState {
    fn default() -> Self {
        Self::new(
            Roster::default(),
            MemoryStore::default(),
            RetryPolicy::default(),
            None,
        )
    }
}

impl AppState {
    pub fn new(roster: Roster, store: MemoryStore, retry: RetryPolicy, draw_seed: Option<u64>) -> Self {
        let roster = Arc::new(roster);
        Self {
            claims: ClaimCoordinator::new(store.clone(), roster.clone(), retry),
            draws: DrawCoordinator::new(store, roster.clone(), retry, draw_seed),
            roster,
        }
    }

    pub async fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let roster = config.load_roster().await?;
        let store = match &config.persist_path {
            Some(path) => MemoryStore::with_persistence(path.clone()).await?,
            None => MemoryStore::default(),
        };
        Ok(Self::new(roster, store, config.retry, config.draw_seed))
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/roster", get(list_roster))
        .route("/me", get(get_me))
        .route("/claim", post(claim_name))
        .route("/draw", post(draw))
        .with_state(state)
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("identity token required")]
    MissingIdentity,
    #[error(transparent)]
    Claim(#[from] ClaimError),
    #[error(transparent)]
    Draw(#[from] DrawFailure),
}

impl ApiError {
    fn status_and_kind(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::MissingIdentity | ApiError::Claim(ClaimError::MissingIdentity) => {
                (StatusCode::UNAUTHORIZED, "missing_identity")
            }
            ApiError::Claim(ClaimError::InvalidName(_)) | ApiError::Draw(DrawFailure::InvalidName(_)) => {
                (StatusCode::BAD_REQUEST, "invalid_name")
            }
            ApiError::Claim(ClaimError::IdentityAlreadyBound { .. }) => {
                (StatusCode::CONFLICT, "identity_already_bound")
            }
            ApiError::Claim(ClaimError::NameAlreadyClaimed(_)) => {
                (StatusCode::CONFLICT, "name_already_claimed")
            }
            ApiError::Claim(ClaimError::TransientConflict { .. })
            | ApiError::Draw(DrawFailure::TransientConflict { .. }) => {
                (StatusCode::SERVICE_UNAVAILABLE, "transient_conflict")
            }
            ApiError::Draw(DrawFailure::DrawRecordMissing(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "draw_record_missing")
            }
            ApiError::Draw(DrawFailure::GenerationFailure(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "generation_failure")
            }
            ApiError::Claim(ClaimError::Store(_)) | ApiError::Draw(DrawFailure::Store(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "store")
            }
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = self.status_and_kind();
        let body = ErrorBody {
            error: kind,
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

fn identity(headers: &HeaderMap) -> Result<&str, ApiError> {
    headers
        .get(IDENTITY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(ApiError::MissingIdentity)
}

#[derive(Serialize)]
struct RosterResponse {
    names: Vec<ParticipantName>,
}

#[derive(Serialize)]
struct MeResponse {
    name: Option<ParticipantName>,
}

#[derive(Deserialize)]
struct NameRequest {
    name: String,
}

#[derive(Serialize)]
struct ClaimResponse {
    name: ParticipantName,
}

#[derive(Serialize)]
struct DrawResponse {
    name: ParticipantName,
    assigned_to: ParticipantName,
}

async fn list_roster(State(state): State<AppState>) -> Json<RosterResponse> {
    Json(RosterResponse {
        names: state
            .roster
            .display_order()
            .into_iter()
            .map(str::to_owned)
            .collect(),
    })
}

async fn get_me(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<MeResponse>, ApiError> {
    let identity = identity(&headers)?;
    let name = state.claims.claimed_name(identity).await?;
    Ok(Json(MeResponse { name }))
}

async fn claim_name(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<NameRequest>,
) -> Result<Json<ClaimResponse>, ApiError> {
    let identity = identity(&headers)?;
    let name = state.claims.claim_identity(identity, &payload.name).await?;
    Ok(Json(ClaimResponse { name }))
}

/// Claims the chosen name for the caller if needed, then returns the
/// recipient drawn for it.
async fn draw(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<NameRequest>,
) -> Result<Json<DrawResponse>, ApiError> {
    let identity = identity(&headers)?;
    let name = state.claims.claim_identity(identity, &payload.name).await?;
    let assigned_to = state.draws.ensure_drawing(&name).await?;
    Ok(Json(DrawResponse { name, assigned_to }))
}
