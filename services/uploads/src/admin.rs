//! Service-to-service operations, gated by a shared bearer secret.

use crate::api::{ApiError, AppState};
use crate::content_store::ContentStore;
use crate::error::{AuthError, Result, UploadsError};
use crate::files::File;
use crate::purge::CachePurger;
use crate::tasks::BackgroundTasks;
use crate::token::secrets_match;
use axum::extract::{Path, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{delete, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};

/// Summary returned to the service that claimed a file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimedFile {
    pub id: String,
    pub mime: String,
    pub filename: String,
    pub size: u64,
    pub width: i32,
    pub height: i32,
}

#[derive(Debug, Deserialize)]
pub struct ClaimRequest {
    pub bucket: String,
}

pub struct AdminService {
    store: Arc<ContentStore>,
    purger: Option<Arc<CachePurger>>,
    tasks: BackgroundTasks,
}

impl AdminService {
    pub fn new(
        store: Arc<ContentStore>,
        purger: Option<Arc<CachePurger>>,
        tasks: BackgroundTasks,
    ) -> Self {
        Self {
            store,
            purger,
            tasks,
        }
    }

    /// Attach a file to a durable resource. The file must live in `bucket`
    /// and must not have been claimed before.
    #[instrument(skip(self))]
    pub async fn claim_file(&self, id: &str, bucket: &str) -> Result<ClaimedFile> {
        let file = self.store.get_file(id).await?;
        if file.bucket != bucket {
            return Err(UploadsError::MismatchedBucket);
        }
        if file.claimed {
            return Err(UploadsError::AlreadyClaimed);
        }

        let size = self.store.object_size(&file).await?;
        self.store.claim(&file).await?;

        Ok(ClaimedFile {
            id: file.id,
            mime: file.mime,
            filename: file.filename,
            size,
            width: file.width,
            height: file.height,
        })
    }

    /// Delete a file and evict its public URLs from the CDN
    #[instrument(skip(self))]
    pub async fn delete_file(&self, id: &str) -> Result<()> {
        let file = self.store.get_file(id).await?;
        if !self.store.delete(&file).await? {
            return Err(UploadsError::NotFound);
        }

        if let Some(purger) = &self.purger {
            self.spawn_purge(purger.clone(), file);
        }
        Ok(())
    }

    fn spawn_purge(&self, purger: Arc<CachePurger>, file: File) {
        self.tasks
            .spawn("cache_purge", async move { purger.purge(&file).await });
    }

    /// Release every file a user uploaded. Deletion happens on the next sweep.
    #[instrument(skip(self))]
    pub async fn clear_files(&self, user_id: &str) -> Result<u64> {
        let unclaimed = self.store.unclaim_uploader(user_id).await?;
        info!(user_id = %user_id, unclaimed = unclaimed, "Cleared user files");
        Ok(unclaimed)
    }
}

/// Internal routes, mounted under `/internal`
pub fn internal_routes(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/internal/files/:id/claim", post(claim_file))
        .route("/internal/files/:id", delete(delete_file))
        .route("/internal/users/:user_id/clear", post(clear_files))
        .route_layer(middleware::from_fn_with_state(state, require_internal_token))
}

async fn require_internal_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> std::result::Result<Response, ApiError> {
    let provided = bearer_token(&headers).unwrap_or_default();
    if provided.is_empty() || !secrets_match(provided, &state.internal_token) {
        return Err(UploadsError::from(AuthError::BadSignature).into());
    }
    Ok(next.run(request).await)
}

/// The credential of an `Authorization` header, with or without a `Bearer` prefix
pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    Some(value.strip_prefix("Bearer ").unwrap_or(value).trim())
}

async fn claim_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ClaimRequest>,
) -> std::result::Result<Json<ClaimedFile>, ApiError> {
    Ok(Json(state.admin.claim_file(&id, &request.bucket).await?))
}

async fn delete_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> std::result::Result<StatusCode, ApiError> {
    state.admin.delete_file(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn clear_files(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> std::result::Result<StatusCode, ApiError> {
    state.admin.clear_files(&user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
