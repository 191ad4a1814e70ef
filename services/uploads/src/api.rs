use crate::admin::{bearer_token, internal_routes, AdminService};
use crate::config::ApiConfig;
use crate::content_store::{ContentStore, NewFile};
use crate::error::{AuthError, UploadsError};
use crate::files::{clean_filename, is_supported_image, Bucket, File};
use crate::token::{TokenScope, TokenVerifier};
use anyhow::Context;
use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};

const IMMUTABLE: &str = "public, max-age=31536000, immutable";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<ContentStore>,
    pub verifier: Arc<TokenVerifier>,
    pub admin: Arc<AdminService>,
    pub internal_token: Arc<str>,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Handler error, rendered as [`ErrorResponse`]
#[derive(Debug)]
pub enum ApiError {
    Uploads(UploadsError),
    BadRequest(String),
}

impl From<UploadsError> for ApiError {
    fn from(e: UploadsError) -> Self {
        ApiError::Uploads(e)
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        ApiError::Uploads(e.into())
    }
}

fn status_for(e: &UploadsError) -> StatusCode {
    match e {
        UploadsError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        UploadsError::NotFound => StatusCode::NOT_FOUND,
        UploadsError::Blocked => StatusCode::FORBIDDEN,
        UploadsError::AlreadyClaimed | UploadsError::MismatchedBucket => StatusCode::CONFLICT,
        UploadsError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        UploadsError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
        UploadsError::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Uploads(e) => {
                let status = status_for(&e);
                if status.is_server_error() {
                    error!(error = %e, "Request failed");
                }
                (
                    status,
                    ErrorResponse {
                        error: e.to_string(),
                        code: e.code().to_string(),
                    },
                )
            }
            ApiError::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                ErrorResponse {
                    error: message,
                    code: "BAD_REQUEST".to_string(),
                },
            ),
        };
        (status, Json(body)).into_response()
    }
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<HeaderValue> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/data-exports/:token", get(data_export))
        .route("/:bucket", post(upload))
        .route("/:bucket/:id", get(download))
        .route("/:bucket/:id/:filename", get(download_named))
        .merge(internal_routes(state.clone()))
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "uploads-service"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

fn parse_bucket(bucket: &str) -> Result<Bucket, ApiError> {
    bucket
        .parse()
        .map_err(|()| ApiError::from(UploadsError::NotFound))
}

/// Prefer the sniffed image type over the client's claim
fn detect_mime(bytes: &[u8], declared: Option<&str>) -> String {
    if let Some(sniffed) = image::guess_format(bytes)
        .ok()
        .map(|format| format.to_mime_type())
        .filter(|mime| is_supported_image(mime))
    {
        return sniffed.to_string();
    }
    declared
        .filter(|mime| !mime.is_empty())
        .unwrap_or("application/octet-stream")
        .to_string()
}

struct UploadedPart {
    filename: String,
    mime: String,
    bytes: Bytes,
}

async fn read_file_field(multipart: &mut Multipart) -> Result<UploadedPart, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.body_text()))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let filename = field.file_name().map(clean_filename);
        let declared = field.content_type().map(str::to_string);
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(e.body_text()))?;
        let mime = detect_mime(&bytes, declared.as_deref());

        return Ok(UploadedPart {
            filename: filename.unwrap_or_else(|| "file".to_string()),
            mime,
            bytes,
        });
    }
    Err(ApiError::BadRequest("missing multipart field `file`".to_string()))
}

/// Upload a file into a bucket
#[instrument(skip(state, headers, multipart))]
async fn upload(
    State(state): State<AppState>,
    Path(bucket): Path<String>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<File>, ApiError> {
    let bucket = parse_bucket(&bucket)?;
    let token = bearer_token(&headers)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AuthError::Malformed("missing authorization".to_string()))?;
    let claims = state.verifier.verify_scoped(token, bucket.upload_scope())?;

    let part = read_file_field(&mut multipart).await?;

    let bucket_max = state.store.limits().max_bytes(bucket);
    let max = match claims.data.max_size {
        0 => bucket_max,
        token_max => token_max.min(bucket_max),
    };
    let size = part.bytes.len() as u64;
    if size > max {
        return Err(UploadsError::TooLarge { size, max }.into());
    }

    let file = state
        .store
        .create_file(NewFile {
            bucket,
            bytes: part.bytes,
            filename: part.filename,
            mime: part.mime,
            uploaded_by: claims.data.uploader,
            id: Some(claims.data.id),
        })
        .await?;

    Ok(Json(file))
}

#[derive(Debug, Default, Deserialize)]
struct DownloadQuery {
    preview: Option<String>,
    download: Option<String>,
}

async fn download(
    State(state): State<AppState>,
    Path((bucket, id)): Path<(String, String)>,
    Query(query): Query<DownloadQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    serve_file(&state, &bucket, &id, None, &query, &headers).await
}

async fn download_named(
    State(state): State<AppState>,
    Path((bucket, id, filename)): Path<(String, String, String)>,
    Query(query): Query<DownloadQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    serve_file(&state, &bucket, &id, Some(&filename), &query, &headers).await
}

fn etag_matches(headers: &HeaderMap, id: &str) -> bool {
    headers
        .get_all(header::IF_NONE_MATCH)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|tag| tag.trim().trim_start_matches("W/").trim_matches('"'))
        .any(|tag| tag == id || tag == "*")
}

fn content_disposition(kind: &str, filename: &str) -> HeaderValue {
    HeaderValue::from_bytes(format!("{}; filename=\"{}\"", kind, filename).as_bytes())
        .unwrap_or_else(|_| HeaderValue::from_static("inline"))
}

#[instrument(skip(state, query, headers))]
async fn serve_file(
    state: &AppState,
    bucket: &str,
    id: &str,
    filename: Option<&str>,
    query: &DownloadQuery,
    headers: &HeaderMap,
) -> Result<Response, ApiError> {
    let bucket = parse_bucket(bucket)?;
    let file = state.store.get_file(id).await?;
    // Existence in another bucket is not revealed
    if file.bucket != bucket.as_str() {
        return Err(UploadsError::NotFound.into());
    }

    let etag = format!("\"{}\"", file.id);
    if etag_matches(headers, &file.id) {
        return Ok((
            StatusCode::NOT_MODIFIED,
            [(header::ETAG, etag), (header::CACHE_CONTROL, IMMUTABLE.to_string())],
        )
            .into_response());
    }

    let object = if query.preview.is_some() {
        state.store.get_preview_object(&file).await?
    } else {
        state.store.get_object(&file).await?
    };

    let disposition = if query.download.is_some() {
        "attachment"
    } else {
        "inline"
    };
    let filename = filename.map(clean_filename).unwrap_or(file.filename);

    let mut response = Response::new(Body::from(object.body));
    let response_headers = response.headers_mut();
    if let Ok(mime) = HeaderValue::from_str(&file.mime) {
        response_headers.insert(header::CONTENT_TYPE, mime);
    }
    if let Ok(etag) = HeaderValue::from_str(&etag) {
        response_headers.insert(header::ETAG, etag);
    }
    response_headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(IMMUTABLE));
    response_headers.insert(
        header::CONTENT_DISPOSITION,
        content_disposition(disposition, &filename),
    );

    Ok(response)
}

/// Download a user's data export archive
#[instrument(skip(state, token))]
async fn data_export(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Response, ApiError> {
    let claims = state
        .verifier
        .verify_scoped(&token, TokenScope::AccessDataExport)?;
    if claims.data.id.is_empty() {
        return Err(UploadsError::NotFound.into());
    }

    let object = state.store.get_data_export(&claims.data.id).await?;
    let owner = object.info.metadata.get("user-id").map(String::as_str);
    if owner != Some(claims.data.uploader.as_str()) {
        warn!(export = %claims.data.id, "Data export requested by non-owner");
        return Err(AuthError::NotOwner.into());
    }

    let content_type = Some(object.info.content_type.as_str())
        .filter(|ct| !ct.is_empty())
        .and_then(|ct| HeaderValue::from_str(ct).ok())
        .unwrap_or_else(|| HeaderValue::from_static("application/zip"));

    let mut response = Response::new(Body::from(object.body));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, content_type);
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_static("attachment; filename=export.zip"),
    );
    Ok(response)
}

/// Start the API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> anyhow::Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind API server")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content_store::harness::{harness, Harness};
    use crate::token::{TokenClaims, TokenData};
    use crate::transcoder::fixtures;
    use axum::http::{Method, Request};
    use chrono::Utc;
    use http_body_util::BodyExt;
    use std::collections::HashMap;
    use tower::ServiceExt;

    const SECRET: &str = "test-signing-secret";
    const INTERNAL: &str = "internal-secret";
    const BOUNDARY: &str = "XUPLOADBOUNDARY";

    struct TestApp {
        h: Harness,
        router: Router,
        verifier: TokenVerifier,
    }

    fn app() -> TestApp {
        let h = harness();
        let verifier = TokenVerifier::new(SECRET);
        let state = AppState {
            store: h.store.clone(),
            verifier: Arc::new(verifier.clone()),
            admin: Arc::new(AdminService::new(h.store.clone(), None, h.tasks.clone())),
            internal_token: Arc::from(INTERNAL),
        };
        let router = create_router(state, &ApiConfig::default());
        TestApp { h, router, verifier }
    }

    impl TestApp {
        fn token(&self, scope: TokenScope, id: &str, uploader: &str, max_size: u64) -> String {
            let claims = TokenClaims::new(
                scope,
                Utc::now().timestamp() + 300,
                TokenData {
                    id: id.to_string(),
                    uploader: uploader.to_string(),
                    max_size,
                },
            );
            self.verifier.issue(&claims).unwrap()
        }

        async fn send(&self, request: Request<Body>) -> (StatusCode, HeaderMap, Bytes) {
            let response = self.router.clone().oneshot(request).await.unwrap();
            let status = response.status();
            let headers = response.headers().clone();
            let body = response.into_body().collect().await.unwrap().to_bytes();
            (status, headers, body)
        }

        async fn get(&self, uri: &str) -> (StatusCode, HeaderMap, Bytes) {
            self.send(Request::get(uri).body(Body::empty()).unwrap()).await
        }
    }

    fn multipart_request(bucket: &str, token: Option<&str>, content_type: &str, bytes: &[u8]) -> Request<Body> {
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"my cat.png\"\r\nContent-Type: {content_type}\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(format!("/{}", bucket))
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            );
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, token);
        }
        builder.body(Body::from(body)).unwrap()
    }

    fn error_code(body: &Bytes) -> String {
        serde_json::from_slice::<ErrorResponse>(body).unwrap().code
    }

    #[tokio::test]
    async fn test_health() {
        let app = app();
        let (status, _, _) = app.get("/health").await;
        assert_eq!(status, StatusCode::OK);

        let (status, _, _) = app.get("/ready").await;
        assert_eq!(status, StatusCode::OK);

        app.h.catalog.set_failing(true);
        let (status, _, _) = app.get("/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_upload_requires_a_token_for_the_bucket() {
        let app = app();

        let (status, _, body) = app
            .send(multipart_request("attachments", None, "text/plain", b"hi"))
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(error_code(&body), "UNAUTHORIZED");

        let emoji_token = app.token(TokenScope::UploadEmoji, "e1", "alice", 0);
        let (status, _, _) = app
            .send(multipart_request("attachments", Some(&emoji_token), "text/plain", b"hi"))
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(app.h.catalog.file_count(), 0);
    }

    #[tokio::test]
    async fn test_upload_and_download() {
        let app = app();
        let token = app.token(TokenScope::UploadAttachment, "file-1", "alice", 0);

        let (status, _, body) = app
            .send(multipart_request("attachments", Some(&token), "text/plain", b"hello world"))
            .await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["id"], "file-1");
        assert_eq!(json["bucket"], "attachments");
        assert_eq!(json["filename"], "my cat.png");
        assert_eq!(json["uploaded_by"], "alice");
        assert!(json.get("hash").is_none());

        let (status, headers, body) = app.get("/attachments/file-1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Bytes::from_static(b"hello world"));
        assert_eq!(headers[header::ETAG], "\"file-1\"");
        assert_eq!(headers[header::CACHE_CONTROL], IMMUTABLE);
        assert_eq!(headers[header::CONTENT_TYPE], "text/plain");
        assert!(headers[header::CONTENT_DISPOSITION]
            .to_str()
            .unwrap()
            .starts_with("inline"));

        let (_, headers, _) = app.get("/attachments/file-1/report.txt?download").await;
        assert_eq!(
            headers[header::CONTENT_DISPOSITION],
            "attachment; filename=\"report.txt\""
        );
    }

    #[tokio::test]
    async fn test_token_max_size_is_enforced() {
        let app = app();
        let token = app.token(TokenScope::UploadAttachment, "small", "alice", 4);

        let (status, _, body) = app
            .send(multipart_request("attachments", Some(&token), "text/plain", b"too many bytes"))
            .await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(error_code(&body), "TOO_LARGE");
    }

    #[tokio::test]
    async fn test_replayed_upload_token_is_rejected() {
        let app = app();
        let token = app.token(TokenScope::UploadAttachment, "once", "alice", 0);

        let (status, _, _) = app
            .send(multipart_request("attachments", Some(&token), "text/plain", b"first body"))
            .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _, body) = app
            .send(multipart_request("attachments", Some(&token), "text/plain", b"second body"))
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(error_code(&body), "ALREADY_CLAIMED");
        assert_eq!(app.h.catalog.file_count(), 1);
        assert_eq!(app.h.local.object_count("attachments"), 1);
    }

    #[tokio::test]
    async fn test_image_buckets_reject_other_media() {
        let app = app();
        let token = app.token(TokenScope::UploadIcon, "icon", "alice", 0);

        let (status, _, _) = app
            .send(multipart_request("icons", Some(&token), "application/pdf", b"%PDF-1.7"))
            .await;
        assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn test_sniffed_image_type_wins() {
        let app = app();
        let token = app.token(TokenScope::UploadIcon, "icon", "alice", 0);

        let (status, _, body) = app
            .send(multipart_request(
                "icons",
                Some(&token),
                "application/octet-stream",
                &fixtures::png(32, 32),
            ))
            .await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["mime"], "image/png");
        assert_eq!(json["width"], 32);
    }

    #[tokio::test]
    async fn test_conditional_and_cross_bucket_requests() {
        let app = app();
        let token = app.token(TokenScope::UploadAttachment, "cached", "alice", 0);
        app.send(multipart_request("attachments", Some(&token), "text/plain", b"data"))
            .await;

        let request = Request::get("/attachments/cached")
            .header(header::IF_NONE_MATCH, "\"cached\"")
            .body(Body::empty())
            .unwrap();
        let (status, _, body) = app.send(request).await;
        assert_eq!(status, StatusCode::NOT_MODIFIED);
        assert!(body.is_empty());

        let (status, _, _) = app.get("/icons/cached").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _, _) = app.get("/nonsense/cached").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _, _) = app.get("/attachments/unknown").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_preview_is_bounded() {
        let app = app();
        let token = app.token(TokenScope::UploadAttachment, "photo", "alice", 0);
        let (status, _, _) = app
            .send(multipart_request(
                "attachments",
                Some(&token),
                "image/jpeg",
                &fixtures::encode(1440, 720, image::ImageFormat::Jpeg),
            ))
            .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _, body) = app.get("/attachments/photo?preview").await;
        assert_eq!(status, StatusCode::OK);
        let dims = image::load_from_memory(&body).unwrap();
        assert_eq!((dims.width(), dims.height()), (720, 360));
    }

    #[tokio::test]
    async fn test_blocked_upload_is_forbidden() {
        let app = app();
        app.h
            .catalog
            .block(&crate::files::content_hash(b"flagged", "text/plain"), false);
        let token = app.token(TokenScope::UploadAttachment, "bad", "alice", 0);

        let (status, _, body) = app
            .send(multipart_request("attachments", Some(&token), "text/plain", b"flagged"))
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(error_code(&body), "BLOCKED");
    }

    fn seed_export(app: &TestApp, owner: &str) {
        let metadata = HashMap::from([("user-id".to_string(), owner.to_string())]);
        app.h.local.insert_with_metadata(
            "data-exports",
            "export-1",
            b"PK archive".to_vec(),
            "application/zip",
            metadata,
        );
    }

    #[tokio::test]
    async fn test_data_export_for_owner() {
        let app = app();
        seed_export(&app, "alice");
        let token = app.token(TokenScope::AccessDataExport, "export-1", "alice", 0);

        let (status, headers, body) = app.get(&format!("/data-exports/{}", token)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Bytes::from_static(b"PK archive"));
        assert_eq!(headers[header::CACHE_CONTROL], "no-store");
        assert_eq!(
            headers[header::CONTENT_DISPOSITION],
            "attachment; filename=export.zip"
        );
    }

    #[tokio::test]
    async fn test_data_export_rejects_other_users_and_scopes() {
        let app = app();
        seed_export(&app, "alice");

        let mallory = app.token(TokenScope::AccessDataExport, "export-1", "mallory", 0);
        let (status, _, _) = app.get(&format!("/data-exports/{}", mallory)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let upload = app.token(TokenScope::UploadAttachment, "export-1", "alice", 0);
        let (status, _, _) = app.get(&format!("/data-exports/{}", upload)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    fn internal(method: Method, uri: &str, secret: Option<&str>, body: Option<serde_json::Value>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(secret) = secret {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", secret));
        }
        match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_internal_routes_require_shared_secret() {
        let app = app();

        let (status, _, _) = app
            .send(internal(Method::DELETE, "/internal/files/x", None, None))
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _, _) = app
            .send(internal(Method::DELETE, "/internal/files/x", Some("wrong"), None))
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _, _) = app
            .send(internal(Method::DELETE, "/internal/files/x", Some(INTERNAL), None))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_internal_claim_delete_and_clear() {
        let app = app();
        let token = app.token(TokenScope::UploadAttachment, "doc", "alice", 0);
        app.send(multipart_request("attachments", Some(&token), "text/plain", b"document"))
            .await;

        let claim = serde_json::json!({ "bucket": "attachments" });
        let (status, _, body) = app
            .send(internal(Method::POST, "/internal/files/doc/claim", Some(INTERNAL), Some(claim.clone())))
            .await;
        assert_eq!(status, StatusCode::OK);
        let claimed: crate::admin::ClaimedFile = serde_json::from_slice(&body).unwrap();
        assert_eq!(claimed.size, 8);

        let (status, _, body) = app
            .send(internal(Method::POST, "/internal/files/doc/claim", Some(INTERNAL), Some(claim)))
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(error_code(&body), "ALREADY_CLAIMED");

        let (status, _, body) = app
            .send(internal(
                Method::POST,
                "/internal/files/doc/claim",
                Some(INTERNAL),
                Some(serde_json::json!({ "bucket": "stickers" })),
            ))
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(error_code(&body), "MISMATCHED_BUCKET");

        let (status, _, _) = app
            .send(internal(Method::POST, "/internal/users/alice/clear", Some(INTERNAL), None))
            .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(!app.h.store.get_file("doc").await.unwrap().claimed);

        let (status, _, _) = app
            .send(internal(Method::DELETE, "/internal/files/doc", Some(INTERNAL), None))
            .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _, _) = app.get("/attachments/doc").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
