//! Media service: binary uploads plus the metadata that posts reference.
//!
//! Posts hold media ids without any referential link, so cleanup after a post
//! is deleted happens through [`MediaLifecycle`] on the event bus.

mod lifecycle;
mod storage;
mod store;

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::multipart::{Field, MultipartRejection};
use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

pub use self::lifecycle::MediaLifecycle;
pub use self::storage::{InMemoryObjectStorage, LocalObjectStorage, ObjectStorage};
pub use self::store::{InMemoryMediaStore, MediaStore, PgMediaStore};

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::event_bus::EventBus;
use crate::extract::TrustedUser;
use crate::handlers::health_report;
use crate::models::{ApiResponse, HealthResponse, MediaListPayload, MediaRecord, UploadPayload};
use crate::routes::with_common_layers;

const FILE_FIELD: &str = "file";
const NO_FILE: &str = "No file uploaded! Please upload a file";
const MAX_EXTENSION_LEN: usize = 10;

#[derive(Clone)]
pub struct MediaService {
    store: Arc<dyn MediaStore>,
    storage: Arc<dyn ObjectStorage>,
    bus: Arc<dyn EventBus>,
    max_file_size: usize,
}

impl MediaService {
    pub fn new(
        store: Arc<dyn MediaStore>,
        storage: Arc<dyn ObjectStorage>,
        bus: Arc<dyn EventBus>,
        max_file_size: usize,
    ) -> Self {
        Self {
            store,
            storage,
            bus,
            max_file_size,
        }
    }

    pub fn max_file_size(&self) -> usize {
        self.max_file_size
    }

    /// Lifecycle handler sharing this service's store and storage.
    pub fn lifecycle(&self) -> MediaLifecycle {
        MediaLifecycle::new(self.store.clone(), self.storage.clone())
    }

    /// Store an upload and record its metadata.
    ///
    /// The size limit is checked before object storage is touched. If the
    /// metadata insert fails, the freshly stored object is removed again.
    #[instrument(skip(self, data), fields(bytes = data.len()))]
    pub async fn upload(
        &self,
        user_id: &str,
        original_name: &str,
        mime_type: &str,
        data: Bytes,
    ) -> AppResult<MediaRecord> {
        if data.len() > self.max_file_size {
            return Err(file_too_large(self.max_file_size));
        }

        let id = Uuid::new_v4();
        let public_id = match extension_of(original_name) {
            Some(ext) => format!("{id}.{ext}"),
            None => id.to_string(),
        };

        let url = self.storage.put(&public_id, mime_type, data).await?;

        let record = MediaRecord {
            id,
            user_id: user_id.to_string(),
            original_name: original_name.to_string(),
            mime_type: mime_type.to_string(),
            url,
            public_id,
            created_at: Utc::now(),
        };

        if let Err(e) = self.store.insert(&record).await {
            if let Err(cleanup) = self.storage.delete(&record.public_id).await {
                warn!(public_id = %record.public_id, error = %cleanup, "Orphaned object after failed insert");
            }
            return Err(e);
        }

        info!(media_id = %record.id, user_id, "Media uploaded");
        Ok(record)
    }

    pub async fn list(&self) -> AppResult<Vec<MediaRecord>> {
        self.store.list().await
    }
}

fn file_too_large(limit: usize) -> AppError {
    AppError::BadRequest(format!("File exceeds the {limit} byte limit"))
}

/// Lowercased extension of an uploaded file name, if it is short and alphanumeric.
fn extension_of(name: &str) -> Option<String> {
    let (_, ext) = name.rsplit_once('.')?;
    let valid = !ext.is_empty()
        && ext.len() <= MAX_EXTENSION_LEN
        && ext.chars().all(|c| c.is_ascii_alphanumeric());
    valid.then(|| ext.to_ascii_lowercase())
}

pub fn build_media_router(service: MediaService, config: &Config) -> Router {
    let router = Router::new()
        .route("/health", get(health))
        .route("/api/media/upload", post(upload_media))
        .route("/api/media/get-all-media", get(get_all_media))
        .with_state(service);

    with_common_layers(router, config)
}

/// Read a multipart field, buffering at most `limit` bytes.
///
/// An oversized field is still drained to the end so the client receives the
/// 400 rather than a reset connection.
async fn read_capped(field: &mut Field<'_>, limit: usize) -> AppResult<Bytes> {
    let mut buf = Vec::new();
    let mut oversized = false;
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|e| AppError::BadRequest(e.body_text()))?
    {
        if oversized {
            continue;
        }
        if buf.len() + chunk.len() > limit {
            oversized = true;
            buf = Vec::new();
            continue;
        }
        buf.extend_from_slice(&chunk);
    }

    if oversized {
        return Err(file_too_large(limit));
    }
    Ok(Bytes::from(buf))
}

/// `POST /api/media/upload` with a single multipart field named `file`.
#[instrument(skip(service, multipart))]
async fn upload_media(
    State(service): State<MediaService>,
    TrustedUser(user_id): TrustedUser,
    multipart: Result<Multipart, MultipartRejection>,
) -> AppResult<(StatusCode, Json<ApiResponse<UploadPayload>>)> {
    let mut multipart = multipart.map_err(|_| AppError::BadRequest(NO_FILE.to_string()))?;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(e.body_text()))?
    {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }

        let original_name = field.file_name().unwrap_or("upload").to_string();
        let mime_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let data = read_capped(&mut field, service.max_file_size()).await?;

        let record = service
            .upload(&user_id, &original_name, &mime_type, data)
            .await?;

        return Ok((
            StatusCode::CREATED,
            Json(ApiResponse::ok(
                "Media uploaded successfully",
                UploadPayload {
                    media_id: record.id,
                    url: record.url,
                },
            )),
        ));
    }

    Err(AppError::BadRequest(NO_FILE.to_string()))
}

#[instrument(skip(service))]
async fn get_all_media(
    State(service): State<MediaService>,
    TrustedUser(_user_id): TrustedUser,
) -> AppResult<Json<ApiResponse<MediaListPayload>>> {
    let medias = service.list().await?;
    Ok(Json(ApiResponse::ok(
        "Medias fetched successfully",
        MediaListPayload { medias },
    )))
}

async fn health(State(service): State<MediaService>) -> Json<HealthResponse> {
    health_report(
        "media",
        &[
            ("database", service.store.ping().await),
            ("event_bus", service.bus.is_connected()),
        ],
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::event_bus::InMemoryEventBus;
    use crate::extract::USER_ID_HEADER;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    const LIMIT: usize = 5 * 1024 * 1024;
    const BOUNDARY: &str = "XBOUNDARYX";

    struct Fixture {
        service: MediaService,
        store: Arc<InMemoryMediaStore>,
        storage: Arc<InMemoryObjectStorage>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryMediaStore::new());
        let storage = Arc::new(InMemoryObjectStorage::new());
        let service = MediaService::new(
            store.clone(),
            storage.clone(),
            Arc::new(InMemoryEventBus::new()),
            LIMIT,
        );
        Fixture {
            service,
            store,
            storage,
        }
    }

    fn multipart_body(field: &str, file_name: &str, data: &[u8]) -> Vec<u8> {
        let mut body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{file_name}\"\r\nContent-Type: image/png\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn upload_request(body: Vec<u8>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/media/upload")
            .header(USER_ID_HEADER, "u1")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn json_of(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_extension_of() {
        assert_eq!(extension_of("cat.PNG").as_deref(), Some("png"));
        assert_eq!(extension_of("archive.tar.gz").as_deref(), Some("gz"));
        assert_eq!(extension_of("noext"), None);
        assert_eq!(extension_of("evil./../x"), None);
    }

    #[tokio::test]
    async fn test_oversized_upload_rejected_before_storage() {
        let f = fixture();
        let data = Bytes::from(vec![0u8; LIMIT + 1]);

        let result = f.service.upload("u1", "big.png", "image/png", data).await;

        assert!(matches!(result, Err(AppError::BadRequest(_))));
        assert_eq!(f.storage.calls(), 0);
    }

    #[tokio::test]
    async fn test_upload_records_metadata() {
        let f = fixture();
        let record = f
            .service
            .upload("u1", "cat.png", "image/png", Bytes::from_static(b"png"))
            .await
            .unwrap();

        assert_eq!(record.public_id, format!("{}.png", record.id));
        assert!(f.storage.contains(&record.public_id).await);
        assert_eq!(f.store.get(record.id).await.unwrap().user_id, "u1");
    }

    #[tokio::test]
    async fn test_failed_insert_removes_object() {
        let f = fixture();
        f.store.set_available(false);

        let result = f
            .service
            .upload("u1", "cat.png", "image/png", Bytes::from_static(b"png"))
            .await;

        assert!(result.is_err());
        // put then compensating delete
        assert_eq!(f.storage.calls(), 2);
    }

    #[tokio::test]
    async fn test_upload_endpoint() {
        let f = fixture();
        let app = build_media_router(f.service.clone(), &Config::default());

        let response = app
            .oneshot(upload_request(multipart_body("file", "cat.png", b"png")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        let body = json_of(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["message"], "Media uploaded successfully");
        assert!(body["mediaId"].is_string());
        assert!(body["url"].as_str().unwrap().ends_with(".png"));
    }

    #[tokio::test]
    async fn test_upload_without_file_field() {
        let f = fixture();
        let app = build_media_router(f.service.clone(), &Config::default());

        let response = app
            .oneshot(upload_request(multipart_body("other", "cat.png", b"png")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_of(response).await["message"], NO_FILE);
        assert_eq!(f.storage.calls(), 0);
    }

    #[tokio::test]
    async fn test_oversized_multipart_rejected() {
        let f = fixture();
        let app = build_media_router(f.service.clone(), &Config::default());

        let response = app
            .oneshot(upload_request(multipart_body(
                "file",
                "big.png",
                &vec![1u8; LIMIT + 1],
            )))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(f.storage.calls(), 0);
    }

    #[tokio::test]
    async fn test_get_all_media() {
        let f = fixture();
        f.service
            .upload("u1", "a.png", "image/png", Bytes::from_static(b"a"))
            .await
            .unwrap();
        let app = build_media_router(f.service.clone(), &Config::default());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/media/get-all-media")
                    .header(USER_ID_HEADER, "u1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_of(response).await;
        assert_eq!(body["message"], "Medias fetched successfully");
        assert_eq!(body["medias"].as_array().unwrap().len(), 1);
    }
}
