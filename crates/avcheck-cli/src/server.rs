use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use async_trait::async_trait;
use avcheck_core::{AvCheckClient, PollOptions, Submission, TaskStatus};
use axum::{
    extract::{
        multipart::{Field, MultipartError, MultipartRejection},
        DefaultBodyLimit, Multipart, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use thiserror::Error;
use tokio::{fs, io::AsyncWriteExt, net::TcpListener, signal};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::ServerConfig;

const STAGING_DIR: &str = ".incoming";

/// Decision reached for an uploaded file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    Clean,
    Flagged { detections: u32 },
    Failed(String),
}

impl ScanOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Clean)
    }
}

/// Produces a verdict for a stored upload.
#[async_trait]
pub trait UploadScanner: Send + Sync {
    async fn scan(&self, path: &Path) -> ScanOutcome;
}

/// Scans uploads through the AvCheck service: submit, wait, compare with the threshold.
pub struct AvCheckScanner {
    client: AvCheckClient,
    threshold: u32,
    poll: PollOptions,
}

impl AvCheckScanner {
    pub fn new(client: AvCheckClient, threshold: u32, poll: PollOptions) -> Self {
        Self {
            client,
            threshold,
            poll,
        }
    }
}

#[async_trait]
impl UploadScanner for AvCheckScanner {
    async fn scan(&self, path: &Path) -> ScanOutcome {
        let data = match self.client.scan(&Submission::file(path), &self.poll).await {
            Ok(data) => data,
            Err(err) => {
                error!(error = %err, "an error occurred during file scan");
                return ScanOutcome::Failed(err.to_string());
            }
        };
        info!(task_id = %data.task_id, "task data retrieved");
        if data.status != TaskStatus::Completed {
            error!(task_id = %data.task_id, status = ?data.status, "scan did not complete");
            return ScanOutcome::Failed(format!(
                "task {} ended with status {:?}",
                data.task_id, data.status
            ));
        }
        let detections = data.total_detections();
        if self.client.is_detected(&data, self.threshold) {
            ScanOutcome::Flagged { detections }
        } else {
            ScanOutcome::Clean
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    config: Arc<ServerConfig>,
    scanner: Arc<dyn UploadScanner>,
}

impl AppState {
    pub fn new(config: ServerConfig, scanner: Arc<dyn UploadScanner>) -> Self {
        Self {
            config: Arc::new(config),
            scanner,
        }
    }
}

pub fn router(state: AppState) -> Router {
    let body_limit = state.config.max_upload_bytes;
    Router::new()
        .route("/upload", post(upload_file))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// Bind the configured address and serve until Ctrl-C or SIGTERM.
pub async fn serve(config: ServerConfig, scanner: Arc<dyn UploadScanner>) -> anyhow::Result<()> {
    fs::create_dir_all(&config.upload_dir)
        .await
        .with_context(|| {
            format!(
                "failed to create upload directory {}",
                config.upload_dir.display()
            )
        })?;
    let listener = TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    info!(
        addr = %listener.local_addr()?,
        upload_dir = %config.upload_dir.display(),
        "upload server listening"
    );

    axum::serve(listener, router(AppState::new(config, scanner)))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("upload server failed")?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutting down upload server");
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

#[derive(Debug, Error)]
enum UploadError {
    #[error("No file part")]
    NoFilePart,
    #[error("No selected file")]
    NoSelectedFile,
    #[error("Invalid file name")]
    InvalidFileName,
    #[error("File contains malware and was rejected.")]
    Rejected,
    #[error("{}", .0.body_text())]
    NotMultipart(MultipartRejection),
    #[error(transparent)]
    Multipart(#[from] MultipartError),
    #[error("File upload failed")]
    Storage(#[from] io::Error),
}

impl IntoResponse for UploadError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::NoFilePart | Self::NoSelectedFile | Self::InvalidFileName | Self::Rejected => {
                StatusCode::BAD_REQUEST
            }
            Self::NotMultipart(rejection) => rejection.status(),
            Self::Multipart(err) => err.status(),
            Self::Storage(err) => {
                error!(error = %err, "failed to store upload");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({"error": self.to_string()}))).into_response()
    }
}

async fn upload_file(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    let mut multipart = match multipart {
        Ok(multipart) => multipart,
        Err(rejection) => return UploadError::NotMultipart(rejection).into_response(),
    };
    match receive_upload(&state, &mut multipart).await {
        Ok(filename) => (
            StatusCode::OK,
            Json(json!({"message": "File uploaded successfully", "filename": filename})),
        )
            .into_response(),
        Err(err) => err.into_response(),
    }
}

async fn receive_upload(
    state: &AppState,
    multipart: &mut Multipart,
) -> Result<String, UploadError> {
    while let Some(mut field) = multipart.next_field().await? {
        if field.name() != Some("file") {
            continue;
        }
        let raw_name = field.file_name().unwrap_or_default().to_string();
        if raw_name.is_empty() {
            return Err(UploadError::NoSelectedFile);
        }
        let filename = sanitize_filename(&raw_name).ok_or(UploadError::InvalidFileName)?;

        let staging = state
            .config
            .upload_dir
            .join(STAGING_DIR)
            .join(Uuid::new_v4().to_string());
        fs::create_dir_all(&staging).await?;
        let result = store_and_scan(state, &mut field, &staging, &filename).await;
        if let Err(err) = fs::remove_dir_all(&staging).await {
            warn!(error = %err, staging = %staging.display(), "failed to clean staging directory");
        }
        return result.map(|()| filename);
    }
    Err(UploadError::NoFilePart)
}

async fn store_and_scan(
    state: &AppState,
    field: &mut Field<'_>,
    staging: &Path,
    filename: &str,
) -> Result<(), UploadError> {
    let temp_path = staging.join(filename);
    write_field(field, &temp_path).await?;

    if state.config.should_scan(filename) {
        info!(filename, "scanning file");
        let outcome = state.scanner.scan(&temp_path).await;
        if !outcome.is_accepted() {
            warn!(filename, ?outcome, "upload rejected");
            return Err(UploadError::Rejected);
        }
    }

    let final_path: PathBuf = state.config.upload_dir.join(filename);
    fs::rename(&temp_path, &final_path).await?;
    info!(filename, "file uploaded successfully");
    Ok(())
}

async fn write_field(field: &mut Field<'_>, path: &Path) -> Result<(), UploadError> {
    let mut file = fs::File::create(path).await?;
    while let Some(chunk) = field.chunk().await? {
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    Ok(())
}

/// Reduce a client-supplied file name to a safe single path component.
///
/// Returns `None` when nothing usable is left.
pub fn sanitize_filename(raw: &str) -> Option<String> {
    let base = raw.rsplit(|c| c == '/' || c == '\\').next().unwrap_or_default();
    let joined = base.split_whitespace().collect::<Vec<_>>().join("_");
    let cleaned: String = joined
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        .collect();
    let trimmed = cleaned.trim_start_matches(|c| c == '.' || c == '_');
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use avcheck_core::AvCheckSettings;
    use axum::{body::Body, http::header::CONTENT_TYPE, http::Request};
    use httpmock::prelude::*;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };
    use tower::ServiceExt;

    const BOUNDARY: &str = "avcheck-test-boundary";

    struct StubScanner {
        outcome: ScanOutcome,
        calls: AtomicUsize,
    }

    impl StubScanner {
        fn new(outcome: ScanOutcome) -> Arc<Self> {
            Arc::new(Self {
                outcome,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl UploadScanner for StubScanner {
        async fn scan(&self, path: &Path) -> ScanOutcome {
            assert!(path.exists(), "scanner should see the stored upload");
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcome.clone()
        }
    }

    fn test_config(upload_dir: &Path) -> ServerConfig {
        ServerConfig {
            upload_dir: upload_dir.to_path_buf(),
            ..ServerConfig::default()
        }
    }

    fn upload_request(field: &str, filename: &str, contents: &[u8]) -> Request<Body> {
        let mut body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(contents);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
        Request::builder()
            .method("POST")
            .uri("/upload")
            .header(CONTENT_TYPE, format!("multipart/form-data; boundary={BOUNDARY}"))
            .body(Body::from(body))
            .unwrap()
    }

    async fn send(
        config: ServerConfig,
        scanner: Arc<dyn UploadScanner>,
        request: Request<Body>,
    ) -> (StatusCode, serde_json::Value) {
        let response = router(AppState::new(config, scanner))
            .oneshot(request)
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn staging_is_empty(upload_dir: &Path) -> bool {
        match std::fs::read_dir(upload_dir.join(STAGING_DIR)) {
            Ok(mut entries) => entries.next().is_none(),
            Err(_) => true,
        }
    }

    #[tokio::test]
    async fn clean_executable_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let scanner = StubScanner::new(ScanOutcome::Clean);
        let (status, body) = send(
            test_config(dir.path()),
            scanner.clone(),
            upload_request("file", "setup.exe", b"MZ-clean"),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "File uploaded successfully");
        assert_eq!(body["filename"], "setup.exe");
        assert_eq!(scanner.calls(), 1);
        assert_eq!(std::fs::read(dir.path().join("setup.exe")).unwrap(), b"MZ-clean");
        assert!(staging_is_empty(dir.path()));
    }

    #[tokio::test]
    async fn flagged_executable_is_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let scanner = StubScanner::new(ScanOutcome::Flagged { detections: 3 });
        let (status, body) = send(
            test_config(dir.path()),
            scanner.clone(),
            upload_request("file", "setup.exe", b"MZ-bad"),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "File contains malware and was rejected.");
        assert!(!dir.path().join("setup.exe").exists());
        assert!(staging_is_empty(dir.path()));
    }

    #[tokio::test]
    async fn failed_scan_rejects_upload() {
        let dir = tempfile::tempdir().unwrap();
        let scanner = StubScanner::new(ScanOutcome::Failed("timeout".into()));
        let (status, _) = send(
            test_config(dir.path()),
            scanner,
            upload_request("file", "installer.MSI", b"msi-bytes"),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(!dir.path().join("installer.MSI").exists());
    }

    #[tokio::test]
    async fn non_executable_skips_scan() {
        let dir = tempfile::tempdir().unwrap();
        let scanner = StubScanner::new(ScanOutcome::Flagged { detections: 1 });
        let (status, body) = send(
            test_config(dir.path()),
            scanner.clone(),
            upload_request("file", "../../notes final.txt", b"hello"),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["filename"], "notes_final.txt");
        assert_eq!(scanner.calls(), 0);
        assert!(dir.path().join("notes_final.txt").exists());
    }

    #[tokio::test]
    async fn missing_file_part_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let (status, body) = send(
            test_config(dir.path()),
            StubScanner::new(ScanOutcome::Clean),
            upload_request("attachment", "setup.exe", b"MZ"),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "No file part");
    }

    #[tokio::test]
    async fn empty_file_name_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let (status, body) = send(
            test_config(dir.path()),
            StubScanner::new(ScanOutcome::Clean),
            upload_request("file", "", b""),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "No selected file");
    }

    #[tokio::test]
    async fn unusable_file_name_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let (status, body) = send(
            test_config(dir.path()),
            StubScanner::new(ScanOutcome::Clean),
            upload_request("file", "../...", b"data"),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Invalid file name");
    }

    #[tokio::test]
    async fn oversized_upload_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            max_upload_bytes: 64,
            ..test_config(dir.path())
        };
        let (status, body) = send(
            config,
            StubScanner::new(ScanOutcome::Clean),
            upload_request("file", "big.bin", &[0u8; 4096]),
        )
        .await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert!(body["error"].is_string());
        assert!(!dir.path().join("big.bin").exists());
    }

    #[tokio::test]
    async fn non_multipart_request_gets_json_error() {
        let dir = tempfile::tempdir().unwrap();
        let request = Request::builder()
            .method("POST")
            .uri("/upload")
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"file": "setup.exe"}"#))
            .unwrap();
        let (status, body) = send(
            test_config(dir.path()),
            StubScanner::new(ScanOutcome::Clean),
            request,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().is_some_and(|msg| !msg.is_empty()));
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let dir = tempfile::tempdir().unwrap();
        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(
            test_config(dir.path()),
            StubScanner::new(ScanOutcome::Clean),
            request,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn malicious_upload_is_rejected_end_to_end() {
        let server = MockServer::start_async().await;
        let create = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/check/new/")
                    .body_contains("name=\"task_type\"")
                    .body_contains("filename=\"payload.exe\"");
                then.status(200)
                    .json_body(json!({"success": true, "data": {"task_id": "abc123"}}));
            })
            .await;
        let status_mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/check/status/")
                    .body_contains("task_id=abc123");
                then.status(200).json_body(json!({
                    "success": true,
                    "data": {
                        "status": "completed",
                        "results": {
                            "engineA": {"verdict": "clean"},
                            "engineB": {"verdict": "malicious", "threat": "Win32.Trojan"}
                        }
                    }
                }));
            })
            .await;

        let settings = AvCheckSettings::new("test-key").with_endpoint(server.base_url());
        let client = AvCheckClient::new(&settings).unwrap();
        let poll = PollOptions {
            interval: Duration::from_millis(1),
            max_polls: 2,
        };
        let scanner = Arc::new(AvCheckScanner::new(client, 0, poll));

        let dir = tempfile::tempdir().unwrap();
        let (status, body) = send(
            test_config(dir.path()),
            scanner,
            upload_request("file", "payload.exe", b"MZ-malicious"),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "File contains malware and was rejected.");
        assert!(!dir.path().join("payload.exe").exists());
        create.assert_async().await;
        status_mock.assert_async().await;
    }

    #[tokio::test]
    async fn failed_upstream_task_rejects_upload() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/check/new/");
                then.status(200)
                    .json_body(json!({"success": true, "data": {"task_id": "abc123"}}));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/check/status/");
                then.status(200)
                    .json_body(json!({"success": true, "data": {"status": "failed"}}));
            })
            .await;

        let settings = AvCheckSettings::new("test-key").with_endpoint(server.base_url());
        let client = AvCheckClient::new(&settings).unwrap();
        let poll = PollOptions {
            interval: Duration::from_millis(1),
            max_polls: 2,
        };
        let scanner = AvCheckScanner::new(client, 0, poll);

        let dir = tempfile::tempdir().unwrap();
        let payload = dir.path().join("payload.exe");
        std::fs::write(&payload, b"MZ-unknown").unwrap();
        assert!(matches!(
            scanner.scan(&payload).await,
            ScanOutcome::Failed(reason) if reason.contains("Failed")
        ));

        let upload_dir = dir.path().join("uploads");
        let (status, body) = send(
            test_config(&upload_dir),
            Arc::new(scanner),
            upload_request("file", "payload.exe", b"MZ-unknown"),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "File contains malware and was rejected.");
        assert!(!upload_dir.join("payload.exe").exists());
    }

    #[test]
    fn sanitize_filename_strips_paths_and_symbols() {
        assert_eq!(sanitize_filename("setup.exe").as_deref(), Some("setup.exe"));
        assert_eq!(
            sanitize_filename("C:\\Users\\me\\My Setup.exe").as_deref(),
            Some("My_Setup.exe")
        );
        assert_eq!(
            sanitize_filename("../../etc/passwd").as_deref(),
            Some("passwd")
        );
        assert_eq!(sanitize_filename(".bashrc").as_deref(), Some("bashrc"));
        assert_eq!(sanitize_filename("a$b%c.msi").as_deref(), Some("abc.msi"));
        assert_eq!(sanitize_filename("..."), None);
        assert_eq!(sanitize_filename("   "), None);
    }
}
