//! HTTP surface for resume intake.
//!
//! This module exposes a compact Axum router:
//!
//! - `POST /parse-resume-task/start` – Accept `{ "resumeFileUrl": "bucket/key" }` or
//!   `{ "resumeText": "..." }` (aliases `documentRef` / `text`), create a task and return
//!   `{ ok: true, data: { taskId } }` without waiting for processing.
//! - `GET /parse-resume-task/status?taskId=...` – Poll a task's `{ status, result, error }`.
//! - `POST /upload` – Multipart upload (field `file`) into the default bucket; returns
//!   `{ ok: true, data: { filePath, bucket, originalName } }`.
//! - `GET /metrics` – Task counters and structuring calls per phase.
//! - `GET /healthz` – Liveness.
//! - `GET /commands` – Machine-readable command catalog for quick discovery by tools/hosts.
//!
//! Every JSON response uses the `{ ok, data }` / `{ ok: false, error }` envelope.

use crate::service::{IncomingDocument, IntakeApi, IntakeError, MetricsReport, UploadedDocument};
use crate::tasks::{TaskInput, TaskView};
use axum::{
    Json, Router,
    extract::{
        DefaultBodyLimit, Multipart, Query, State,
        multipart::{MultipartError, MultipartRejection},
        rejection::JsonRejection,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

/// Multipart field carrying the uploaded file.
const UPLOAD_FIELD: &str = "file";

/// Room for multipart boundaries and part headers on top of the file itself.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// Build the HTTP router exposing the intake API surface.
pub fn create_router<S>(service: Arc<S>) -> Router
where
    S: IntakeApi + 'static,
{
    let upload_body_limit = service.upload_limit().saturating_add(MULTIPART_OVERHEAD);
    Router::new()
        .route("/parse-resume-task/start", post(start_task::<S>))
        .route("/parse-resume-task/status", get(task_status::<S>))
        .route(
            "/upload",
            post(upload_document::<S>).layer(DefaultBodyLimit::max(upload_body_limit)),
        )
        .route("/metrics", get(get_metrics::<S>))
        .route("/healthz", get(healthz))
        .route("/commands", get(get_commands))
        .with_state(service)
}

/// Success envelope.
#[derive(Serialize)]
struct Envelope<T> {
    ok: bool,
    data: T,
}

impl<T: Serialize> Envelope<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self { ok: true, data })
    }
}

/// Request body for `POST /parse-resume-task/start`.
#[derive(Deserialize)]
struct StartRequest {
    /// Storage reference (`key` or `bucket/key`) of an uploaded resume.
    #[serde(default, rename = "resumeFileUrl", alias = "documentRef")]
    resume_file_url: Option<String>,
    /// Already extracted resume text.
    #[serde(default, rename = "resumeText", alias = "text")]
    resume_text: Option<String>,
}

#[derive(Serialize)]
struct StartResponse {
    #[serde(rename = "taskId")]
    task_id: Uuid,
}

/// Validate the submission, create a task and dispatch it.
async fn start_task<S>(
    State(service): State<Arc<S>>,
    request: Result<Json<StartRequest>, JsonRejection>,
) -> Result<Json<Envelope<StartResponse>>, AppError>
where
    S: IntakeApi,
{
    let Json(request) = request.map_err(|rejection| AppError::BadRequest(rejection.body_text()))?;
    let input = TaskInput::from_parts(request.resume_file_url, request.resume_text)
        .map_err(IntakeError::from)?;
    let task_id = service.submit(input).await?;
    Ok(Envelope::ok(StartResponse { task_id }))
}

/// Query string for `GET /parse-resume-task/status`.
#[derive(Deserialize)]
struct StatusQuery {
    #[serde(default, rename = "taskId")]
    task_id: Option<String>,
}

/// Return the task's current status, result and error.
async fn task_status<S>(
    State(service): State<Arc<S>>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<Envelope<TaskView>>, AppError>
where
    S: IntakeApi,
{
    let raw = query
        .task_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| AppError::BadRequest("taskId is required".into()))?;
    let id = Uuid::parse_str(&raw)
        .map_err(|_| AppError::BadRequest(format!("taskId is not a valid task id: {raw}")))?;
    let view = service.status(id).await?;
    Ok(Envelope::ok(view))
}

/// Store the multipart `file` field and report where it landed.
async fn upload_document<S>(
    State(service): State<Arc<S>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<Envelope<UploadedDocument>>, AppError>
where
    S: IntakeApi,
{
    let mut multipart = multipart.map_err(|rejection| {
        AppError::BadRequest(format!(
            "use multipart/form-data with a `{UPLOAD_FIELD}` field: {}",
            rejection.body_text()
        ))
    })?;

    while let Some(field) = multipart.next_field().await.map_err(AppError::from)? {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }
        let Some(original_name) = field.file_name().map(str::to_string) else {
            break;
        };
        let content_type = field.content_type().map(str::to_string);
        let bytes = field.bytes().await.map_err(AppError::from)?;
        let stored = service
            .upload(IncomingDocument {
                original_name,
                content_type,
                bytes,
            })
            .await?;
        return Ok(Envelope::ok(stored));
    }
    Err(AppError::BadRequest(format!(
        "missing file (expected multipart field `{UPLOAD_FIELD}`)"
    )))
}

/// Return task counters and structuring calls per phase.
async fn get_metrics<S>(
    State(service): State<Arc<S>>,
) -> Result<Json<Envelope<MetricsReport>>, AppError>
where
    S: IntakeApi,
{
    let report = service.metrics().await?;
    Ok(Envelope::ok(report))
}

async fn healthz() -> Json<Envelope<&'static str>> {
    Envelope::ok("ok")
}

/// Descriptor for a single command in the discovery catalog.
#[derive(Serialize)]
struct CommandDescriptor {
    name: &'static str,
    method: &'static str,
    path: &'static str,
    description: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_example: Option<serde_json::Value>,
}

/// Response body for `GET /commands`.
#[derive(Serialize)]
struct CommandsResponse {
    commands: Vec<CommandDescriptor>,
}

/// Enumerate supported HTTP commands for discovery/UX in hosts and tools.
async fn get_commands() -> Json<CommandsResponse> {
    Json(CommandsResponse {
        commands: vec![
            CommandDescriptor {
                name: "start_task",
                method: "POST",
                path: "/parse-resume-task/start",
                description: "Create a background task that fetches, extracts and structures a resume. Provide exactly one of resumeFileUrl or resumeText. Response returns { \"ok\": true, \"data\": { \"taskId\": string } }.",
                request_example: Some(json!({
                    "resumeFileUrl": "resumes/resume_1700000000000.pdf"
                })),
            },
            CommandDescriptor {
                name: "task_status",
                method: "GET",
                path: "/parse-resume-task/status?taskId={taskId}",
                description: "Poll a task. data.status is pending, processing, done or error; data.result is set when done and data.error when error.",
                request_example: None,
            },
            CommandDescriptor {
                name: "upload",
                method: "POST",
                path: "/upload",
                description: "Upload a resume as multipart/form-data (field: file) into the default bucket. Response returns { \"ok\": true, \"data\": { \"filePath\": string, \"bucket\": string, \"originalName\": string } }; pass filePath as resumeFileUrl.",
                request_example: None,
            },
            CommandDescriptor {
                name: "metrics",
                method: "GET",
                path: "/metrics",
                description: "Task and extraction counters plus structuring calls per phase.",
                request_example: None,
            },
            CommandDescriptor {
                name: "healthz",
                method: "GET",
                path: "/healthz",
                description: "Liveness check.",
                request_example: None,
            },
        ],
    })
}

enum AppError {
    BadRequest(String),
    Multipart(MultipartError),
    Intake(IntakeError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            Self::Multipart(error) => (error.status(), error.body_text()),
            Self::Intake(error) => {
                let status = match &error {
                    IntakeError::Input(_)
                    | IntakeError::InvalidReference(_)
                    | IntakeError::EmptyUpload => StatusCode::BAD_REQUEST,
                    IntakeError::NotFound(_) => StatusCode::NOT_FOUND,
                    IntakeError::UploadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
                    IntakeError::Store(_) => {
                        tracing::error!(error = %error, "Task store failure");
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                    IntakeError::Upload(_) => {
                        tracing::error!(error = %error, "Upload to storage failed");
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                (status, error.to_string())
            }
        };
        (status, Json(json!({ "ok": false, "error": message }))).into_response()
    }
}

impl From<IntakeError> for AppError {
    fn from(inner: IntakeError) -> Self {
        Self::Intake(inner)
    }
}

impl From<MultipartError> for AppError {
    fn from(inner: MultipartError) -> Self {
        Self::Multipart(inner)
    }
}
