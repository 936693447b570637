use crate::models::{
    AddMessageRequest, ClearBufferResponse, CompressRequest, CompressResponse, CreateNoteRequest,
    ErrorResponse, HistoryQuery, ImportResponse, SetupResponse, SpeechRequest, SpeechResponse,
};
use crate::state::AppState;
use axum::{
    body::Body,
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post, put},
    Router,
};
use futures::channel::mpsc;
use kaede::{
    backup, clean_for_speech, validate_backup, ChatError, ChatRequest, CreateMemoryInput,
    KaedeError, LocalModelError, SavedNote, UpdateMemoryInput,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Chunks buffered between the upstream reader and the client
const RELAY_BUFFER: usize = 32;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/chat", post(chat))
        .route("/api/compress", post(compress))
        .route("/api/speech", post(speech))
        .route("/api/ollama", get(probe_ollama).post(proxy_ollama))
        .route("/api/memories", get(list_memories).post(create_memory))
        .route("/api/memories/:id", put(update_memory).delete(delete_memory))
        .route("/api/notes", get(list_notes).post(create_note))
        .route("/api/notes/:id", axum::routing::delete(delete_note))
        .route("/api/messages", get(buffer_messages).post(add_message))
        .route("/api/messages/clear", post(clear_buffer))
        .route("/api/history", get(history))
        .route("/api/backup", get(export_backup).post(import_backup))
        .route("/api/settings", get(get_settings).put(update_settings))
        .route("/api/setup/recheck", post(recheck_setup))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    let error = ErrorResponse {
        error: message.into(),
        details: None,
    };
    (status, Json(error)).into_response()
}

/// Handler error carrying the status it maps to
pub struct ApiError(Response);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        self.0
    }
}

impl From<KaedeError> for ApiError {
    fn from(err: KaedeError) -> Self {
        let response = match err {
            KaedeError::Validation(message) => error_response(StatusCode::BAD_REQUEST, message),
            KaedeError::NotFound(message) => error_response(StatusCode::NOT_FOUND, message),
            KaedeError::NotConfigured => {
                error_response(StatusCode::SERVICE_UNAVAILABLE, "tables_not_created")
            }
            other => {
                tracing::error!("request failed: {}", other);
                error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        };
        ApiError(response)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError(error_response(StatusCode::BAD_REQUEST, rejection.body_text()))
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

pub async fn health_check() -> StatusCode {
    StatusCode::OK
}

// ─── Chat ──────────────────────────────────────────────────────────────────

pub async fn chat(
    State(state): State<Arc<AppState>>,
    payload: std::result::Result<Json<ChatRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(mut request) = payload?;

    // Fields the caller left out come from the saved settings
    let settings = state.settings().await;
    request.mode.get_or_insert(settings.mode);
    request.max_tokens.get_or_insert(settings.max_tokens);
    request.temperature.get_or_insert(settings.temperature);
    request.model.get_or_insert(settings.cloud_model);

    let chat = state.chat().await;

    let turn = match chat.start(&request).await {
        Ok(turn) => turn,
        Err(ChatError::Kaede(err)) => return Err(err.into()),
        Err(ChatError::Gateway { source, .. }) => {
            return Ok(error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                source.public_message(),
            ))
        }
    };

    let (tx, rx) = mpsc::channel(RELAY_BUFFER);
    let local_missing = turn.prepared.local_missing();
    tokio::spawn(async move {
        let outcome = chat.relay(turn.stream, tx, local_missing).await;
        tracing::debug!(?outcome, "chat stream finished");
    });

    Ok((
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
        ],
        Body::from_stream(rx),
    )
        .into_response())
}

pub async fn compress(
    State(state): State<Arc<AppState>>,
    payload: std::result::Result<Json<CompressRequest>, JsonRejection>,
) -> ApiResult<Json<CompressResponse>> {
    let Json(request) = payload?;
    let message = request
        .message
        .filter(|m| !m.is_empty())
        .ok_or_else(|| KaedeError::Validation("Message is required".to_string()))?;

    let compression = state
        .chat()
        .await
        .compress(&message, request.file_content.as_deref())
        .await;

    Ok(Json(CompressResponse {
        compressed_context: compression.context,
        tokens_saved: compression.tokens_saved,
        compressed: compression.compressed,
    }))
}

/// Reply text made suitable for a voice synthesizer
pub async fn speech(
    payload: std::result::Result<Json<SpeechRequest>, JsonRejection>,
) -> ApiResult<Json<SpeechResponse>> {
    let Json(request) = payload?;
    Ok(Json(SpeechResponse {
        text: clean_for_speech(&request.text),
    }))
}

// ─── Local model ───────────────────────────────────────────────────────────

pub async fn probe_ollama(State(state): State<Arc<AppState>>) -> Response {
    let probe = state.local_client().await.probe().await;
    let status = if probe.reachable {
        StatusCode::OK
    } else {
        StatusCode::BAD_GATEWAY
    };
    (status, Json(probe)).into_response()
}

pub async fn proxy_ollama(
    State(state): State<Arc<AppState>>,
    payload: std::result::Result<Json<Value>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(body) = payload?;

    match state.local_client().await.proxy(body).await {
        Ok(data) => Ok(Json(data).into_response()),
        Err(err) => {
            tracing::error!("local model proxy error: {}", err);
            let message = match err {
                LocalModelError::Unreachable(_) => "Error conectando con Ollama",
                _ => "Error de Ollama",
            };
            let status =
                StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::BAD_GATEWAY);
            let body = ErrorResponse {
                error: message.to_string(),
                details: Some(err.guidance()),
            };
            Ok((status, Json(body)).into_response())
        }
    }
}

// ─── Memories ──────────────────────────────────────────────────────────────

pub async fn list_memories(State(state): State<Arc<AppState>>) -> ApiResult<Response> {
    let memories = state.kaede.store().list_memories().await?;
    Ok(Json(memories).into_response())
}

pub async fn create_memory(
    State(state): State<Arc<AppState>>,
    payload: std::result::Result<Json<CreateMemoryInput>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(input) = payload?;
    if input.content.trim().is_empty() {
        return Err(KaedeError::Validation("content is required".to_string()).into());
    }

    let memory = input.into_memory();
    state.kaede.store().save_memory(&memory).await?;
    Ok((StatusCode::CREATED, Json(memory)).into_response())
}

pub async fn update_memory(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    payload: std::result::Result<Json<UpdateMemoryInput>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(input) = payload?;
    let store = state.kaede.store();

    let mut memory = store
        .load_memory(&id)
        .await?
        .ok_or_else(|| KaedeError::NotFound(format!("Memory {} not found", id)))?;
    input.apply(&mut memory);
    store.update_memory(&memory).await?;

    Ok(Json(memory).into_response())
}

pub async fn delete_memory(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    if state.kaede.store().delete_memory(&id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(KaedeError::NotFound(format!("Memory {} not found", id)).into())
    }
}

// ─── Notes ─────────────────────────────────────────────────────────────────

pub async fn list_notes(State(state): State<Arc<AppState>>) -> ApiResult<Response> {
    let notes = state.kaede.store().list_notes().await?;
    Ok(Json(notes).into_response())
}

pub async fn create_note(
    State(state): State<Arc<AppState>>,
    payload: std::result::Result<Json<CreateNoteRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(request) = payload?;
    if request.content.trim().is_empty() {
        return Err(KaedeError::Validation("content is required".to_string()).into());
    }

    let note = SavedNote::new(request.content, request.message_id);
    state.kaede.store().save_note(&note).await?;
    Ok((StatusCode::CREATED, Json(note)).into_response())
}

pub async fn delete_note(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    if state.kaede.store().delete_note(&id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(KaedeError::NotFound(format!("Note {} not found", id)).into())
    }
}

// ─── Conversation buffer ───────────────────────────────────────────────────

pub async fn buffer_messages(State(state): State<Arc<AppState>>) -> ApiResult<Response> {
    let messages = state.kaede.store().buffer_messages().await?;
    Ok(Json(messages).into_response())
}

pub async fn add_message(
    State(state): State<Arc<AppState>>,
    payload: std::result::Result<Json<AddMessageRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(request) = payload?;
    let message = state
        .kaede
        .store()
        .add_message(request.role, &request.content)
        .await?;
    Ok((StatusCode::CREATED, Json(message)).into_response())
}

pub async fn clear_buffer(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<ClearBufferResponse>> {
    let archived = state.kaede.store().clear_buffer().await?;
    tracing::info!(archived, "conversation buffer cleared");
    Ok(Json(ClearBufferResponse { archived }))
}

pub async fn history(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HistoryQuery>,
) -> ApiResult<Response> {
    let limit = params.limit.unwrap_or(50).clamp(1, 500);
    let offset = params.offset.unwrap_or(0).max(0);
    let messages = state.kaede.store().history(limit, offset).await?;
    Ok(Json(messages).into_response())
}

// ─── Backup ────────────────────────────────────────────────────────────────

pub async fn export_backup(State(state): State<Arc<AppState>>) -> ApiResult<Response> {
    let data = state.kaede.export_backup().await?;
    let file_name = backup::todays_file_name();
    Ok((
        [(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", file_name),
        )],
        Json(data),
    )
        .into_response())
}

pub async fn import_backup(
    State(state): State<Arc<AppState>>,
    payload: std::result::Result<Json<Value>, JsonRejection>,
) -> ApiResult<Json<ImportResponse>> {
    let Json(raw) = payload
        .map_err(|_| KaedeError::Validation("No se pudo parsear el archivo JSON".to_string()))?;
    let data = validate_backup(&raw)?;
    let report = state.kaede.import_backup(&data).await?;

    Ok(Json(ImportResponse {
        message: report.to_string(),
        report,
    }))
}

// ─── Settings & setup ──────────────────────────────────────────────────────

pub async fn get_settings(State(state): State<Arc<AppState>>) -> Response {
    Json(state.settings().await).into_response()
}

pub async fn update_settings(
    State(state): State<Arc<AppState>>,
    payload: std::result::Result<Json<Value>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(patch) = payload?;
    let mut settings = state.settings.write().await;
    let updated = settings.merged(&patch)?;
    state.kaede.save_settings(&updated)?;
    *settings = updated.clone();
    Ok(Json(updated).into_response())
}

pub async fn recheck_setup(State(state): State<Arc<AppState>>) -> Json<SetupResponse> {
    let ready = state.kaede.recheck_setup().await;
    Json(SetupResponse { ready })
}
