use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use llm_translator::backup::{self, ImportReport, MergeReport};
use llm_translator::chats;
use llm_translator::commands;
use llm_translator::config::{Provider, SecretState, ServerConfig, Settings};
use llm_translator::db::{Database, TranslationRecord};
use llm_translator::error::TranslatorError;
use llm_translator::events::HostEvent;
use llm_translator::llm::LlmClient;
use llm_translator::translator::{
    self, ChatRunOutcome, MessageState, PromptKind, ToggleView, TranslateOutcome, Translator,
};
use llm_translator::AppState;

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,tower_http=info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting LLM translator server...");

    let config = ServerConfig::from_env();
    let db = Database::new(&config.database_path).expect("Failed to initialize database");
    let db = Arc::new(Mutex::new(db));

    let (tx, _rx) = tokio::sync::broadcast::channel(100);
    let client = LlmClient::new(&config.host_url, config.csrf_token.clone());
    let translator = Arc::new(Translator::new(db.clone(), client, tx.clone()));

    let (host_tx, host_rx) = tokio::sync::mpsc::channel(64);
    tokio::spawn(translator::run_event_loop(translator.clone(), host_rx));

    let state = AppState {
        db,
        translator,
        tx,
        host_events: host_tx,
    };

    let message_routes = Router::new()
        .route("/translate", post(translate_message))
        .route("/retranslate", post(retranslate_message))
        .route(
            "/translation",
            get(get_raw_translation).put(edit_translation).delete(delete_translation),
        )
        .route("/toggle", post(toggle_original))
        .route("/state", get(get_message_state));

    let app = Router::new()
        .route("/health", get(health_check))
        // Chat mirror
        .route("/api/chats/push", post(chats::push_chat))
        .route("/api/chats/pull", get(chats::pull_chat))
        .nest("/api/chats/:chat_id/messages/:message_id", message_routes)
        .route("/api/chats/:chat_id/translate-all", get(get_run_status).post(translate_all))
        .route("/api/chats/:chat_id/clear", post(clear_translations))
        .route("/api/chats/:chat_id/backup", post(upload_backup).delete(clear_backup))
        .route("/api/chats/:chat_id/restore", post(restore_backup))
        .route("/api/chats/:chat_id/commands", post(run_command))
        .route("/api/translate-text", post(translate_text))
        // Settings
        .route("/api/settings", get(get_settings).put(put_settings))
        .route("/api/settings/provider", put(select_provider))
        .route("/api/settings/model", put(select_model))
        .route("/api/secrets", get(get_secrets).put(put_secrets))
        .route("/api/providers", get(list_providers))
        // Cache maintenance
        .route("/api/cache", get(export_cache).delete(delete_cache))
        .route("/api/cache/import", post(import_cache))
        // Host bridge
        .route("/api/host-events", post(post_host_event))
        .route("/api/events", get(sse_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(state);

    let addr = format!("0.0.0.0:{}", config.port);

    tracing::info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}

// SSE Handler
use axum::response::sse::{Event, Sse};
use futures::stream::{Stream, StreamExt};
use std::convert::Infallible;

async fn sse_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    tracing::info!("New SSE connection established");
    let rx = state.tx.subscribe();

    let stream = tokio_stream::wrappers::BroadcastStream::new(rx).map(|msg| match msg {
        Ok(event) => {
            let data = serde_json::to_string(&event).unwrap_or_default();
            Ok(Event::default().data(data))
        }
        Err(_lag) => {
            tracing::warn!("SSE stream lagged");
            Ok(Event::default().comment("lagged"))
        }
    });

    Sse::new(stream).keep_alive(axum::response::sse::KeepAlive::default())
}

async fn health_check() -> &'static str {
    "OK"
}

fn reject(context: &str, e: TranslatorError) -> StatusCode {
    let status = e.status_code();
    if status.is_server_error() {
        tracing::error!("{}: {}", context, e);
    } else {
        tracing::warn!("{}: {}", context, e);
    }
    status
}

// === Message Handlers ===

#[derive(Debug, Default, Deserialize)]
pub struct TranslateRequest {
    #[serde(default)]
    pub force: bool,
}

async fn translate_message(
    State(state): State<AppState>,
    Path((chat_id, message_id)): Path<(String, i64)>,
    Json(req): Json<TranslateRequest>,
) -> Result<Json<TranslateOutcome>, StatusCode> {
    match state.translator.translate_one(&chat_id, message_id, req.force).await {
        Ok(outcome) => Ok(Json(outcome)),
        Err(e) => Err(reject("Failed to translate message", e)),
    }
}

async fn retranslate_message(
    State(state): State<AppState>,
    Path((chat_id, message_id)): Path<(String, i64)>,
) -> Result<Json<TranslateOutcome>, StatusCode> {
    match state.translator.retranslate(&chat_id, message_id).await {
        Ok(outcome) => Ok(Json(outcome)),
        Err(e) => Err(reject("Failed to retranslate message", e)),
    }
}

#[derive(Debug, Serialize)]
pub struct RawTranslation {
    pub translation: Option<String>,
}

async fn get_raw_translation(
    State(state): State<AppState>,
    Path((chat_id, message_id)): Path<(String, i64)>,
) -> Result<Json<RawTranslation>, StatusCode> {
    match state.translator.raw_translation(&chat_id, message_id).await {
        Ok(translation) => Ok(Json(RawTranslation { translation })),
        Err(e) => Err(reject("Failed to read translation", e)),
    }
}

#[derive(Debug, Deserialize)]
pub struct EditRequest {
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct DisplayResponse {
    pub display_text: String,
}

async fn edit_translation(
    State(state): State<AppState>,
    Path((chat_id, message_id)): Path<(String, i64)>,
    Json(req): Json<EditRequest>,
) -> Result<Json<DisplayResponse>, StatusCode> {
    match state.translator.edit_translation(&chat_id, message_id, &req.text).await {
        Ok(display_text) => Ok(Json(DisplayResponse { display_text })),
        Err(e) => Err(reject("Failed to edit translation", e)),
    }
}

async fn delete_translation(
    State(state): State<AppState>,
    Path((chat_id, message_id)): Path<(String, i64)>,
) -> Result<StatusCode, StatusCode> {
    match state.translator.delete_cached_translation(&chat_id, message_id).await {
        Ok(()) => Ok(StatusCode::NO_CONTENT),
        Err(e) => Err(reject("Failed to delete translation", e)),
    }
}

async fn toggle_original(
    State(state): State<AppState>,
    Path((chat_id, message_id)): Path<(String, i64)>,
) -> Result<Json<ToggleView>, StatusCode> {
    match state.translator.toggle_original(&chat_id, message_id).await {
        Ok(view) => Ok(Json(view)),
        Err(e) => Err(reject("Failed to toggle message", e)),
    }
}

#[derive(Debug, Serialize)]
pub struct StateResponse {
    pub state: MessageState,
}

async fn get_message_state(
    State(state): State<AppState>,
    Path((chat_id, message_id)): Path<(String, i64)>,
) -> Json<StateResponse> {
    Json(StateResponse { state: state.translator.message_state(&chat_id, message_id) })
}

// === Chat Handlers ===

#[derive(Debug, Default, Deserialize)]
pub struct TranslateAllRequest {
    #[serde(default)]
    pub confirmed: bool,
}

async fn translate_all(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    Json(req): Json<TranslateAllRequest>,
) -> Json<ChatRunOutcome> {
    Json(state.translator.start_translate_all(&chat_id, req.confirmed))
}

#[derive(Debug, Serialize)]
pub struct RunStatus {
    pub running: bool,
}

async fn get_run_status(State(state): State<AppState>, Path(chat_id): Path<String>) -> Json<RunStatus> {
    Json(RunStatus { running: state.translator.is_running(&chat_id) })
}

#[derive(Debug, Serialize)]
pub struct CountResponse {
    pub count: usize,
}

async fn clear_translations(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
) -> Result<Json<CountResponse>, StatusCode> {
    match state.translator.clear_translations(&chat_id).await {
        Ok(count) => Ok(Json(CountResponse { count })),
        Err(e) => Err(reject("Failed to clear translations", e)),
    }
}

async fn upload_backup(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
) -> Result<Json<CountResponse>, StatusCode> {
    let db = state.db.lock().await;
    match backup::upload_backup(&db, &chat_id) {
        Ok(count) => Ok(Json(CountResponse { count })),
        Err(e) => Err(reject("Failed to upload backup", e)),
    }
}

async fn restore_backup(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
) -> Result<Json<MergeReport>, StatusCode> {
    let db = state.db.lock().await;
    match backup::restore_backup(&db, &chat_id) {
        Ok(report) => Ok(Json(report)),
        Err(e) => Err(reject("Failed to restore backup", e)),
    }
}

async fn clear_backup(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
) -> Result<StatusCode, StatusCode> {
    let db = state.db.lock().await;
    match backup::clear_backup(&db, &chat_id) {
        Ok(true) => Ok(StatusCode::NO_CONTENT),
        Ok(false) => Err(StatusCode::NOT_FOUND),
        Err(e) => Err(reject("Failed to clear backup", e)),
    }
}

#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    pub command: String,
}

#[derive(Debug, Serialize)]
pub struct CommandResponse {
    pub result: String,
}

async fn run_command(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    Json(req): Json<CommandRequest>,
) -> Json<CommandResponse> {
    let result = commands::execute(&req.command, &state.translator, &state.db, &chat_id).await;
    Json(CommandResponse { result })
}

#[derive(Debug, Deserialize)]
pub struct TranslateTextRequest {
    pub text: String,
    /// "chat" (default) or "input".
    #[serde(default)]
    pub kind: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TranslateTextResponse {
    pub translation: String,
}

async fn translate_text(
    State(state): State<AppState>,
    Json(req): Json<TranslateTextRequest>,
) -> Result<Json<TranslateTextResponse>, StatusCode> {
    let kind = match req.kind.as_deref() {
        None | Some("chat") => PromptKind::Chat,
        Some("input") => PromptKind::Input,
        Some(_) => return Err(StatusCode::BAD_REQUEST),
    };
    match state.translator.translate_text(&req.text, kind).await {
        Ok(translation) => Ok(Json(TranslateTextResponse { translation })),
        Err(e) => Err(reject("Failed to translate text", e)),
    }
}

// === Settings Handlers ===

async fn get_settings(State(state): State<AppState>) -> Result<Json<Settings>, StatusCode> {
    let db = state.db.lock().await;
    match db.load_settings() {
        Ok(settings) => Ok(Json(settings)),
        Err(e) => Err(reject("Failed to load settings", e)),
    }
}

async fn put_settings(
    State(state): State<AppState>,
    body: String,
) -> Result<Json<Settings>, StatusCode> {
    let settings = Settings::from_json(&body).map_err(|e| {
        tracing::warn!("Rejected settings document: {}", e);
        StatusCode::BAD_REQUEST
    })?;
    if let Err(e) = settings.provider() {
        return Err(reject("Rejected settings", e));
    }
    let db = state.db.lock().await;
    match db.save_settings(&settings) {
        Ok(()) => Ok(Json(settings)),
        Err(e) => Err(reject("Failed to save settings", e)),
    }
}

#[derive(Debug, Deserialize)]
pub struct ProviderRequest {
    pub provider: String,
}

async fn select_provider(
    State(state): State<AppState>,
    Json(req): Json<ProviderRequest>,
) -> Result<Json<Settings>, StatusCode> {
    let provider: Provider = req.provider.parse().map_err(|e| reject("Rejected provider", e))?;
    let db = state.db.lock().await;
    let mut settings = db.load_settings().map_err(|e| reject("Failed to load settings", e))?;
    settings.select_provider(provider);
    db.save_settings(&settings).map_err(|e| reject("Failed to save settings", e))?;
    tracing::info!("Provider switched to {} ({})", provider, settings.model);
    Ok(Json(settings))
}

#[derive(Debug, Deserialize)]
pub struct ModelRequest {
    pub model: String,
}

async fn select_model(
    State(state): State<AppState>,
    Json(req): Json<ModelRequest>,
) -> Result<Json<Settings>, StatusCode> {
    if req.model.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    let db = state.db.lock().await;
    let mut settings = db.load_settings().map_err(|e| reject("Failed to load settings", e))?;
    settings.select_model(req.model.trim());
    db.save_settings(&settings).map_err(|e| reject("Failed to save settings", e))?;
    Ok(Json(settings))
}

async fn get_secrets(State(state): State<AppState>) -> Result<Json<SecretState>, StatusCode> {
    let db = state.db.lock().await;
    match db.load_secrets() {
        Ok(secrets) => Ok(Json(secrets)),
        Err(e) => Err(reject("Failed to load secrets", e)),
    }
}

async fn put_secrets(
    State(state): State<AppState>,
    Json(secrets): Json<SecretState>,
) -> Result<StatusCode, StatusCode> {
    let db = state.db.lock().await;
    match db.save_secrets(&secrets) {
        Ok(()) => Ok(StatusCode::NO_CONTENT),
        Err(e) => Err(reject("Failed to save secrets", e)),
    }
}

#[derive(Debug, Serialize)]
pub struct ProviderInfo {
    pub provider: Provider,
    pub default_model: &'static str,
    pub models: &'static [&'static str],
}

async fn list_providers() -> Json<Vec<ProviderInfo>> {
    Json(
        Provider::ALL
            .iter()
            .map(|p| ProviderInfo { provider: *p, default_model: p.default_model(), models: p.models() })
            .collect(),
    )
}

// === Cache Handlers ===

async fn export_cache(State(state): State<AppState>) -> Result<Json<Vec<TranslationRecord>>, StatusCode> {
    let db = state.db.lock().await;
    match db.get_all_translations() {
        Ok(records) => Ok(Json(records)),
        Err(e) => Err(reject("Failed to export cache", e)),
    }
}

async fn import_cache(
    State(state): State<AppState>,
    body: String,
) -> Result<Json<ImportReport>, StatusCode> {
    let records = backup::parse_records(&body).map_err(|e| reject("Rejected import", e))?;
    let db = state.db.lock().await;
    match backup::import_records(&db, &records) {
        Ok(report) => Ok(Json(report)),
        Err(e) => Err(reject("Failed to import cache", e)),
    }
}

async fn delete_cache(State(state): State<AppState>) -> Result<Json<CountResponse>, StatusCode> {
    let db = state.db.lock().await;
    match db.delete_all_translations() {
        Ok(count) => {
            tracing::info!("Deleted {} cached translations", count);
            Ok(Json(CountResponse { count }))
        }
        Err(e) => Err(reject("Failed to delete cache", e)),
    }
}

async fn post_host_event(
    State(state): State<AppState>,
    Json(event): Json<HostEvent>,
) -> Result<StatusCode, StatusCode> {
    match state.host_events.send(event).await {
        Ok(()) => Ok(StatusCode::ACCEPTED),
        Err(e) => {
            tracing::error!("Host event loop is gone: {}", e);
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}
