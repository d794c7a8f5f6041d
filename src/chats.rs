use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use crate::{AppState, db::{Chat, ChatMessage}};

#[derive(Debug, Deserialize, Serialize)]
pub struct PushRequest {
    pub chat_id: String,
    pub user_name: Option<String>,
    /// Left untouched when absent, so a backup stored here survives plain pushes.
    pub metadata: Option<Map<String, Value>>,
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Deserialize)]
pub struct PullQuery {
    pub chat_id: String,
}

#[derive(Debug, Serialize)]
pub struct PullResponse {
    pub chat: Chat,
    pub messages: Vec<ChatMessage>,
}

// ============================================================
// HANDLERS
// ============================================================

pub async fn push_chat(
    State(state): State<AppState>,
    Json(req): Json<PushRequest>,
) -> Result<StatusCode, StatusCode> {
    if req.chat_id.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    let mut db = state.db.lock().await;

    let metadata = match req.metadata {
        Some(metadata) => metadata,
        None => match db.get_chat(&req.chat_id) {
            Ok(existing) => existing.map(|c| c.metadata).unwrap_or_default(),
            Err(e) => {
                tracing::error!("Failed to read chat {}: {}", req.chat_id, e);
                return Err(StatusCode::INTERNAL_SERVER_ERROR);
            }
        },
    };

    let chat = Chat { chat_id: req.chat_id.clone(), user_name: req.user_name, metadata };
    if let Err(e) = db.upsert_chat(&chat) {
        tracing::error!("Failed to store chat {}: {}", chat.chat_id, e);
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }

    if let Err(e) = db.sync_chat_messages(&chat.chat_id, &req.messages) {
        tracing::error!("Failed to sync messages for chat {}: {}", chat.chat_id, e);
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }

    tracing::info!("Synced chat {} ({} messages)", chat.chat_id, req.messages.len());
    Ok(StatusCode::OK)
}

pub async fn pull_chat(
    State(state): State<AppState>,
    Query(query): Query<PullQuery>,
) -> Result<Json<PullResponse>, StatusCode> {
    let db = state.db.lock().await;

    let chat = match db.get_chat(&query.chat_id) {
        Ok(Some(chat)) => chat,
        Ok(None) => return Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!("Failed to get chat {}: {}", query.chat_id, e);
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    match db.get_chat_messages(&query.chat_id) {
        Ok(messages) => Ok(Json(PullResponse { chat, messages })),
        Err(e) => {
            tracing::error!("Failed to get messages for chat {}: {}", query.chat_id, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
