use axum::http::StatusCode;
use thiserror::Error;

pub type Result<T, E = TranslatorError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum TranslatorError {
    #[error("Unsupported provider: {0}")]
    UnsupportedProvider(String),

    #[error("{0} API key is not configured")]
    MissingCredential(String),

    #[error("Translation request failed ({status}): {body}")]
    TranslationHttp { status: u16, body: String },

    #[error("Could not extract a translation from the {0} response")]
    EmptyResult(String),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Message {0} is already being translated")]
    Busy(String),

    #[error("Message {0} changed while it was being translated")]
    Stale(String),
}

impl TranslatorError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            TranslatorError::UnsupportedProvider(_)
            | TranslatorError::MissingCredential(_)
            | TranslatorError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            TranslatorError::NotFound(_) => StatusCode::NOT_FOUND,
            TranslatorError::Busy(_) | TranslatorError::Stale(_) => StatusCode::CONFLICT,
            TranslatorError::TranslationHttp { .. }
            | TranslatorError::EmptyResult(_)
            | TranslatorError::Network(_) => StatusCode::BAD_GATEWAY,
            TranslatorError::Storage(_) | TranslatorError::Serialization(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_error_kind() {
        assert_eq!(
            TranslatorError::NotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            TranslatorError::Busy("3".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            TranslatorError::TranslationHttp { status: 500, body: "boom".into() }.status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn http_error_message_carries_body() {
        let err = TranslatorError::TranslationHttp { status: 429, body: "rate limited".into() };
        assert_eq!(err.to_string(), "Translation request failed (429): rate limited");
    }
}
