use crate::config::{Provider, SecretState, Settings};
use crate::error::{Result, TranslatorError};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const GENERATE_PATH: &str = "/api/backends/chat-completions/generate";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Message {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct TranslationRequest {
    pub provider: Provider,
    pub model: String,
    pub endpoint: String,
    pub payload: Value,
}

/// Builds the chat-completions payload for the configured provider.
pub fn build_request(
    text: &str,
    prompt: &str,
    settings: &Settings,
    secrets: &SecretState,
) -> Result<TranslationRequest> {
    let provider = settings.provider()?;

    if !secrets.is_set(provider) && !settings.has_reverse_proxy() {
        return Err(TranslatorError::MissingCredential(provider.tag().to_uppercase()));
    }

    let params = settings.parameters_for(provider);
    let mut messages = vec![Message {
        role: "user".to_string(),
        content: format!("{}\n\n\"{}\"", prompt, text),
    }];
    if settings.prefill_enabled && !settings.prefill_content.trim().is_empty() {
        messages.push(Message {
            role: provider.assistant_role().to_string(),
            content: settings.prefill_content.clone(),
        });
    }

    let mut payload = Map::new();
    payload.insert("model".into(), Value::from(settings.model.clone()));
    payload.insert("messages".into(), serde_json::to_value(&messages)?);
    payload.insert("temperature".into(), Value::from(params.temperature));
    if params.max_length > 0 {
        payload.insert("max_tokens".into(), Value::from(params.max_length));
    }
    payload.insert("stream".into(), Value::Bool(false));
    payload.insert("chat_completion_source".into(), Value::from(provider.completion_source()));

    match provider {
        Provider::OpenAi => {
            payload.insert("frequency_penalty".into(), Value::from(params.frequency_penalty));
            payload.insert("presence_penalty".into(), Value::from(params.presence_penalty));
            payload.insert("top_p".into(), Value::from(params.top_p));
        }
        Provider::Claude | Provider::Google => {
            payload.insert("top_k".into(), Value::from(params.top_k));
            payload.insert("top_p".into(), Value::from(params.top_p));
        }
        Provider::Cohere => {
            payload.insert("frequency_penalty".into(), Value::from(params.frequency_penalty));
            payload.insert("presence_penalty".into(), Value::from(params.presence_penalty));
            payload.insert("top_k".into(), Value::from(params.top_k));
            payload.insert("top_p".into(), Value::from(params.top_p));
        }
    }

    if let Some(proxy) = settings.reverse_proxy.as_deref().filter(|p| !p.trim().is_empty()) {
        payload.insert("reverse_proxy".into(), Value::from(proxy));
        if let Some(password) = settings.proxy_password.as_deref() {
            payload.insert("proxy_password".into(), Value::from(password));
        }
    }

    Ok(TranslationRequest {
        provider,
        model: settings.model.clone(),
        endpoint: GENERATE_PATH.to_string(),
        payload: Value::Object(payload),
    })
}

fn text_at<'a>(body: &'a Value, pointer: &str) -> Option<&'a str> {
    body.pointer(pointer)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Pulls the translated text out of a provider response, trying each known
/// response shape in order.
pub fn extract_result(provider: Provider, body: &Value) -> Option<String> {
    let paths: &[&str] = match provider {
        Provider::OpenAi => &["/choices/0/message/content"],
        Provider::Claude => &["/content/0/text"],
        Provider::Google => &[
            "/candidates/0/content",
            "/candidates/0/content/parts/0/text",
            "/choices/0/message/content",
            "/text",
        ],
        Provider::Cohere => &[
            "/message/content/0/text",
            "/generations/0/text",
            "/text",
            "/choices/0/message/content",
            "/content/0/text",
        ],
    };

    paths
        .iter()
        .find_map(|path| text_at(body, path))
        .map(str::to_string)
}

/// Client for the host's chat-completions proxy endpoint.
#[derive(Clone)]
pub struct LlmClient {
    client: Client,
    base_url: String,
    csrf_token: Option<String>,
}

impl LlmClient {
    pub fn new(base_url: &str, csrf_token: Option<String>) -> Self {
        LlmClient {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            csrf_token,
        }
    }

    pub async fn send(&self, request: &TranslationRequest) -> Result<String> {
        let url = format!("{}{}", self.base_url, request.endpoint);

        let mut builder = self.client.post(&url).json(&request.payload);
        if let Some(token) = &self.csrf_token {
            builder = builder.header("X-CSRF-Token", token);
        }

        let response = builder.send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            tracing::error!("Translation request failed ({}): {}", status, body);
            return Err(TranslatorError::TranslationHttp { status, body });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|_| TranslatorError::EmptyResult(request.provider.tag().to_string()))?;

        extract_result(request.provider, &body)
            .ok_or_else(|| TranslatorError::EmptyResult(request.provider.tag().to_string()))
    }

    pub async fn translate(
        &self,
        text: &str,
        prompt: &str,
        settings: &Settings,
        secrets: &SecretState,
    ) -> Result<String> {
        let request = build_request(text, prompt, settings, secrets)?;
        tracing::debug!(
            "Sending translation request via {} ({})",
            request.provider,
            request.model
        );
        self.send(&request).await
    }
}
