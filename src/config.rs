use crate::error::TranslatorError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Process-level configuration read from the environment at startup.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: String,
    pub database_path: String,
    pub host_url: String,
    pub csrf_token: Option<String>,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        ServerConfig {
            port: std::env::var("PORT").unwrap_or_else(|_| "3002".to_string()),
            database_path: std::env::var("DATABASE_PATH")
                .unwrap_or_else(|_| "llm_translator.db".to_string()),
            host_url: std::env::var("HOST_URL")
                .unwrap_or_else(|_| "http://localhost:8000".to_string()),
            csrf_token: std::env::var("HOST_CSRF_TOKEN").ok().filter(|t| !t.is_empty()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAi,
    Claude,
    Google,
    Cohere,
}

impl Provider {
    pub const ALL: [Provider; 4] = [
        Provider::OpenAi,
        Provider::Claude,
        Provider::Google,
        Provider::Cohere,
    ];

    pub fn tag(&self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::Claude => "claude",
            Provider::Google => "google",
            Provider::Cohere => "cohere",
        }
    }

    /// Value of `chat_completion_source` the host backend routes on.
    pub fn completion_source(&self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::Claude => "claude",
            Provider::Google => "makersuite",
            Provider::Cohere => "cohere",
        }
    }

    /// Key into the host's secret table.
    pub fn secret_key(&self) -> &'static str {
        match self {
            Provider::OpenAi => "api_key_openai",
            Provider::Claude => "api_key_claude",
            Provider::Google => "api_key_makersuite",
            Provider::Cohere => "api_key_cohere",
        }
    }

    pub fn assistant_role(&self) -> &'static str {
        match self {
            Provider::Google => "model",
            _ => "assistant",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            Provider::OpenAi => "gpt-4o-mini",
            Provider::Claude => "claude-3-5-sonnet-20241022",
            Provider::Google => "gemini-1.5-pro",
            Provider::Cohere => "command",
        }
    }

    pub fn models(&self) -> &'static [&'static str] {
        match self {
            Provider::OpenAi => &[
                "gpt-3.5-turbo",
                "gpt-4",
                "gpt-4-turbo",
                "gpt-4o",
                "chatgpt-4o-latest",
                "gpt-4o-mini",
                "o1-preview",
                "o1-mini",
            ],
            Provider::Claude => &[
                "claude-3-5-sonnet-20241022",
                "claude-3-5-sonnet-20240620",
                "claude-3-5-haiku-20241022",
                "claude-3-opus-20240229",
                "claude-3-sonnet-20240229",
                "claude-3-haiku-20240307",
                "claude-2.1",
            ],
            Provider::Google => &[
                "gemini-1.5-pro",
                "gemini-1.5-pro-latest",
                "gemini-1.5-flash",
                "gemini-1.5-flash-8b",
                "gemini-1.5-flash-latest",
                "gemini-1.0-pro",
                "gemini-pro",
            ],
            Provider::Cohere => &[
                "c4ai-aya-expanse-32b",
                "c4ai-aya-expanse-8b",
                "command-light",
                "command",
                "command-r",
                "command-r-plus",
                "command-r-plus-08-2024",
            ],
        }
    }

    fn default_parameters(&self) -> ProviderParameters {
        let base = ProviderParameters {
            max_length: 1000,
            temperature: 0.7,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            top_k: 0.0,
            top_p: 0.99,
        };
        match self {
            Provider::OpenAi => ProviderParameters {
                frequency_penalty: 0.2,
                presence_penalty: 0.5,
                ..base
            },
            _ => base,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for Provider {
    type Err = TranslatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Provider::OpenAi),
            "claude" => Ok(Provider::Claude),
            "google" => Ok(Provider::Google),
            "cohere" => Ok(Provider::Cohere),
            other => Err(TranslatorError::UnsupportedProvider(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DisplayMode {
    #[default]
    Disabled,
    Folded,
    Unfolded,
}

/// Which freshly rendered messages are translated without being asked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AutoMode {
    Off,
    Responses,
    Inputs,
    #[default]
    Both,
}

impl AutoMode {
    pub fn covers(&self, is_user: bool) -> bool {
        match self {
            AutoMode::Off => false,
            AutoMode::Responses => !is_user,
            AutoMode::Inputs => is_user,
            AutoMode::Both => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderParameters {
    /// Zero means "let the provider decide" and drops `max_tokens`.
    pub max_length: u32,
    pub temperature: f64,
    pub frequency_penalty: f64,
    pub presence_penalty: f64,
    pub top_k: f64,
    pub top_p: f64,
}

impl Default for ProviderParameters {
    fn default() -> Self {
        Provider::Claude.default_parameters()
    }
}

/// Translator settings, persisted as one JSON document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub provider: String,
    pub model: String,
    pub provider_model_history: BTreeMap<String, String>,
    pub parameters: BTreeMap<String, ProviderParameters>,
    pub prompt_chat: String,
    pub prompt_input: String,
    pub prefill_enabled: bool,
    pub prefill_content: String,
    pub display_mode: DisplayMode,
    pub auto_mode: AutoMode,
    pub throttle_delay_ms: u64,
    pub reverse_proxy: Option<String>,
    pub proxy_password: Option<String>,
    pub user_name: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            provider: Provider::OpenAi.tag().to_string(),
            model: Provider::OpenAi.default_model().to_string(),
            provider_model_history: Provider::ALL
                .iter()
                .map(|p| (p.tag().to_string(), p.default_model().to_string()))
                .collect(),
            parameters: Provider::ALL
                .iter()
                .map(|p| (p.tag().to_string(), p.default_parameters()))
                .collect(),
            prompt_chat: "Please translate the following text to korean:".to_string(),
            prompt_input: "Please translate the following text to english:".to_string(),
            prefill_enabled: false,
            prefill_content: "Understood. Here is the translation:".to_string(),
            display_mode: DisplayMode::Disabled,
            auto_mode: AutoMode::Both,
            throttle_delay_ms: 0,
            reverse_proxy: None,
            proxy_password: None,
            user_name: "User".to_string(),
        }
    }
}

impl Settings {
    /// Parses a stored settings document, filling every missing key from the
    /// defaults (nested provider maps included). A partial parameter entry
    /// is laid over that provider's own defaults, field by field.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        let mut value: Value = serde_json::from_str(raw)?;
        if let Some(parameters) = value.get_mut("parameters").and_then(Value::as_object_mut) {
            for (tag, entry) in parameters.iter_mut() {
                let (Ok(provider), Some(fields)) = (tag.parse::<Provider>(), entry.as_object()) else {
                    continue;
                };
                let mut merged = serde_json::to_value(provider.default_parameters())?;
                if let Some(base) = merged.as_object_mut() {
                    for (key, field) in fields {
                        base.insert(key.clone(), field.clone());
                    }
                }
                *entry = merged;
            }
        }

        let mut settings: Settings = serde_json::from_value(value)?;
        settings.backfill();
        Ok(settings)
    }

    pub fn backfill(&mut self) {
        let defaults = Settings::default();
        for (tag, params) in defaults.parameters {
            self.parameters.entry(tag).or_insert(params);
        }
        for (tag, model) in defaults.provider_model_history {
            self.provider_model_history.entry(tag).or_insert(model);
        }
    }

    pub fn provider(&self) -> Result<Provider, TranslatorError> {
        self.provider.parse()
    }

    pub fn parameters_for(&self, provider: Provider) -> ProviderParameters {
        self.parameters
            .get(provider.tag())
            .copied()
            .unwrap_or_else(|| provider.default_parameters())
    }

    pub fn has_reverse_proxy(&self) -> bool {
        self.reverse_proxy.as_deref().is_some_and(|url| !url.trim().is_empty())
    }

    /// Switches provider and restores the model last used with it.
    pub fn select_provider(&mut self, provider: Provider) {
        self.provider = provider.tag().to_string();
        let model = self
            .provider_model_history
            .get(provider.tag())
            .cloned()
            .unwrap_or_else(|| provider.default_model().to_string());
        self.provider_model_history
            .insert(provider.tag().to_string(), model.clone());
        self.model = model;
    }

    pub fn select_model(&mut self, model: &str) {
        self.model = model.to_string();
        self.provider_model_history
            .insert(self.provider.clone(), model.to_string());
    }
}

/// Which host secrets are configured. The key material itself stays with the host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecretState(pub BTreeMap<String, bool>);

impl SecretState {
    pub fn is_set(&self, provider: Provider) -> bool {
        self.0.get(provider.secret_key()).copied().unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_are_backfilled() {
        let settings = Settings::from_json(
            r#"{"provider":"claude","parameters":{"claude":{"temperature":0.3}}}"#,
        )
        .unwrap();

        assert_eq!(settings.provider, "claude");
        assert_eq!(settings.prompt_chat, Settings::default().prompt_chat);
        assert_eq!(settings.parameters.len(), 4);
        let claude = settings.parameters_for(Provider::Claude);
        assert_eq!(claude.temperature, 0.3);
        assert_eq!(claude.max_length, 1000);
        assert_eq!(settings.parameters_for(Provider::OpenAi).presence_penalty, 0.5);
    }

    #[test]
    fn partial_openai_entry_keeps_openai_defaults() {
        let settings =
            Settings::from_json(r#"{"parameters":{"openai":{"temperature":0.3}}}"#).unwrap();

        let openai = settings.parameters_for(Provider::OpenAi);
        assert_eq!(openai.temperature, 0.3);
        assert_eq!(openai.frequency_penalty, 0.2);
        assert_eq!(openai.presence_penalty, 0.5);
        assert_eq!(openai.top_p, 0.99);
    }

    #[test]
    fn provider_switch_restores_last_model() {
        let mut settings = Settings::default();
        settings.select_provider(Provider::Claude);
        settings.select_model("claude-3-opus-20240229");
        settings.select_provider(Provider::OpenAi);
        assert_eq!(settings.model, "gpt-4o-mini");
        settings.select_provider(Provider::Claude);
        assert_eq!(settings.model, "claude-3-opus-20240229");
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let err = "mistral".parse::<Provider>().unwrap_err();
        assert!(matches!(err, TranslatorError::UnsupportedProvider(tag) if tag == "mistral"));
    }

    #[test]
    fn auto_mode_filters_by_author() {
        assert!(AutoMode::Responses.covers(false));
        assert!(!AutoMode::Responses.covers(true));
        assert!(AutoMode::Inputs.covers(true));
        assert!(!AutoMode::Off.covers(false));
    }
}
