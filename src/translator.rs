use crate::config::Settings;
use crate::db::{ChatMessage, Database};
use crate::error::{Result, TranslatorError};
use crate::events::{HostEvent, NoticeLevel, TranslatorEvent};
use crate::llm::LlmClient;
use crate::reconstruct::reconstruct;
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::{sleep, Duration};
use uuid::Uuid;

static USER_MACRO_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\{\{user\}\}|<USER>").expect("user macro regex"));
static CHAR_MACRO_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\{\{char\}\}|<BOT>").expect("char macro regex"));

type MessageKey = (String, i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    Idle,
    InProgress,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "display_text", rename_all = "snake_case")]
pub enum TranslateOutcome {
    /// Display text already present and the call was not forced.
    Skipped,
    Cached(String),
    Translated(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    Chat,
    Input,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRunStatus {
    Completed,
    Cancelled,
    Failed,
}

impl ChatRunStatus {
    fn as_str(&self) -> &'static str {
        match self {
            ChatRunStatus::Completed => "completed",
            ChatRunStatus::Cancelled => "cancelled",
            ChatRunStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatRunReport {
    pub run_id: String,
    pub status: ChatRunStatus,
    pub translated: usize,
    pub total: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ChatRunOutcome {
    /// The host must ask the user and call again with confirmation.
    AwaitingConfirmation,
    Started { run_id: String },
    CancelRequested { run_id: String },
    Finished(ChatRunReport),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToggleView {
    pub showing_original: bool,
    pub text: String,
}

struct RunHandle {
    run_id: String,
    cancel: AtomicBool,
}

enum Prepared {
    Ready(Arc<RunHandle>),
    Done(ChatRunOutcome),
}

/// Resets the per-message state when a translation ends, including when the
/// future is dropped mid-flight.
struct InFlight<'a> {
    states: &'a StdMutex<HashMap<MessageKey, MessageState>>,
    key: MessageKey,
    outcome: MessageState,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        states.insert(self.key.clone(), self.outcome);
    }
}

pub fn substitute_params(text: &str, user_name: &str, char_name: &str) -> String {
    let text = USER_MACRO_RE.replace_all(text, regex::NoExpand(user_name));
    CHAR_MACRO_RE
        .replace_all(&text, regex::NoExpand(char_name))
        .into_owned()
}

pub struct Translator {
    db: Arc<Mutex<Database>>,
    client: LlmClient,
    tx: broadcast::Sender<TranslatorEvent>,
    states: StdMutex<HashMap<MessageKey, MessageState>>,
    runs: StdMutex<HashMap<String, Arc<RunHandle>>>,
    showing_original: StdMutex<HashSet<MessageKey>>,
}

impl Translator {
    pub fn new(
        db: Arc<Mutex<Database>>,
        client: LlmClient,
        tx: broadcast::Sender<TranslatorEvent>,
    ) -> Self {
        Translator {
            db,
            client,
            tx,
            states: StdMutex::new(HashMap::new()),
            runs: StdMutex::new(HashMap::new()),
            showing_original: StdMutex::new(HashSet::new()),
        }
    }

    pub fn notify(&self, level: NoticeLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            NoticeLevel::Error => tracing::error!("[Translator] {}", message),
            NoticeLevel::Warning => tracing::warn!("[Translator] {}", message),
            _ => tracing::info!("[Translator] {}", message),
        }
        let _ = self.tx.send(TranslatorEvent::Notice { level, message });
    }

    pub fn message_state(&self, chat_id: &str, message_id: i64) -> MessageState {
        let states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        states
            .get(&(chat_id.to_string(), message_id))
            .copied()
            .unwrap_or(MessageState::Idle)
    }

    fn begin(&self, chat_id: &str, message_id: i64) -> Result<InFlight<'_>> {
        let key = (chat_id.to_string(), message_id);
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        if states.get(&key) == Some(&MessageState::InProgress) {
            return Err(TranslatorError::Busy(message_id.to_string()));
        }
        states.insert(key.clone(), MessageState::InProgress);
        Ok(InFlight { states: &self.states, key, outcome: MessageState::Failed })
    }

    async fn load_context(&self, chat_id: &str, message_id: i64) -> Result<(ChatMessage, String, Settings)> {
        let db = self.db.lock().await;
        let message = db
            .get_chat_message(chat_id, message_id)?
            .ok_or_else(|| TranslatorError::NotFound(format!("message {} in chat {}", message_id, chat_id)))?;
        let settings = db.load_settings()?;
        let user_name = db
            .get_chat(chat_id)?
            .and_then(|c| c.user_name)
            .unwrap_or_else(|| settings.user_name.clone());
        let original = substitute_params(&message.mes, &user_name, &message.name);
        Ok((message, original, settings))
    }

    fn render(&self, settings: &Settings, original: &str, translation: &str) -> String {
        let result = reconstruct(settings.display_mode, original, Some(translation));
        if let Some(warning) = result.warning {
            self.notify(NoticeLevel::Warning, warning.to_string());
        }
        result.text
    }

    /// Writes or clears the display text of the stored message. Only that key
    /// of `extra` changes, and nothing is written if the message text is no
    /// longer `expected_mes`.
    async fn apply_display(
        &self,
        chat_id: &str,
        message_id: i64,
        expected_mes: &str,
        display: Option<&str>,
    ) -> Result<()> {
        {
            let db = self.db.lock().await;
            let mut current = db
                .get_chat_message(chat_id, message_id)?
                .ok_or_else(|| TranslatorError::NotFound(format!("message {} in chat {}", message_id, chat_id)))?;
            if current.mes != expected_mes {
                return Err(TranslatorError::Stale(message_id.to_string()));
            }
            match display {
                Some(text) => current.set_display_text(text),
                None => {
                    current.clear_display_text();
                }
            }
            db.update_message_extra(chat_id, message_id, &current.extra)?;
        }
        self.showing_original
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(chat_id.to_string(), message_id));

        let _ = self.tx.send(TranslatorEvent::MessageUpdated {
            chat_id: chat_id.to_string(),
            message_id,
            display_text: display.map(str::to_string),
        });
        Ok(())
    }

    /// Translates one message, serving from the cache when possible.
    pub async fn translate_one(&self, chat_id: &str, message_id: i64, force: bool) -> Result<TranslateOutcome> {
        self.guarded(chat_id, message_id, force, false).await
    }

    /// Translates one message again, ignoring and then replacing the cached record.
    pub async fn retranslate(&self, chat_id: &str, message_id: i64) -> Result<TranslateOutcome> {
        self.guarded(chat_id, message_id, true, true).await
    }

    async fn guarded(&self, chat_id: &str, message_id: i64, force: bool, bypass_cache: bool) -> Result<TranslateOutcome> {
        let mut in_flight = match self.begin(chat_id, message_id) {
            Ok(guard) => guard,
            Err(e) => {
                self.notify(NoticeLevel::Warning, format!("Message {} is already being translated", message_id));
                return Err(e);
            }
        };

        match self.translate_message(chat_id, message_id, force, bypass_cache).await {
            Ok(outcome) => {
                in_flight.outcome = MessageState::Done;
                Ok(outcome)
            }
            Err(e @ TranslatorError::Stale(_)) => {
                self.notify(NoticeLevel::Warning, format!("{}; result discarded", e));
                Err(e)
            }
            Err(e) => {
                self.notify(NoticeLevel::Error, format!("Translation failed: {}", e));
                Err(e)
            }
        }
    }

    async fn translate_message(
        &self,
        chat_id: &str,
        message_id: i64,
        force: bool,
        bypass_cache: bool,
    ) -> Result<TranslateOutcome> {
        let (message, original, settings) = self.load_context(chat_id, message_id).await?;
        if !force && message.display_text().is_some() {
            return Ok(TranslateOutcome::Skipped);
        }

        let cached = if bypass_cache {
            None
        } else {
            let db = self.db.lock().await;
            db.get_translation(&original).unwrap_or_else(|e| {
                tracing::warn!("[Translator] Cache lookup failed, translating instead: {}", e);
                None
            })
        };

        if let Some(translation) = cached {
            tracing::debug!("[Translator] Cache hit for message {}", message_id);
            let display = self.render(&settings, &original, &translation);
            self.apply_display(chat_id, message_id, &message.mes, Some(&display)).await?;
            return Ok(TranslateOutcome::Cached(display));
        }

        let secrets = self.db.lock().await.load_secrets()?;
        let translation = self
            .client
            .translate(&original, &settings.prompt_chat, &settings, &secrets)
            .await?;

        let stored = {
            let db = self.db.lock().await;
            let timestamp = Utc::now().to_rfc3339();
            db.upsert_translation(&original, &translation, &settings.provider, &settings.model, &timestamp)
        };
        if let Err(e) = stored {
            self.notify(NoticeLevel::Warning, format!("Could not cache translation: {}", e));
        }

        let display = self.render(&settings, &original, &translation);
        self.apply_display(chat_id, message_id, &message.mes, Some(&display)).await?;
        Ok(TranslateOutcome::Translated(display))
    }

    fn prepare_run(&self, chat_id: &str, confirmed: bool) -> Prepared {
        let mut runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = runs.get(chat_id) {
            handle.cancel.store(true, Ordering::SeqCst);
            tracing::info!("[Translator] Cancellation requested for run {}", handle.run_id);
            return Prepared::Done(ChatRunOutcome::CancelRequested { run_id: handle.run_id.clone() });
        }
        if !confirmed {
            return Prepared::Done(ChatRunOutcome::AwaitingConfirmation);
        }
        let handle = Arc::new(RunHandle {
            run_id: Uuid::new_v4().to_string(),
            cancel: AtomicBool::new(false),
        });
        runs.insert(chat_id.to_string(), handle.clone());
        Prepared::Ready(handle)
    }

    /// Runs a whole-chat translation to completion. Calling it while a run is
    /// active for the chat requests cancellation of that run instead.
    pub async fn translate_all(&self, chat_id: &str, confirmed: bool) -> ChatRunOutcome {
        match self.prepare_run(chat_id, confirmed) {
            Prepared::Done(outcome) => outcome,
            Prepared::Ready(handle) => ChatRunOutcome::Finished(self.execute_run(chat_id, handle).await),
        }
    }

    /// Same as [`Translator::translate_all`] but runs in the background.
    pub fn start_translate_all(self: &Arc<Self>, chat_id: &str, confirmed: bool) -> ChatRunOutcome {
        match self.prepare_run(chat_id, confirmed) {
            Prepared::Done(outcome) => outcome,
            Prepared::Ready(handle) => {
                let run_id = handle.run_id.clone();
                let translator = Arc::clone(self);
                let chat_id = chat_id.to_string();
                tokio::spawn(async move {
                    translator.execute_run(&chat_id, handle).await;
                });
                ChatRunOutcome::Started { run_id }
            }
        }
    }

    fn emit_run(&self, chat_id: &str, run_id: &str, status: &str, translated: usize, total: usize) {
        let _ = self.tx.send(TranslatorEvent::ChatRun {
            chat_id: chat_id.to_string(),
            run_id: run_id.to_string(),
            status: status.to_string(),
            translated,
            total,
        });
    }

    async fn execute_run(&self, chat_id: &str, handle: Arc<RunHandle>) -> ChatRunReport {
        let loaded = {
            let db = self.db.lock().await;
            db.get_chat_messages(chat_id)
                .and_then(|messages| Ok((messages, db.load_settings()?)))
        };

        let mut report = ChatRunReport {
            run_id: handle.run_id.clone(),
            status: ChatRunStatus::Completed,
            translated: 0,
            total: 0,
            error: None,
        };

        match loaded {
            Err(e) => {
                report.status = ChatRunStatus::Failed;
                report.error = Some(e.to_string());
                self.notify(NoticeLevel::Error, format!("Chat translation failed: {}", e));
            }
            Ok((messages, _)) if messages.is_empty() => {
                self.notify(NoticeLevel::Warning, "There is no chat to translate");
            }
            Ok((messages, settings)) => {
                report.total = messages.len();
                self.notify(NoticeLevel::Info, "Starting chat translation");
                self.emit_run(chat_id, &handle.run_id, "running", 0, report.total);

                for (i, message) in messages.iter().enumerate() {
                    if handle.cancel.load(Ordering::SeqCst) {
                        report.status = ChatRunStatus::Cancelled;
                        break;
                    }

                    match self.translate_one(chat_id, message.message_id, false).await {
                        Ok(TranslateOutcome::Translated(_)) => {
                            report.translated += 1;
                            if settings.throttle_delay_ms > 0 && i + 1 < messages.len() {
                                sleep(Duration::from_millis(settings.throttle_delay_ms)).await;
                            }
                        }
                        Ok(TranslateOutcome::Cached(_)) => report.translated += 1,
                        Ok(TranslateOutcome::Skipped)
                        | Err(TranslatorError::Busy(_))
                        | Err(TranslatorError::Stale(_)) => {}
                        Err(e) => {
                            report.status = ChatRunStatus::Failed;
                            report.error = Some(e.to_string());
                            break;
                        }
                    }
                    self.emit_run(chat_id, &handle.run_id, "running", report.translated, report.total);
                }

                match report.status {
                    ChatRunStatus::Completed => self.notify(NoticeLevel::Success, "Chat translation completed"),
                    ChatRunStatus::Cancelled => self.notify(NoticeLevel::Info, "Chat translation cancelled"),
                    ChatRunStatus::Failed => self.notify(NoticeLevel::Error, "Chat translation stopped after an error"),
                }
            }
        }

        self.runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(chat_id);
        self.emit_run(chat_id, &handle.run_id, report.status.as_str(), report.translated, report.total);
        report
    }

    pub fn is_running(&self, chat_id: &str) -> bool {
        self.runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(chat_id)
    }

    /// The cached raw translation for a message, for editing.
    pub async fn raw_translation(&self, chat_id: &str, message_id: i64) -> Result<Option<String>> {
        let (_, original, _) = self.load_context(chat_id, message_id).await?;
        self.db.lock().await.get_translation(&original)
    }

    pub async fn edit_translation(&self, chat_id: &str, message_id: i64, text: &str) -> Result<String> {
        if text.trim().is_empty() {
            return Err(TranslatorError::InvalidArgument("translation text is empty".to_string()));
        }
        let (message, original, settings) = self.load_context(chat_id, message_id).await?;
        if message.display_text().is_none() {
            return Err(TranslatorError::NotFound(format!("translation for message {}", message_id)));
        }

        {
            let db = self.db.lock().await;
            let timestamp = Utc::now().to_rfc3339();
            db.upsert_translation(&original, text, &settings.provider, &settings.model, &timestamp)?;
        }

        let display = self.render(&settings, &original, text);
        self.apply_display(chat_id, message_id, &message.mes, Some(&display)).await?;
        self.notify(NoticeLevel::Success, "Translation updated");
        Ok(display)
    }

    /// Flips the presentation between original and translation. The stored
    /// display text is left as is.
    pub async fn toggle_original(&self, chat_id: &str, message_id: i64) -> Result<ToggleView> {
        let (message, original, _) = self.load_context(chat_id, message_id).await?;
        let display = message
            .display_text()
            .ok_or_else(|| TranslatorError::NotFound(format!("translation for message {}", message_id)))?;

        let key = (chat_id.to_string(), message_id);
        let mut showing = self.showing_original.lock().unwrap_or_else(PoisonError::into_inner);
        let showing_original = if showing.remove(&key) {
            false
        } else {
            showing.insert(key);
            true
        };

        Ok(ToggleView {
            showing_original,
            text: if showing_original { original } else { display.to_string() },
        })
    }

    pub async fn clear_translations(&self, chat_id: &str) -> Result<usize> {
        let messages = self.db.lock().await.get_chat_messages(chat_id)?;
        let mut cleared = 0;
        for message in messages.iter().filter(|m| m.display_text().is_some()) {
            match self.apply_display(chat_id, message.message_id, &message.mes, None).await {
                Ok(()) => cleared += 1,
                Err(TranslatorError::Stale(_)) => {}
                Err(e) => return Err(e),
            }
        }
        self.notify(NoticeLevel::Success, format!("Cleared {} translations", cleared));
        Ok(cleared)
    }

    pub async fn delete_cached_translation(&self, chat_id: &str, message_id: i64) -> Result<()> {
        let (message, original, _) = self.load_context(chat_id, message_id).await?;
        self.db.lock().await.delete_translation(&original)?;
        if message.display_text().is_some() {
            self.apply_display(chat_id, message_id, &message.mes, None).await?;
        }
        Ok(())
    }

    /// Ad hoc translation outside the chat log. Never cached.
    pub async fn translate_text(&self, text: &str, kind: PromptKind) -> Result<String> {
        if text.trim().is_empty() {
            return Err(TranslatorError::InvalidArgument("nothing to translate".to_string()));
        }
        let (settings, secrets) = {
            let db = self.db.lock().await;
            (db.load_settings()?, db.load_secrets()?)
        };
        let prompt = match kind {
            PromptKind::Chat => &settings.prompt_chat,
            PromptKind::Input => &settings.prompt_input,
        };
        self.client.translate(text, prompt, &settings, &secrets).await
    }

    pub async fn handle_host_event(&self, event: HostEvent) {
        match event {
            HostEvent::MessageRendered { chat_id, message_id }
            | HostEvent::MessageSwiped { chat_id, message_id } => {
                let auto_mode = match self.db.lock().await.load_settings() {
                    Ok(settings) => settings.auto_mode,
                    Err(e) => {
                        tracing::error!("[Translator] Failed to load settings: {}", e);
                        return;
                    }
                };
                let is_user = match self.db.lock().await.get_chat_message(&chat_id, message_id) {
                    Ok(Some(message)) => message.is_user,
                    Ok(None) => {
                        tracing::warn!("[Translator] Rendered message {} not found in chat {}", message_id, chat_id);
                        return;
                    }
                    Err(e) => {
                        tracing::error!("[Translator] Failed to read message {}: {}", message_id, e);
                        return;
                    }
                };
                if auto_mode.covers(is_user) {
                    let _ = self.translate_one(&chat_id, message_id, false).await;
                }
            }
            HostEvent::ChatChanged { chat_id } => {
                tracing::info!("[Translator] Chat changed to {}", chat_id);
                self.states
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .retain(|(c, _), state| c != &chat_id || *state == MessageState::InProgress);
                self.showing_original
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .retain(|(c, _)| c != &chat_id);
            }
        }
    }
}

/// Consumes host events; each rendered message is handled on its own task.
pub async fn run_event_loop(translator: Arc<Translator>, mut rx: mpsc::Receiver<HostEvent>) {
    tracing::info!("Host event loop started");
    while let Some(event) = rx.recv().await {
        let translator = Arc::clone(&translator);
        tokio::spawn(async move {
            translator.handle_host_event(event).await;
        });
    }
    tracing::info!("Host event loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Chat;
    use serde_json::Map;

    fn seeded_translator() -> (Translator, broadcast::Receiver<TranslatorEvent>) {
        let mut db = Database::open_in_memory().unwrap();
        db.upsert_chat(&Chat { chat_id: "c1".into(), user_name: Some("Alice".into()), metadata: Map::new() })
            .unwrap();
        db.sync_chat_messages(
            "c1",
            &[ChatMessage {
                message_id: 0,
                name: "Bot".into(),
                is_user: false,
                mes: "Hello {{user}}".into(),
                extra: Map::new(),
            }],
        )
        .unwrap();
        db.add_translation("Hello Alice", "안녕 Alice", "openai", "gpt-4o-mini", "t").unwrap();

        let (tx, rx) = broadcast::channel(16);
        let client = LlmClient::new("http://127.0.0.1:9", None);
        (Translator::new(Arc::new(Mutex::new(db)), client, tx), rx)
    }

    #[test]
    fn macros_are_substituted() {
        assert_eq!(
            substitute_params("{{User}} meets {{char}} and <BOT>", "Ann", "Rex"),
            "Ann meets Rex and Rex"
        );
        assert_eq!(substitute_params("cost $1 {{user}}", "$2", "x"), "cost $1 $2");
    }

    #[tokio::test]
    async fn cache_hit_skips_network() {
        let (translator, mut rx) = seeded_translator();
        let outcome = translator.translate_one("c1", 0, false).await.unwrap();
        assert_eq!(outcome, TranslateOutcome::Cached("안녕 Alice".into()));
        assert_eq!(translator.message_state("c1", 0), MessageState::Done);

        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            TranslatorEvent::MessageUpdated {
                chat_id: "c1".into(),
                message_id: 0,
                display_text: Some("안녕 Alice".into()),
            }
        );

        let again = translator.translate_one("c1", 0, false).await.unwrap();
        assert_eq!(again, TranslateOutcome::Skipped);
    }

    #[tokio::test]
    async fn toggle_flips_between_original_and_translation() {
        let (translator, _rx) = seeded_translator();
        translator.translate_one("c1", 0, false).await.unwrap();

        let first = translator.toggle_original("c1", 0).await.unwrap();
        assert!(first.showing_original);
        assert_eq!(first.text, "Hello Alice");

        let second = translator.toggle_original("c1", 0).await.unwrap();
        assert!(!second.showing_original);
        assert_eq!(second.text, "안녕 Alice");
    }

    #[tokio::test]
    async fn edit_updates_cache_and_display() {
        let (translator, _rx) = seeded_translator();
        assert!(matches!(
            translator.edit_translation("c1", 0, "수정").await,
            Err(TranslatorError::NotFound(_))
        ));

        translator.translate_one("c1", 0, false).await.unwrap();
        let display = translator.edit_translation("c1", 0, "반가워 Alice").await.unwrap();
        assert_eq!(display, "반가워 Alice");
        assert_eq!(
            translator.raw_translation("c1", 0).await.unwrap().as_deref(),
            Some("반가워 Alice")
        );
    }

    #[tokio::test]
    async fn clear_and_delete_remove_display_text() {
        let (translator, _rx) = seeded_translator();
        translator.translate_one("c1", 0, false).await.unwrap();
        assert_eq!(translator.clear_translations("c1").await.unwrap(), 1);

        translator.translate_one("c1", 0, false).await.unwrap();
        translator.delete_cached_translation("c1", 0).await.unwrap();
        assert_eq!(translator.raw_translation("c1", 0).await.unwrap(), None);
        assert!(matches!(
            translator.delete_cached_translation("c1", 0).await,
            Err(TranslatorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn unconfirmed_run_waits_for_confirmation() {
        let (translator, _rx) = seeded_translator();
        assert_eq!(translator.translate_all("c1", false).await, ChatRunOutcome::AwaitingConfirmation);

        let outcome = translator.translate_all("c1", true).await;
        let ChatRunOutcome::Finished(report) = outcome else {
            panic!("expected finished run, got {:?}", outcome);
        };
        assert_eq!(report.status, ChatRunStatus::Completed);
        assert_eq!(report.translated, 1);
        assert!(!translator.is_running("c1"));
    }

    #[tokio::test]
    async fn chat_change_forgets_finished_states() {
        let (translator, _rx) = seeded_translator();
        translator.translate_one("c1", 0, false).await.unwrap();
        assert_eq!(translator.message_state("c1", 0), MessageState::Done);

        translator
            .handle_host_event(HostEvent::ChatChanged { chat_id: "c1".into() })
            .await;
        assert_eq!(translator.message_state("c1", 0), MessageState::Idle);
        assert!(translator.states.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_message_is_not_found() {
        let (translator, _rx) = seeded_translator();
        let err = translator.translate_one("c1", 42, false).await.unwrap_err();
        assert!(matches!(err, TranslatorError::NotFound(_)));
        assert_eq!(translator.message_state("c1", 42), MessageState::Failed);
    }
}
