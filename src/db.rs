use crate::config::{SecretState, Settings};
use crate::error::{Result, TranslatorError};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;

pub const DISPLAY_TEXT_KEY: &str = "display_text";

const SETTINGS_KEY: &str = "translator";
const SECRETS_KEY: &str = "secrets";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslationRecord {
    #[serde(default)]
    pub id: i64,
    #[serde(rename = "originalText")]
    pub original_text: String,
    pub translation: String,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub timestamp: String,
}

impl TryFrom<&Row<'_>> for TranslationRecord {
    type Error = rusqlite::Error;

    fn try_from(row: &Row<'_>) -> std::result::Result<Self, Self::Error> {
        Ok(TranslationRecord {
            id: row.get(0)?,
            original_text: row.get(1)?,
            translation: row.get(2)?,
            provider: row.get(3)?,
            model: row.get(4)?,
            timestamp: row.get(5)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub chat_id: String,
    pub user_name: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub message_id: i64,
    pub name: String,
    #[serde(default)]
    pub is_user: bool,
    pub mes: String,
    #[serde(default)]
    pub extra: Map<String, Value>,
}

impl ChatMessage {
    pub fn display_text(&self) -> Option<&str> {
        self.extra
            .get(DISPLAY_TEXT_KEY)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn set_display_text(&mut self, text: &str) {
        self.extra
            .insert(DISPLAY_TEXT_KEY.to_string(), Value::String(text.to_string()));
    }

    pub fn clear_display_text(&mut self) -> bool {
        self.extra.remove(DISPLAY_TEXT_KEY).is_some()
    }
}

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS translations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                original_text TEXT NOT NULL,
                translation TEXT NOT NULL,
                provider TEXT NOT NULL,
                model TEXT NOT NULL,
                timestamp TEXT NOT NULL
            );

            -- Not unique: duplicate keys are tolerated and lookups take the oldest row.
            CREATE INDEX IF NOT EXISTS idx_translations_original ON translations(original_text);

            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS chats (
                chat_id TEXT PRIMARY KEY,
                user_name TEXT,
                metadata TEXT NOT NULL DEFAULT '{}',
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS chat_messages (
                chat_id TEXT NOT NULL,
                message_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                is_user INTEGER NOT NULL DEFAULT 0,
                mes TEXT NOT NULL,
                extra TEXT NOT NULL DEFAULT '{}',
                PRIMARY KEY (chat_id, message_id),
                FOREIGN KEY(chat_id) REFERENCES chats(chat_id) ON DELETE CASCADE
            );
        "#)?;

        Ok(Database { conn })
    }

    // --- Translation cache ---

    pub fn get_translation(&self, original_text: &str) -> Result<Option<String>> {
        let translation = self
            .conn
            .query_row(
                "SELECT translation FROM translations WHERE original_text = ?1 ORDER BY id ASC LIMIT 1",
                params![original_text],
                |row| row.get(0),
            )
            .optional()?;
        Ok(translation)
    }

    pub fn get_translation_record(&self, original_text: &str) -> Result<Option<TranslationRecord>> {
        let record = self
            .conn
            .query_row(
                "SELECT id, original_text, translation, provider, model, timestamp FROM translations WHERE original_text = ?1 ORDER BY id ASC LIMIT 1",
                params![original_text],
                |row| TranslationRecord::try_from(row),
            )
            .optional()?;
        Ok(record)
    }

    pub fn add_translation(
        &self,
        original_text: &str,
        translation: &str,
        provider: &str,
        model: &str,
        timestamp: &str,
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO translations (original_text, translation, provider, model, timestamp) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![original_text, translation, provider, model, timestamp],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn update_translation(
        &self,
        original_text: &str,
        translation: &str,
        provider: &str,
        model: &str,
        timestamp: &str,
    ) -> Result<()> {
        let id: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM translations WHERE original_text = ?1 ORDER BY id ASC LIMIT 1",
                params![original_text],
                |row| row.get(0),
            )
            .optional()?;
        let id = id.ok_or_else(|| TranslatorError::NotFound(format!("translation for {:?}", original_text)))?;

        self.conn.execute(
            "UPDATE translations SET translation = ?1, provider = ?2, model = ?3, timestamp = ?4 WHERE id = ?5",
            params![translation, provider, model, timestamp, id],
        )?;
        Ok(())
    }

    /// Updates the current record for `original_text`, or inserts one.
    pub fn upsert_translation(
        &self,
        original_text: &str,
        translation: &str,
        provider: &str,
        model: &str,
        timestamp: &str,
    ) -> Result<()> {
        match self.update_translation(original_text, translation, provider, model, timestamp) {
            Err(TranslatorError::NotFound(_)) => {
                self.add_translation(original_text, translation, provider, model, timestamp)?;
                Ok(())
            }
            other => other,
        }
    }

    pub fn delete_translation(&self, original_text: &str) -> Result<()> {
        let deleted = self.conn.execute(
            "DELETE FROM translations WHERE original_text = ?1",
            params![original_text],
        )?;
        if deleted == 0 {
            return Err(TranslatorError::NotFound(format!("translation for {:?}", original_text)));
        }
        Ok(())
    }

    pub fn get_all_translations(&self) -> Result<Vec<TranslationRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, original_text, translation, provider, model, timestamp FROM translations ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], |row| TranslationRecord::try_from(row))?;

        let mut records = Vec::new();
        for record in rows {
            records.push(record?);
        }
        Ok(records)
    }

    pub fn delete_all_translations(&self) -> Result<usize> {
        Ok(self.conn.execute("DELETE FROM translations", [])?)
    }

    // --- Settings ---

    fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row("SELECT value FROM settings WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    fn put_setting(&self, key: &str, value: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value=excluded.value, updated_at=excluded.updated_at",
            params![key, value, now],
        )?;
        Ok(())
    }

    pub fn load_settings(&self) -> Result<Settings> {
        match self.get_setting(SETTINGS_KEY)? {
            Some(raw) => Ok(Settings::from_json(&raw)?),
            None => Ok(Settings::default()),
        }
    }

    pub fn save_settings(&self, settings: &Settings) -> Result<()> {
        self.put_setting(SETTINGS_KEY, &serde_json::to_string(settings)?)
    }

    pub fn load_secrets(&self) -> Result<SecretState> {
        match self.get_setting(SECRETS_KEY)? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(SecretState::default()),
        }
    }

    pub fn save_secrets(&self, secrets: &SecretState) -> Result<()> {
        self.put_setting(SECRETS_KEY, &serde_json::to_string(secrets)?)
    }

    // --- Chat mirror ---

    pub fn upsert_chat(&self, chat: &Chat) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let metadata = serde_json::to_string(&chat.metadata)?;
        self.conn.execute(
            "INSERT INTO chats (chat_id, user_name, metadata, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(chat_id) DO UPDATE SET user_name=excluded.user_name, metadata=excluded.metadata, updated_at=excluded.updated_at",
            params![chat.chat_id, chat.user_name, metadata, now],
        )?;
        Ok(())
    }

    pub fn get_chat(&self, chat_id: &str) -> Result<Option<Chat>> {
        let row = self
            .conn
            .query_row(
                "SELECT chat_id, user_name, metadata FROM chats WHERE chat_id = ?1",
                params![chat_id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?, row.get::<_, String>(2)?)),
            )
            .optional()?;

        match row {
            Some((chat_id, user_name, metadata)) => Ok(Some(Chat {
                chat_id,
                user_name,
                metadata: serde_json::from_str(&metadata)?,
            })),
            None => Ok(None),
        }
    }

    pub fn set_chat_metadata(&self, chat_id: &str, metadata: &Map<String, Value>) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let updated = self.conn.execute(
            "UPDATE chats SET metadata = ?1, updated_at = ?2 WHERE chat_id = ?3",
            params![serde_json::to_string(metadata)?, now, chat_id],
        )?;
        if updated == 0 {
            return Err(TranslatorError::NotFound(format!("chat {}", chat_id)));
        }
        Ok(())
    }

    /// Replaces the mirrored messages of a chat. A pushed message without a
    /// display text keeps the stored one as long as its raw text is unchanged.
    pub fn sync_chat_messages(&mut self, chat_id: &str, messages: &[ChatMessage]) -> Result<()> {
        let existing = self.get_chat_messages(chat_id)?;
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM chat_messages WHERE chat_id = ?1", params![chat_id])?;

        for message in messages {
            let mut message = message.clone();
            if message.display_text().is_none() {
                let kept = existing
                    .iter()
                    .find(|m| m.message_id == message.message_id && m.mes == message.mes)
                    .and_then(|m| m.display_text());
                if let Some(text) = kept {
                    message.set_display_text(text);
                }
            }
            tx.execute(
                "INSERT INTO chat_messages (chat_id, message_id, name, is_user, mes, extra) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    chat_id,
                    message.message_id,
                    message.name,
                    message.is_user,
                    message.mes,
                    serde_json::to_string(&message.extra)?
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    pub fn get_chat_messages(&self, chat_id: &str) -> Result<Vec<ChatMessage>> {
        let mut stmt = self.conn.prepare(
            "SELECT message_id, name, is_user, mes, extra FROM chat_messages WHERE chat_id = ?1 ORDER BY message_id ASC",
        )?;
        let rows = stmt.query_map(params![chat_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, bool>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut messages = Vec::new();
        for row in rows {
            let (message_id, name, is_user, mes, extra) = row?;
            messages.push(ChatMessage {
                message_id,
                name,
                is_user,
                mes,
                extra: serde_json::from_str(&extra)?,
            });
        }
        Ok(messages)
    }

    pub fn get_chat_message(&self, chat_id: &str, message_id: i64) -> Result<Option<ChatMessage>> {
        Ok(self
            .get_chat_messages(chat_id)?
            .into_iter()
            .find(|m| m.message_id == message_id))
    }

    pub fn update_message_extra(&self, chat_id: &str, message_id: i64, extra: &Map<String, Value>) -> Result<()> {
        let updated = self.conn.execute(
            "UPDATE chat_messages SET extra = ?1 WHERE chat_id = ?2 AND message_id = ?3",
            params![serde_json::to_string(extra)?, chat_id, message_id],
        )?;
        if updated == 0 {
            return Err(TranslatorError::NotFound(format!("message {} in chat {}", message_id, chat_id)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(db: &Database, key: &str, value: &str) -> i64 {
        db.add_translation(key, value, "openai", "gpt-4o-mini", "2024-01-01T00:00:00Z")
            .unwrap()
    }

    #[test]
    fn add_then_get_returns_translation() {
        let db = Database::open_in_memory().unwrap();
        record(&db, "Hello", "안녕");
        assert_eq!(db.get_translation("Hello").unwrap().as_deref(), Some("안녕"));
        assert_eq!(db.get_translation("Missing").unwrap(), None);
    }

    #[test]
    fn duplicate_keys_resolve_to_oldest_record() {
        let db = Database::open_in_memory().unwrap();
        let first = record(&db, "Hello", "first");
        let second = record(&db, "Hello", "second");
        assert!(second > first);
        assert_eq!(db.get_translation("Hello").unwrap().as_deref(), Some("first"));
        assert_eq!(db.get_all_translations().unwrap().len(), 2);
    }

    #[test]
    fn update_requires_existing_key() {
        let db = Database::open_in_memory().unwrap();
        let err = db
            .update_translation("Hello", "x", "openai", "m", "t")
            .unwrap_err();
        assert!(matches!(err, TranslatorError::NotFound(_)));

        record(&db, "Hello", "안녕");
        db.update_translation("Hello", "안녕하세요", "claude", "m", "t").unwrap();
        let stored = db.get_translation_record("Hello").unwrap().unwrap();
        assert_eq!(stored.translation, "안녕하세요");
        assert_eq!(stored.provider, "claude");
    }

    #[test]
    fn upsert_never_duplicates() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_translation("Hello", "a", "openai", "m", "t").unwrap();
        db.upsert_translation("Hello", "b", "openai", "m", "t").unwrap();
        let all = db.get_all_translations().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].translation, "b");
    }

    #[test]
    fn delete_by_key_and_delete_store() {
        let db = Database::open_in_memory().unwrap();
        record(&db, "a", "1");
        record(&db, "b", "2");

        db.delete_translation("a").unwrap();
        assert!(matches!(db.delete_translation("a"), Err(TranslatorError::NotFound(_))));
        assert_eq!(db.delete_all_translations().unwrap(), 1);
        assert!(db.get_all_translations().unwrap().is_empty());
    }

    #[test]
    fn settings_default_until_saved() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.load_settings().unwrap(), Settings::default());

        let mut settings = Settings::default();
        settings.throttle_delay_ms = 1500;
        db.save_settings(&settings).unwrap();
        assert_eq!(db.load_settings().unwrap().throttle_delay_ms, 1500);
    }

    #[test]
    fn sync_keeps_display_text_for_unchanged_messages() {
        let mut db = Database::open_in_memory().unwrap();
        db.upsert_chat(&Chat { chat_id: "c1".into(), user_name: None, metadata: Map::new() })
            .unwrap();

        let mut message = ChatMessage {
            message_id: 0,
            name: "Bot".into(),
            is_user: false,
            mes: "Hello".into(),
            extra: Map::new(),
        };
        db.sync_chat_messages("c1", &[message.clone()]).unwrap();

        message.set_display_text("안녕");
        db.update_message_extra("c1", 0, &message.extra).unwrap();

        message.clear_display_text();
        db.sync_chat_messages("c1", &[message.clone()]).unwrap();
        let stored = db.get_chat_message("c1", 0).unwrap().unwrap();
        assert_eq!(stored.display_text(), Some("안녕"));

        message.mes = "Hello again".into();
        db.sync_chat_messages("c1", &[message]).unwrap();
        let stored = db.get_chat_message("c1", 0).unwrap().unwrap();
        assert_eq!(stored.display_text(), None);
    }
}
