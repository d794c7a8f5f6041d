use crate::backup;
use crate::db::Database;
use crate::error::{Result, TranslatorError};
use crate::translator::{PromptKind, TranslateOutcome, Translator};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Translate a message; the last message of the chat when no id is given.
    Translate { message_id: Option<i64> },
    TranslateText { text: String },
    DbUpload,
    DbDownload,
    DbClear,
    DeleteTranslation { message_id: i64 },
}

struct Args<'a> {
    named: HashMap<&'a str, &'a str>,
    positional: Vec<&'a str>,
}

impl<'a> Args<'a> {
    fn parse(rest: &'a str) -> Self {
        let mut named = HashMap::new();
        let mut positional = Vec::new();
        for token in rest.split_whitespace() {
            match token.split_once('=') {
                Some((key, value)) if !key.is_empty() => {
                    named.insert(key, value);
                }
                _ => positional.push(token),
            }
        }
        Args { named, positional }
    }

    fn message_id(&self) -> Result<Option<i64>> {
        let raw = self
            .named
            .get("id")
            .or_else(|| self.named.get("messageId"))
            .copied()
            .or_else(|| self.positional.first().copied());
        raw.map(|value| {
            value
                .parse::<i64>()
                .ok()
                .filter(|id| *id >= 0)
                .ok_or_else(|| TranslatorError::InvalidArgument(format!("invalid message id: {}", value)))
        })
        .transpose()
    }
}

impl Command {
    pub fn parse(line: &str) -> Result<Command> {
        let line = line.trim().trim_start_matches('/');
        let (name, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let args = Args::parse(rest);

        match name {
            "llm-translate" => Ok(Command::Translate { message_id: args.message_id()? }),
            "llm-translate-text" => {
                let text = rest.trim();
                if text.is_empty() {
                    return Err(TranslatorError::InvalidArgument("no text given".to_string()));
                }
                Ok(Command::TranslateText { text: text.to_string() })
            }
            "llm-db-upload" => Ok(Command::DbUpload),
            "llm-db-download" => Ok(Command::DbDownload),
            "llm-db-clear" => Ok(Command::DbClear),
            "llm-db-delete-translation" => match args.message_id()? {
                Some(message_id) => Ok(Command::DeleteTranslation { message_id }),
                None => Err(TranslatorError::InvalidArgument("message id is required".to_string())),
            },
            other => Err(TranslatorError::InvalidArgument(format!("unknown command: {}", other))),
        }
    }
}

async fn run(command: Command, translator: &Translator, db: &Arc<Mutex<Database>>, chat_id: &str) -> Result<String> {
    match command {
        Command::Translate { message_id } => {
            let message_id = match message_id {
                Some(id) => id,
                None => db
                    .lock()
                    .await
                    .get_chat_messages(chat_id)?
                    .last()
                    .map(|m| m.message_id)
                    .ok_or_else(|| TranslatorError::NotFound(format!("messages in chat {}", chat_id)))?,
            };
            Ok(match translator.translate_one(chat_id, message_id, true).await? {
                TranslateOutcome::Translated(_) => format!("Translated message {}", message_id),
                TranslateOutcome::Cached(_) => format!("Translated message {} from cache", message_id),
                TranslateOutcome::Skipped => format!("Message {} is already translated", message_id),
            })
        }
        Command::TranslateText { text } => translator.translate_text(&text, PromptKind::Chat).await,
        Command::DbUpload => {
            let count = backup::upload_backup(&*db.lock().await, chat_id)?;
            Ok(format!("Backed up {} translations to the chat", count))
        }
        Command::DbDownload => {
            let report = backup::restore_backup(&*db.lock().await, chat_id)?;
            Ok(format!(
                "Restored {} translations ({} already present)",
                report.added, report.skipped
            ))
        }
        Command::DbClear => {
            if backup::clear_backup(&*db.lock().await, chat_id)? {
                Ok("Backup cleared".to_string())
            } else {
                Ok("No backup to clear".to_string())
            }
        }
        Command::DeleteTranslation { message_id } => {
            translator.delete_cached_translation(chat_id, message_id).await?;
            Ok(format!("Deleted cached translation for message {}", message_id))
        }
    }
}

/// Parses and runs a command line. Failures come back as text, never as errors.
pub async fn execute(line: &str, translator: &Translator, db: &Arc<Mutex<Database>>, chat_id: &str) -> String {
    let result = match Command::parse(line) {
        Ok(command) => run(command, translator, db, chat_id).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(status) => status,
        Err(e) => {
            tracing::warn!("Command {:?} failed: {}", line, e);
            format!("Error: {}", e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_named_and_positional_ids() {
        assert_eq!(
            Command::parse("/llm-translate id=3").unwrap(),
            Command::Translate { message_id: Some(3) }
        );
        assert_eq!(
            Command::parse("llm-translate 7").unwrap(),
            Command::Translate { message_id: Some(7) }
        );
        assert_eq!(Command::parse("/llm-translate").unwrap(), Command::Translate { message_id: None });
    }

    #[test]
    fn translate_text_keeps_whole_rest() {
        assert_eq!(
            Command::parse("/llm-translate-text  Hello there, world ").unwrap(),
            Command::TranslateText { text: "Hello there, world".into() }
        );
    }

    #[test]
    fn bad_arguments_are_rejected() {
        assert!(matches!(
            Command::parse("/llm-translate id=abc"),
            Err(TranslatorError::InvalidArgument(_))
        ));
        assert!(matches!(
            Command::parse("/llm-db-delete-translation"),
            Err(TranslatorError::InvalidArgument(_))
        ));
        assert!(matches!(Command::parse("/llm-nope"), Err(TranslatorError::InvalidArgument(_))));
        assert!(matches!(Command::parse("/llm-translate -1"), Err(TranslatorError::InvalidArgument(_))));
    }
}
