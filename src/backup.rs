use crate::db::{Database, TranslationRecord};
use crate::error::{Result, TranslatorError};
use serde::Serialize;
use serde_json::Value;

/// Chat metadata key holding the serialized cache.
pub const BACKUP_KEY: &str = "llm_translator_backup";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub added: usize,
    pub updated: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub added: usize,
    pub skipped: usize,
}

pub fn parse_records(raw: &str) -> Result<Vec<TranslationRecord>> {
    serde_json::from_str(raw)
        .map_err(|e| TranslatorError::InvalidArgument(format!("not a translation export: {}", e)))
}

/// File import: existing keys are overwritten, new keys are inserted.
pub fn import_records(db: &Database, records: &[TranslationRecord]) -> Result<ImportReport> {
    let mut report = ImportReport::default();
    for record in records {
        if db.get_translation(&record.original_text)?.is_some() {
            db.update_translation(
                &record.original_text,
                &record.translation,
                &record.provider,
                &record.model,
                &record.timestamp,
            )?;
            report.updated += 1;
        } else {
            db.add_translation(
                &record.original_text,
                &record.translation,
                &record.provider,
                &record.model,
                &record.timestamp,
            )?;
            report.added += 1;
        }
    }
    tracing::info!("[Backup] Imported {} new and {} updated records", report.added, report.updated);
    Ok(report)
}

/// Add-only merge: records whose key already exists locally are left alone.
pub fn merge_add_only(db: &Database, records: &[TranslationRecord]) -> Result<MergeReport> {
    let mut report = MergeReport::default();
    for record in records {
        if db.get_translation(&record.original_text)?.is_some() {
            report.skipped += 1;
            continue;
        }
        db.add_translation(
            &record.original_text,
            &record.translation,
            &record.provider,
            &record.model,
            &record.timestamp,
        )?;
        report.added += 1;
    }
    Ok(report)
}

/// Writes the whole cache into the chat's metadata. Returns the record count.
pub fn upload_backup(db: &Database, chat_id: &str) -> Result<usize> {
    let mut chat = db
        .get_chat(chat_id)?
        .ok_or_else(|| TranslatorError::NotFound(format!("chat {}", chat_id)))?;
    let records = db.get_all_translations()?;
    chat.metadata
        .insert(BACKUP_KEY.to_string(), Value::String(serde_json::to_string(&records)?));
    db.set_chat_metadata(chat_id, &chat.metadata)?;
    tracing::info!("[Backup] Stored {} records in chat {}", records.len(), chat_id);
    Ok(records.len())
}

pub fn restore_backup(db: &Database, chat_id: &str) -> Result<MergeReport> {
    let chat = db
        .get_chat(chat_id)?
        .ok_or_else(|| TranslatorError::NotFound(format!("chat {}", chat_id)))?;
    let raw = chat
        .metadata
        .get(BACKUP_KEY)
        .and_then(Value::as_str)
        .ok_or_else(|| TranslatorError::NotFound(format!("backup in chat {}", chat_id)))?;

    let report = merge_add_only(db, &parse_records(raw)?)?;
    tracing::info!(
        "[Backup] Restored {} records from chat {} ({} already present)",
        report.added,
        chat_id,
        report.skipped
    );
    Ok(report)
}

/// Returns whether a backup existed.
pub fn clear_backup(db: &Database, chat_id: &str) -> Result<bool> {
    let mut chat = db
        .get_chat(chat_id)?
        .ok_or_else(|| TranslatorError::NotFound(format!("chat {}", chat_id)))?;
    let existed = chat.metadata.remove(BACKUP_KEY).is_some();
    if existed {
        db.set_chat_metadata(chat_id, &chat.metadata)?;
    }
    Ok(existed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Chat;
    use serde_json::Map;

    fn db_with_chat() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.upsert_chat(&Chat { chat_id: "c1".into(), user_name: None, metadata: Map::new() })
            .unwrap();
        db
    }

    #[test]
    fn export_uses_flat_records() {
        let db = db_with_chat();
        db.add_translation("Hello", "안녕", "claude", "m", "t").unwrap();
        let exported = serde_json::to_value(db.get_all_translations().unwrap()).unwrap();
        assert_eq!(exported[0]["originalText"], "Hello");
        assert_eq!(exported[0]["translation"], "안녕");
        assert_eq!(exported[0]["provider"], "claude");
    }

    #[test]
    fn restore_never_overwrites_local_records() {
        let db = db_with_chat();
        db.add_translation("a", "old-a", "openai", "m", "t").unwrap();
        db.add_translation("b", "old-b", "openai", "m", "t").unwrap();
        assert_eq!(upload_backup(&db, "c1").unwrap(), 2);

        db.update_translation("a", "local-a", "openai", "m", "t").unwrap();
        db.delete_translation("b").unwrap();

        let report = restore_backup(&db, "c1").unwrap();
        assert_eq!(report, MergeReport { added: 1, skipped: 1 });
        assert_eq!(db.get_translation("a").unwrap().as_deref(), Some("local-a"));
        assert_eq!(db.get_translation("b").unwrap().as_deref(), Some("old-b"));
    }

    #[test]
    fn import_overwrites_existing_keys() {
        let db = db_with_chat();
        db.add_translation("a", "old", "openai", "m", "t").unwrap();
        let records = parse_records(
            r#"[{"originalText":"a","translation":"new"},{"originalText":"b","translation":"bee"}]"#,
        )
        .unwrap();

        let report = import_records(&db, &records).unwrap();
        assert_eq!(report, ImportReport { added: 1, updated: 1 });
        assert_eq!(db.get_translation("a").unwrap().as_deref(), Some("new"));
    }

    #[test]
    fn clear_and_missing_backup() {
        let db = db_with_chat();
        assert!(matches!(restore_backup(&db, "c1"), Err(TranslatorError::NotFound(_))));
        upload_backup(&db, "c1").unwrap();
        assert!(clear_backup(&db, "c1").unwrap());
        assert!(!clear_backup(&db, "c1").unwrap());
        assert!(matches!(upload_backup(&db, "nope"), Err(TranslatorError::NotFound(_))));
    }

    #[test]
    fn malformed_backup_is_invalid_argument() {
        assert!(matches!(parse_records("{}"), Err(TranslatorError::InvalidArgument(_))));
    }
}
