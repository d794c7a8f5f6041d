use serde::{Deserialize, Serialize};

/// Outbound notification for the host, streamed over SSE.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TranslatorEvent {
    /// A message's display text changed; `display_text` is `None` when cleared.
    MessageUpdated {
        chat_id: String,
        message_id: i64,
        display_text: Option<String>,
    },
    ChatRun {
        chat_id: String,
        run_id: String,
        status: String, // "running", "completed", "cancelled", "failed"
        translated: usize,
        total: usize,
    },
    Notice {
        level: NoticeLevel,
        message: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// Inbound event forwarded by the host's event bus.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostEvent {
    MessageRendered { chat_id: String, message_id: i64 },
    MessageSwiped { chat_id: String, message_id: i64 },
    ChatChanged { chat_id: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_events_parse_from_tagged_json() {
        let event: HostEvent =
            serde_json::from_str(r#"{"type":"message_rendered","chat_id":"c","message_id":4}"#).unwrap();
        assert_eq!(event, HostEvent::MessageRendered { chat_id: "c".into(), message_id: 4 });
    }

    #[test]
    fn notices_serialize_with_level() {
        let json = serde_json::to_value(TranslatorEvent::Notice {
            level: NoticeLevel::Warning,
            message: "busy".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "notice");
        assert_eq!(json["level"], "warning");
    }
}
