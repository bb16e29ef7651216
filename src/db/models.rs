use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A message addressed by the conversation it lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageRef {
    pub chat_id: i64,
    pub message_id: i64,
}

impl MessageRef {
    pub fn new(chat_id: i64, message_id: i64) -> Self {
        Self {
            chat_id,
            message_id,
        }
    }

    /// Composite key used by the persisted forward index.
    pub fn key(&self) -> String {
        format!("{}_{}", self.chat_id, self.message_id)
    }
}

/// One relayed copy of a source message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingEntry {
    pub source_chat_id: i64,
    pub source_msg_id: i64,
    pub backup_chat_id: i64,
    pub backup_msg_id: i64,
    #[serde(default)]
    pub target_topic_id: Option<i64>,
    #[serde(with = "iso_timestamp")]
    pub timestamp: DateTime<Utc>,
}

impl MappingEntry {
    pub fn new(
        source: MessageRef,
        backup: MessageRef,
        target_topic_id: Option<i64>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            source_chat_id: source.chat_id,
            source_msg_id: source.message_id,
            backup_chat_id: backup.chat_id,
            backup_msg_id: backup.message_id,
            target_topic_id,
            timestamp,
        }
    }

    pub fn source(&self) -> MessageRef {
        MessageRef::new(self.source_chat_id, self.source_msg_id)
    }

    pub fn backup(&self) -> MessageRef {
        MessageRef::new(self.backup_chat_id, self.backup_msg_id)
    }
}

/// The ids of a persisted entry, read when its timestamp is missing or
/// unreadable.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct UndatedEntry {
    source_chat_id: i64,
    source_msg_id: i64,
    backup_chat_id: i64,
    backup_msg_id: i64,
    #[serde(default)]
    target_topic_id: Option<i64>,
}

impl UndatedEntry {
    pub(crate) fn dated(self, timestamp: DateTime<Utc>) -> MappingEntry {
        MappingEntry::new(
            MessageRef::new(self.source_chat_id, self.source_msg_id),
            MessageRef::new(self.backup_chat_id, self.backup_msg_id),
            self.target_topic_id,
            timestamp,
        )
    }
}

/// ISO-8601 timestamps. Naive values (no offset) are read as UTC.
mod iso_timestamp {
    use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339_opts(SecondsFormat::Micros, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if let Ok(parsed) = DateTime::parse_from_rfc3339(&raw) {
            return Ok(parsed.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
            .map(|naive| naive.and_utc())
            .map_err(|e| D::Error::custom(format!("invalid timestamp '{raw}': {e}")))
    }
}
