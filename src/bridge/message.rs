use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::TargetConfig;
use crate::db::{MappingEntry, MessageRef};

/// A message observed in a monitored conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceMessage {
    pub source_conversation_id: i64,
    pub source_message_id: i64,
    pub sender_id: i64,
    pub sender_display_name: String,
    pub sender_handle: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub text: Option<String>,
    /// Uploaded files. Link previews never appear here.
    pub media: Vec<MediaRef>,
    pub is_link_preview: bool,
    /// Join notices, pins and similar events without user content.
    pub is_service: bool,
    pub edited_at: Option<DateTime<Utc>>,
    pub topic_id: Option<i64>,
    pub reply_to_message_id: Option<i64>,
}

impl SourceMessage {
    pub fn source_ref(&self) -> MessageRef {
        MessageRef::new(self.source_conversation_id, self.source_message_id)
    }

    pub fn has_media(&self) -> bool {
        !self.media.is_empty()
    }

    pub fn is_rich_media(&self) -> bool {
        self.has_media() && !self.is_link_preview
    }

    pub fn text(&self) -> &str {
        self.text.as_deref().unwrap_or_default()
    }

    pub fn has_text(&self) -> bool {
        !self.text().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub url: String,
    pub filename: String,
}

/// Who posted a source message, as resolved by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sender {
    pub id: i64,
    pub display_name: String,
    pub handle: Option<String>,
}

impl Sender {
    pub fn unknown() -> Self {
        Self {
            id: 0,
            display_name: "Unknown".to_string(),
            handle: None,
        }
    }
}

/// Where a monitored conversation is mirrored to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationTarget {
    pub destination_conversation_id: i64,
    pub destination_topic_id: Option<i64>,
    /// When set, only source messages from this topic are relayed.
    pub source_topic_filter: Option<i64>,
    pub display_name: Option<String>,
    pub tag: Option<String>,
}

impl DestinationTarget {
    pub fn accepts(&self, message: &SourceMessage) -> bool {
        match self.source_topic_filter {
            Some(filter) => message.topic_id == Some(filter),
            None => true,
        }
    }

    pub fn queue_key(&self) -> QueueKey {
        QueueKey {
            conversation_id: self.destination_conversation_id,
            topic_id: self.destination_topic_id,
        }
    }
}

impl From<&TargetConfig> for DestinationTarget {
    fn from(config: &TargetConfig) -> Self {
        Self {
            destination_conversation_id: config.target_id,
            destination_topic_id: config.target_topic_id,
            source_topic_filter: config.source_topic_id,
            display_name: config.name.clone(),
            tag: config.tag.clone(),
        }
    }
}

/// One ordered delivery lane: a destination conversation plus optional topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueKey {
    pub conversation_id: i64,
    pub topic_id: Option<i64>,
}

impl QueueKey {
    pub fn new(conversation_id: i64, topic_id: Option<i64>) -> Self {
        Self {
            conversation_id,
            topic_id,
        }
    }
}

impl From<&MappingEntry> for QueueKey {
    fn from(entry: &MappingEntry) -> Self {
        Self::new(entry.backup_chat_id, entry.target_topic_id)
    }
}

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.topic_id {
            Some(topic) => write!(f, "{}/{}", self.conversation_id, topic),
            None => write!(f, "{}", self.conversation_id),
        }
    }
}

/// Work for a lane worker.
#[derive(Debug, Clone)]
pub enum RelayTask {
    New {
        message: SourceMessage,
        target: DestinationTarget,
    },
    Edit {
        message: SourceMessage,
        entry: MappingEntry,
    },
    Delete {
        entry: MappingEntry,
    },
}

impl RelayTask {
    pub fn kind(&self) -> &'static str {
        match self {
            RelayTask::New { .. } => "new",
            RelayTask::Edit { .. } => "edit",
            RelayTask::Delete { .. } => "delete",
        }
    }
}
