use chrono::{DateTime, Utc};

use crate::bridge::message::{QueueKey, SourceMessage};
use crate::db::MappingEntry;

/// How a new message is put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DeliveryPlan {
    /// Plain text with the destination's link unfurling left on.
    LinkPreview { text: String },
    Text { text: String },
    Media { caption: String },
    /// Files go out bare and the header follows as a reply to them.
    MediaThenHeader { header: String },
}

pub(crate) fn plan_delivery(
    message: &SourceMessage,
    show_header: bool,
    content: String,
    timestamp_caption: impl FnOnce() -> String,
) -> DeliveryPlan {
    if message.is_link_preview {
        return DeliveryPlan::LinkPreview { text: content };
    }
    if !message.is_rich_media() {
        return DeliveryPlan::Text { text: content };
    }
    if show_header && !message.has_text() {
        return DeliveryPlan::MediaThenHeader { header: content };
    }

    let caption = if content.is_empty() && !show_header {
        timestamp_caption()
    } else {
        content
    };
    DeliveryPlan::Media { caption }
}

/// Picks the message a new copy should reply to on `lane`: the copy of the
/// source's reply target on the same lane, otherwise the lane's topic anchor.
/// Copies in another topic of the same conversation cannot be replied to.
pub(crate) fn resolve_reply_target(reply_copies: &[MappingEntry], lane: &QueueKey) -> Option<i64> {
    reply_copies
        .iter()
        .find(|entry| {
            entry.backup_chat_id == lane.conversation_id && entry.target_topic_id == lane.topic_id
        })
        .map(|entry| entry.backup_msg_id)
        .or(lane.topic_id)
}

/// Recalls of copies older than `ignore_days` whole days are not mirrored.
/// Zero disables the cutoff.
pub(crate) fn recall_is_ignored(entry: &MappingEntry, now: DateTime<Utc>, ignore_days: u32) -> bool {
    ignore_days > 0 && (now - entry.timestamp).num_days() >= i64::from(ignore_days)
}
