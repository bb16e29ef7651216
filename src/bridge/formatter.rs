use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tracing::warn;

use crate::bridge::message::{DestinationTarget, Sender, SourceMessage};
use crate::config::{Config, LabelsConfig};
use crate::utils::formatting::{avatar_glyph, neutralize_mass_mentions, truncate_chars};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const CLOCK_FORMAT: &str = "%H:%M:%S";
const SEPARATOR_WIDTH: usize = 30;
const EDIT_BLOCK_START: &str = "\n\n----\n";

/// Renders relayed text: sender headers, edit annotations and recall notes.
#[derive(Debug, Clone)]
pub struct Formatter {
    timezone: Tz,
    labels: LabelsConfig,
    neutralize_mentions: bool,
}

impl Formatter {
    pub fn new(timezone: &str, labels: LabelsConfig, neutralize_mentions: bool) -> Self {
        let timezone = timezone.parse::<Tz>().unwrap_or_else(|_| {
            warn!("unknown timezone {timezone}, falling back to UTC");
            Tz::UTC
        });
        Self {
            timezone,
            labels,
            neutralize_mentions,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            &config.bridge.timezone,
            config.labels.clone(),
            config.bridge.disable_everyone_mention,
        )
    }

    pub fn local_time(&self, at: DateTime<Utc>) -> String {
        at.with_timezone(&self.timezone).format(TIME_FORMAT).to_string()
    }

    fn local_clock(&self, at: DateTime<Utc>) -> String {
        at.with_timezone(&self.timezone).format(CLOCK_FORMAT).to_string()
    }

    fn timezone_name(&self) -> &str {
        self.timezone.name()
    }

    fn body(&self, text: &str) -> String {
        if self.neutralize_mentions {
            neutralize_mass_mentions(text)
        } else {
            text.to_string()
        }
    }

    /// Text of the relayed copy of `message` for `target`.
    pub fn build_content(
        &self,
        message: &SourceMessage,
        sender: &Sender,
        target: &DestinationTarget,
        show_header: bool,
    ) -> String {
        let body = self.body(message.text());
        let time = self.local_time(message.timestamp);
        let rich = message.is_rich_media();

        if !show_header {
            if rich {
                return body;
            }
            return if body.is_empty() {
                format!("`{time}`")
            } else {
                format!("{body}\n\n`{time}`")
            };
        }

        let mut header = avatar_glyph(&sender.display_name);
        header.push(' ');
        header.push_str(&sender.display_name);
        if let Some(handle) = sender.handle.as_deref().filter(|h| !h.is_empty()) {
            header.push_str(" @");
            header.push_str(handle);
        }
        let mut content = header.trim().to_string();

        if let Some(name) = target.display_name.as_deref().filter(|n| !n.is_empty()) {
            content.push_str("\n📢 ");
            content.push_str(name);
        }
        // Without a name the tag trails the sender line.
        if let Some(tag) = target.tag.as_deref().filter(|t| !t.is_empty()) {
            content.push(' ');
            content.push_str(tag);
        }

        content.push_str(&format!("\n🕐 {time} ({})\n", self.timezone_name()));
        if message.edited_at.is_some() {
            content.push_str(&self.labels.edited);
            content.push('\n');
        }
        if !rich {
            content.push_str(&"─".repeat(SEPARATOR_WIDTH));
            content.push('\n');
        }
        content.push_str(&body);
        content
    }

    /// Caption used for media relayed without a header and without text.
    pub fn timestamp_caption(&self, at: DateTime<Utc>) -> String {
        format!("`{}`", self.local_time(at))
    }

    /// Block appended to a relayed copy when its source is edited.
    pub fn edit_annotation(&self, message: &SourceMessage, edited_at: DateTime<Utc>) -> String {
        format!(
            "----\n{}: {} ({})\n{}",
            self.labels.edited_at,
            self.local_time(edited_at),
            self.timezone_name(),
            self.body(message.text())
        )
    }

    pub fn recall_marker(&self) -> &str {
        &self.labels.recall_marker
    }

    pub fn recall_marker_line(&self, at: DateTime<Utc>) -> String {
        format!("{} `{}`", self.labels.recall_marker, self.local_clock(at))
    }

    pub fn recall_alert(&self, at: DateTime<Utc>) -> String {
        format!(
            "{}\n{}: {}",
            self.labels.recall_alert,
            self.labels.recalled_at,
            self.local_clock(at)
        )
    }

    /// Alert sent when the relayed copy could not be marked in place.
    pub fn fallback_recall_alert(&self, at: DateTime<Utc>) -> String {
        format!("{}\n{}", self.recall_alert(at), self.labels.recall_marker)
    }

    /// Appends `block` after a blank line, or returns it alone for empty text.
    pub fn append_block(current: &str, block: &str) -> String {
        if current.is_empty() {
            block.to_string()
        } else {
            format!("{current}\n\n{block}")
        }
    }

    /// Like [`Formatter::append_block`], but keeps the result within
    /// `max_chars`. The relayed body is shortened first so earlier
    /// annotations and the new block stay whole.
    pub fn append_block_within(&self, current: &str, block: &str, max_chars: usize) -> String {
        let joined = Self::append_block(current, block);
        if joined.chars().count() <= max_chars {
            return joined;
        }
        if current.is_empty() {
            return truncate_chars(block, max_chars);
        }

        let (body, notes) = current.split_at(self.annotations_start(current));
        let tail = format!("{notes}\n\n{block}");
        let tail_chars = tail.chars().count();
        if tail_chars < max_chars {
            return format!("{}{tail}", truncate_chars(body, max_chars - tail_chars));
        }
        // Not even the annotations fit: the oldest ones go first.
        let kept: String = tail
            .chars()
            .skip(tail_chars + 1 - max_chars.max(1))
            .collect();
        format!("…{kept}")
    }

    /// Byte offset where appended edit and recall blocks begin in `text`.
    fn annotations_start(&self, text: &str) -> usize {
        let recall = format!("\n\n{} `", self.labels.recall_marker);
        [text.find(EDIT_BLOCK_START), text.find(&recall)]
            .into_iter()
            .flatten()
            .min()
            .unwrap_or(text.len())
    }
}
