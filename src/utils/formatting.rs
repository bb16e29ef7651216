use once_cell::sync::Lazy;
use regex::Regex;

const MAX_PREVIEW_CHARS: usize = 120;

static MASS_MENTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"@(everyone|here)\b").expect("Invalid regex"));

static LINK: Lazy<Regex> = Lazy::new(|| Regex::new(r"https?://[^\s<>]+").expect("Invalid regex"));

/// Shortens `value` for log lines.
pub fn preview_text(value: &str) -> String {
    let mut chars = value.chars();
    let preview: String = chars.by_ref().take(MAX_PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{preview}…")
    } else {
        preview
    }
}

/// The glyph shown in a sender header: first character of the display name,
/// or a generic person when the name is empty.
pub fn avatar_glyph(display_name: &str) -> String {
    match display_name.trim().chars().next() {
        Some(first) => format!("🧑[{first}]"),
        None => "🧑".to_string(),
    }
}

/// Breaks `@everyone` and `@here` with a zero-width space so relayed text
/// cannot ping a whole destination server.
pub fn neutralize_mass_mentions(text: &str) -> String {
    MASS_MENTION.replace_all(text, "@\u{200B}$1").into_owned()
}

pub fn contains_link(text: &str) -> bool {
    LINK.is_match(text)
}

/// Cuts `text` to at most `max_chars` characters, ending with an ellipsis
/// when anything was dropped.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    format!("{kept}…")
}
