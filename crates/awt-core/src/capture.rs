//! Captured-conversation normalization.
//!
//! The DOM side is an external collaborator; it hands over
//! `{url, title, messages}` and this module derives the canonical id, the
//! joined text form, and the content hash.

use lazy_static::lazy_static;
use regex::Regex;

use crate::store::conversation_store::ConversationDraft;
use crate::store::ConversationMessage;

lazy_static! {
    static ref CONVERSATION_PATH: Regex = Regex::new(r"/c/([A-Za-z0-9_-]+)").unwrap();
    static ref NON_SLUG: Regex = Regex::new(r"[^a-z0-9]+").unwrap();
}

/// Raw capture handed over by the content layer.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct CapturedConversation {
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub messages: Vec<ConversationMessage>,
    #[serde(default)]
    pub ts: Option<i64>,
}

/// Map a chat URL to its platform slug (used for token budgets and
/// session bookkeeping).
pub fn platform_for_url(url: &str) -> String {
    let host = url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_lowercase()))
        .unwrap_or_default();

    for (needle, platform) in [
        ("chatgpt.com", "chatgpt"),
        ("chat.openai.com", "chatgpt"),
        ("claude.ai", "claude"),
        ("perplexity.ai", "perplexity"),
        ("gemini.google.com", "gemini"),
        ("poe.com", "poe"),
        ("copilot.microsoft.com", "copilot"),
        ("bing.com", "bing"),
        ("you.com", "you"),
        ("huggingface.co", "huggingface"),
        ("grok.com", "grok"),
    ] {
        if host == needle || host.ends_with(&format!(".{}", needle)) {
            return platform.to_string();
        }
    }
    "default".to_string()
}

/// Canonical URL form used as the `url_to_id` key: fragment stripped,
/// trailing slash removed.
pub fn normalize_url(url: &str) -> String {
    let trimmed = url.trim();
    let without_fragment = trimmed.split('#').next().unwrap_or(trimmed);
    without_fragment.trim_end_matches('/').to_string()
}

/// `c_<hash>` when the URL carries a `/c/<hash>` segment.
pub fn conversation_id_from_url(url: &str) -> Option<String> {
    CONVERSATION_PATH
        .captures(url)
        .and_then(|caps| caps.get(1))
        .map(|m| format!("c_{}", m.as_str()))
}

/// Provisional key for conversations without a stable URL id.
pub fn tmp_id(seed: &str) -> String {
    let slug = NON_SLUG
        .replace_all(&seed.to_lowercase(), "_")
        .trim_matches('_')
        .to_string();
    let mut slug = if slug.is_empty() { "chat".to_string() } else { slug };
    slug.truncate(40);
    format!("tmp_{}", slug)
}

/// 32-bit FNV-1a over the `role:text` lines, hex encoded.
pub fn content_fingerprint(messages: &[ConversationMessage]) -> String {
    const FNV_OFFSET: u32 = 0x811c9dc5;
    const FNV_PRIME: u32 = 0x0100_0193;

    let mut hash = FNV_OFFSET;
    for message in messages {
        for byte in message
            .role
            .bytes()
            .chain(std::iter::once(b':'))
            .chain(message.text.bytes())
            .chain(std::iter::once(b'\n'))
        {
            hash ^= byte as u32;
            hash = hash.wrapping_mul(FNV_PRIME);
        }
    }
    format!("{:08x}", hash)
}

/// Joined text form: `[ROLE]\n<msg>\n` per message.
pub fn joined_text(messages: &[ConversationMessage]) -> String {
    let mut out = String::new();
    for message in messages {
        out.push('[');
        out.push_str(&message.role.to_uppercase());
        out.push_str("]\n");
        out.push_str(&message.text);
        out.push('\n');
    }
    out
}

/// Build a store-ready draft from a raw capture.
pub fn normalize_capture(capture: &CapturedConversation) -> ConversationDraft {
    let id = conversation_id_from_url(&capture.url).unwrap_or_else(|| {
        let seed = if capture.title.is_empty() {
            capture.url.as_str()
        } else {
            capture.title.as_str()
        };
        tmp_id(seed)
    });

    ConversationDraft {
        id: Some(id),
        title: Some(capture.title.clone()),
        url: capture.url.clone(),
        ts: capture.ts,
        messages: capture.messages.clone(),
        text: Some(joined_text(&capture.messages)),
        hash: Some(content_fingerprint(&capture.messages)),
        tags: None,
        pinned: None,
        notes: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(role: &str, text: &str) -> ConversationMessage {
        ConversationMessage {
            role: role.into(),
            text: text.into(),
        }
    }

    // ===== Ids =====

    #[test]
    fn test_canonical_id_from_chat_url() {
        assert_eq!(
            conversation_id_from_url("https://chatgpt.com/c/abc-123"),
            Some("c_abc-123".to_string())
        );
        assert_eq!(conversation_id_from_url("https://chatgpt.com/settings"), None);
    }

    #[test]
    fn test_tmp_id_sanitizes_seed() {
        let id = tmp_id("My Great Chat! (v2)");
        assert!(id.starts_with("tmp_"));
        assert!(id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'));
    }

    // ===== URL normalization and platforms =====

    #[test]
    fn test_normalize_url_strips_fragment_and_slash() {
        assert_eq!(
            normalize_url("https://chatgpt.com/c/abc/#section "),
            "https://chatgpt.com/c/abc"
        );
    }

    #[test]
    fn test_platform_detection() {
        assert_eq!(platform_for_url("https://chatgpt.com/c/x"), "chatgpt");
        assert_eq!(platform_for_url("https://claude.ai/chat/y"), "claude");
        assert_eq!(platform_for_url("https://unknown.example/z"), "default");
    }

    // ===== Text and fingerprint =====

    #[test]
    fn test_joined_text_format() {
        let text = joined_text(&[msg("user", "hi"), msg("assistant", "hello")]);
        assert_eq!(text, "[USER]\nhi\n[ASSISTANT]\nhello\n");
    }

    #[test]
    fn test_fingerprint_sensitive_to_role_and_text() {
        let a = content_fingerprint(&[msg("user", "hi")]);
        let b = content_fingerprint(&[msg("assistant", "hi")]);
        let c = content_fingerprint(&[msg("user", "hi")]);
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(a.len(), 8);
    }

    #[test]
    fn test_normalize_capture_prefers_url_id() {
        let capture = CapturedConversation {
            url: "https://chatgpt.com/c/abc".into(),
            title: "Debugging".into(),
            messages: vec![msg("user", "help")],
            ts: Some(1_700_000_000_000),
        };
        let draft = normalize_capture(&capture);
        assert_eq!(draft.id.as_deref(), Some("c_abc"));
        assert_eq!(draft.text.as_deref(), Some("[USER]\nhelp\n"));
        assert!(draft.hash.is_some());
    }
}
