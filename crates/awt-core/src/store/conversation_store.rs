//! Bounded conversation store with canonical-ID merging and ranked search.
//!
//! The whole store is one KV document `{by_id, order, url_to_id}`;
//! read-modify-write cycles are serialized behind a mutex within the tab
//! and last-writer-wins across tabs.

use chrono::Utc;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::capture::{conversation_id_from_url, normalize_url};
use crate::store::kv::KvStore;
use crate::store::schema::{Conversation, ConversationIndex, ConversationMessage};

const CONVERSATIONS_KEY: &str = "conversations";
const GLOBAL_NOTES_KEY: &str = "global_notes";
const DEFAULT_MAX_ITEMS: usize = 80;
const DEFAULT_MAX_BYTES: usize = 8 * 1024 * 1024;
const DEFAULT_SEARCH_LIMIT: usize = 50;
const TWO_WEEKS_MS: i64 = 14 * 24 * 3600 * 1000;

lazy_static! {
    static ref HAS_CODE: Regex = Regex::new(r"(?i)stack trace|traceback|exception").unwrap();
    static ref STOP_WORDS: Vec<&'static str> = vec![
        "the", "a", "an", "and", "or", "of", "to", "in", "on", "for", "is", "it", "at", "by",
        "with", "this", "that",
    ];
}

/// Incoming payload for a save. `None` fields mean "leave whatever the
/// stored record already has".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationDraft {
    pub id: Option<String>,
    pub title: Option<String>,
    #[serde(default)]
    pub url: String,
    pub ts: Option<i64>,
    #[serde(default)]
    pub messages: Vec<ConversationMessage>,
    pub text: Option<String>,
    pub hash: Option<String>,
    /// Accepts an array or a single string; normalized to an array.
    pub tags: Option<serde_json::Value>,
    pub pinned: Option<bool>,
    pub notes: Option<String>,
}

/// Meta-only patch applied by `update_conversation_meta`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetaPatch {
    pub tags: Option<serde_json::Value>,
    pub pinned: Option<bool>,
    pub notes: Option<String>,
    pub title: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchSort {
    Relevance,
    #[default]
    Recent,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchFilters {
    #[serde(default)]
    pub pinned_only: bool,
    #[serde(default)]
    pub has_code: bool,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Inclusive `updated_at` window, unix milliseconds.
    #[serde(default)]
    pub since: Option<i64>,
    #[serde(default)]
    pub until: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub filters: SearchFilters,
    #[serde(default)]
    pub sort: SearchSort,
}

pub struct ConversationStore {
    kv: KvStore,
    max_items: usize,
    max_bytes: usize,
    lock: Mutex<()>,
}

impl ConversationStore {
    pub fn new(kv: KvStore) -> Self {
        Self::with_limits(kv, DEFAULT_MAX_ITEMS, DEFAULT_MAX_BYTES)
    }

    pub fn with_limits(kv: KvStore, max_items: usize, max_bytes: usize) -> Self {
        Self {
            kv,
            max_items,
            max_bytes,
            lock: Mutex::new(()),
        }
    }

    async fn load_index(&self) -> anyhow::Result<ConversationIndex> {
        Ok(self
            .kv
            .get::<ConversationIndex>(CONVERSATIONS_KEY)
            .await?
            .unwrap_or_default())
    }

    async fn persist_index(&self, index: &ConversationIndex) -> anyhow::Result<()> {
        self.kv.put(CONVERSATIONS_KEY, index).await
    }

    /// Save with canonical-ID migration and preserve-unless-overridden
    /// merging of tags/pinned/notes. Returns the stored record.
    pub async fn save(&self, draft: ConversationDraft) -> anyhow::Result<Conversation> {
        let _guard = self.lock.lock().await;
        let mut index = self.load_index().await?;
        let now = Utc::now();

        let normalized = normalize_url(&draft.url);
        let stable_id = conversation_id_from_url(&draft.url);
        let canonical_id = stable_id
            .clone()
            .or_else(|| draft.id.clone())
            .unwrap_or_else(|| format!("tmp_{}", uuid::Uuid::new_v4().simple()));
        let stable_available = stable_id.is_some() || canonical_id.starts_with("c_");

        // Migrate a provisional record that previously claimed this URL.
        let mut base: Option<Conversation> = None;
        if !normalized.is_empty() {
            if let Some(prev_id) = index.url_to_id.get(&normalized).cloned() {
                if prev_id != canonical_id && stable_available {
                    if let Some(previous) = index.by_id.remove(&prev_id) {
                        info!(from = %prev_id, to = %canonical_id, "migrating conversation id");
                        base = Some(previous);
                    }
                    index.order.retain(|id| id != &prev_id);
                }
            }
        }

        let mut record = index
            .by_id
            .remove(&canonical_id)
            .or(base)
            .unwrap_or_else(|| Conversation {
                id: canonical_id.clone(),
                title: String::new(),
                url: String::new(),
                ts: 0,
                messages: Vec::new(),
                text: String::new(),
                hash: None,
                tags: Vec::new(),
                pinned: false,
                notes: String::new(),
                created_at: now,
                updated_at: now,
            });

        record.id = canonical_id.clone();
        if let Some(title) = draft.title {
            if !title.is_empty() || record.title.is_empty() {
                record.title = title;
            }
        }
        if !draft.url.is_empty() {
            record.url = draft.url;
        }
        if let Some(ts) = draft.ts {
            record.ts = ts;
        }
        if !draft.messages.is_empty() {
            record.messages = draft.messages;
        }
        if let Some(text) = draft.text {
            record.text = text;
        }
        if draft.hash.is_some() {
            record.hash = draft.hash;
        }
        // Meta fields survive unless explicitly overridden.
        if let Some(tags) = draft.tags {
            record.tags = normalize_tags(tags);
        }
        if let Some(pinned) = draft.pinned {
            record.pinned = pinned;
        }
        if let Some(notes) = draft.notes {
            record.notes = notes;
        }
        record.updated_at = now;

        index.order.retain(|id| id != &canonical_id);
        index.order.insert(0, canonical_id.clone());
        if !normalized.is_empty() {
            index.url_to_id.insert(normalized, canonical_id.clone());
        }
        index.by_id.insert(canonical_id.clone(), record.clone());

        self.evict(&mut index);
        self.persist_index(&index).await?;
        debug!(id = %canonical_id, total = index.order.len(), "conversation saved");
        Ok(record)
    }

    fn evict(&self, index: &mut ConversationIndex) {
        while index.order.len() > self.max_items {
            Self::pop_tail(index);
        }
        while approx_size(index) > self.max_bytes && index.order.len() > 1 {
            Self::pop_tail(index);
        }
    }

    fn pop_tail(index: &mut ConversationIndex) {
        if let Some(evicted) = index.order.pop() {
            index.by_id.remove(&evicted);
            index.url_to_id.retain(|_, id| id != &evicted);
            debug!(id = %evicted, "conversation evicted");
        }
    }

    pub async fn get(&self, id: &str) -> anyhow::Result<Option<Conversation>> {
        let index = self.load_index().await?;
        Ok(index.by_id.get(id).cloned())
    }

    pub async fn id_for_url(&self, url: &str) -> anyhow::Result<Option<String>> {
        let index = self.load_index().await?;
        Ok(index.url_to_id.get(&normalize_url(url)).cloned())
    }

    pub async fn delete(&self, id: &str) -> anyhow::Result<bool> {
        let _guard = self.lock.lock().await;
        let mut index = self.load_index().await?;
        let existed = index.by_id.remove(id).is_some();
        if existed {
            index.order.retain(|entry| entry != id);
            index.url_to_id.retain(|_, entry| entry != id);
            self.persist_index(&index).await?;
        }
        Ok(existed)
    }

    pub async fn count(&self) -> anyhow::Result<usize> {
        Ok(self.load_index().await?.order.len())
    }

    /// Merge a meta patch, refresh `updated_at`, move the id to the head.
    pub async fn update_meta(
        &self,
        id: &str,
        patch: MetaPatch,
    ) -> anyhow::Result<Option<Conversation>> {
        let _guard = self.lock.lock().await;
        let mut index = self.load_index().await?;
        let Some(record) = index.by_id.get_mut(id) else {
            return Ok(None);
        };

        if let Some(tags) = patch.tags {
            record.tags = normalize_tags(tags);
        }
        if let Some(pinned) = patch.pinned {
            record.pinned = pinned;
        }
        if let Some(notes) = patch.notes {
            record.notes = notes;
        }
        if let Some(title) = patch.title {
            record.title = title;
        }
        record.updated_at = Utc::now();
        let snapshot = record.clone();

        index.order.retain(|entry| entry != id);
        index.order.insert(0, id.to_string());
        self.persist_index(&index).await?;
        Ok(Some(snapshot))
    }

    // ===== Search =====

    /// Ranked search over the stored conversations. See module docs for the
    /// scoring scheme; `_score` never leaves this function.
    pub async fn search(&self, query: &SearchQuery) -> anyhow::Result<Vec<Conversation>> {
        let index = self.load_index().await?;
        let limit = query.limit.unwrap_or(DEFAULT_SEARCH_LIMIT);
        let now_ms = Utc::now().timestamp_millis();

        let mut candidates: Vec<&Conversation> = index
            .order
            .iter()
            .filter_map(|id| index.by_id.get(id))
            .filter(|conv| passes_filters(conv, &query.filters))
            .collect();

        let phrase = query.query.trim().to_lowercase();
        let tokens = tokenize(&phrase);

        if phrase.is_empty() || tokens.is_empty() {
            candidates.sort_by(|a, b| {
                b.pinned
                    .cmp(&a.pinned)
                    .then(b.updated_at.cmp(&a.updated_at))
            });
            return Ok(candidates.into_iter().take(limit).cloned().collect());
        }

        let mut scored: Vec<(f64, &Conversation)> = candidates
            .into_iter()
            .filter_map(|conv| score(conv, &phrase, &tokens, now_ms).map(|s| (s, conv)))
            .collect();

        match query.sort {
            SearchSort::Relevance => scored.sort_by(|a, b| {
                b.0.partial_cmp(&a.0)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(b.1.pinned.cmp(&a.1.pinned))
                    .then(b.1.updated_at.cmp(&a.1.updated_at))
            }),
            SearchSort::Recent => scored.sort_by(|a, b| {
                b.1.pinned
                    .cmp(&a.1.pinned)
                    .then(b.1.updated_at.cmp(&a.1.updated_at))
            }),
        }

        Ok(scored
            .into_iter()
            .take(limit)
            .map(|(_, conv)| conv.clone())
            .collect())
    }

    // ===== Global notes =====

    pub async fn global_notes(&self) -> anyhow::Result<String> {
        Ok(self
            .kv
            .get::<String>(GLOBAL_NOTES_KEY)
            .await?
            .unwrap_or_default())
    }

    pub async fn set_global_notes(&self, text: &str) -> anyhow::Result<()> {
        self.kv.put(GLOBAL_NOTES_KEY, &text.to_string()).await
    }
}

fn normalize_tags(value: serde_json::Value) -> Vec<String> {
    match value {
        serde_json::Value::Array(items) => items
            .into_iter()
            .filter_map(|v| match v {
                serde_json::Value::String(s) if !s.trim().is_empty() => {
                    Some(s.trim().to_string())
                }
                _ => None,
            })
            .collect(),
        serde_json::Value::String(s) if !s.trim().is_empty() => vec![s.trim().to_string()],
        _ => Vec::new(),
    }
}

fn approx_size(index: &ConversationIndex) -> usize {
    serde_json::to_string(index).map(|s| s.len()).unwrap_or(0)
}

fn passes_filters(conv: &Conversation, filters: &SearchFilters) -> bool {
    if filters.pinned_only && !conv.pinned {
        return false;
    }
    if filters.has_code && !(conv.text.contains("```") || HAS_CODE.is_match(&conv.text)) {
        return false;
    }
    if let Some(tag) = &filters.tag {
        if !conv.tags.iter().any(|t| t.eq_ignore_ascii_case(tag)) {
            return false;
        }
    }
    if !filters.tags.is_empty()
        && !filters
            .tags
            .iter()
            .all(|tag| conv.tags.iter().any(|t| t.eq_ignore_ascii_case(tag)))
    {
        return false;
    }
    let updated_ms = conv.updated_at.timestamp_millis();
    if let Some(since) = filters.since {
        if updated_ms < since {
            return false;
        }
    }
    if let Some(until) = filters.until {
        if updated_ms > until {
            return false;
        }
    }
    true
}

fn tokenize(phrase: &str) -> Vec<String> {
    phrase
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty() && !STOP_WORDS.contains(t))
        .map(|t| t.to_string())
        .collect()
}

fn word_start_hit(haystack_lower: &str, token: &str) -> bool {
    haystack_lower
        .split(|c: char| !c.is_alphanumeric())
        .any(|word| word.starts_with(token))
}

/// Score one conversation against the query, or `None` when nothing hits.
/// Phrase bonuses apply to multi-token queries only; single tokens are
/// covered by the per-token weights (title 18, tag 14, url 4, text 4, plus
/// word-start 6/2 for tokens of three or more chars).
fn score(
    conv: &Conversation,
    phrase: &str,
    tokens: &[String],
    now_ms: i64,
) -> Option<f64> {
    let title = conv.title.to_lowercase();
    let text = conv.text.to_lowercase();
    let url = conv.url.to_lowercase();
    let tags: Vec<String> = conv.tags.iter().map(|t| t.to_lowercase()).collect();

    let mut score = 0.0;
    let mut hit = false;

    if tokens.len() > 1 {
        if title.contains(phrase) {
            score += 40.0;
            hit = true;
        }
        if text.contains(phrase) {
            score += 10.0;
            hit = true;
        }
    }

    for token in tokens {
        let mut token_hit = false;
        if title.contains(token.as_str()) {
            score += 18.0;
            token_hit = true;
        }
        if tags.iter().any(|t| t.contains(token.as_str())) {
            score += 14.0;
            token_hit = true;
        }
        if url.contains(token.as_str()) {
            score += 4.0;
            token_hit = true;
        }
        if text.contains(token.as_str()) {
            score += 4.0;
            token_hit = true;
        }
        if token.len() >= 3 {
            if word_start_hit(&title, token) {
                score += 6.0;
            }
            if word_start_hit(&text, token) {
                score += 2.0;
            }
        }
        hit |= token_hit;
    }

    if !hit {
        return None;
    }

    let age = (now_ms - conv.updated_at.timestamp_millis()).max(0);
    let boost = (((TWO_WEEKS_MS - age) as f64 / TWO_WEEKS_MS as f64) * 0.2).clamp(0.0, 0.2);
    score *= 1.0 + boost;

    if conv.pinned {
        score += 5.0;
    }
    Some(score)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn draft(id: &str, url: &str, title: &str, text: &str) -> ConversationDraft {
        ConversationDraft {
            id: Some(id.to_string()),
            title: Some(title.to_string()),
            url: url.to_string(),
            ts: Some(1_700_000_000_000),
            text: Some(text.to_string()),
            ..Default::default()
        }
    }

    async fn fresh_store() -> MemoryStore {
        MemoryStore::new_in_memory().unwrap()
    }

    // ===== Canonical-ID merge (law 6, E2) =====

    #[tokio::test]
    async fn test_tmp_record_migrates_to_canonical_id() {
        let store = fresh_store().await;
        let conversations = &store.conversations;

        // The /c/<hash> URL wins over the provisional id immediately.
        conversations
            .save(ConversationDraft {
                tags: Some(serde_json::json!(["rust"])),
                notes: Some("keep me".into()),
                ..draft("tmp_x", "https://chatgpt.com/c/abc", "Early", "early text")
            })
            .await
            .unwrap();

        // Second save for the same URL carries the stable id.
        conversations
            .save(draft("c_abc", "https://chatgpt.com/c/abc", "Later", "later text"))
            .await
            .unwrap();

        let by_url = conversations
            .id_for_url("https://chatgpt.com/c/abc")
            .await
            .unwrap();
        assert_eq!(by_url.as_deref(), Some("c_abc"));

        assert!(conversations.get("tmp_x").await.unwrap().is_none());
        let merged = conversations.get("c_abc").await.unwrap().unwrap();
        assert_eq!(merged.title, "Later");
        // Meta survives migration.
        assert_eq!(merged.tags, vec!["rust".to_string()]);
        assert_eq!(merged.notes, "keep me");

        let listing = conversations.search(&SearchQuery::default()).await.unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].id, "c_abc");
    }

    #[tokio::test]
    async fn test_url_claim_migrates_when_stable_id_arrives_later() {
        let store = fresh_store().await;
        let conversations = &store.conversations;

        // URL without a /c/ segment: provisional id claims it.
        conversations
            .save(ConversationDraft {
                notes: Some("early notes".into()),
                ..draft("tmp_early", "https://claude.ai/new", "Draft", "text v1")
            })
            .await
            .unwrap();

        // Same URL, now with a stable incoming id: record migrates.
        conversations
            .save(draft("c_final", "https://claude.ai/new", "Final", "text v2"))
            .await
            .unwrap();

        assert!(conversations.get("tmp_early").await.unwrap().is_none());
        let merged = conversations.get("c_final").await.unwrap().unwrap();
        assert_eq!(merged.notes, "early notes");
        assert_eq!(
            conversations
                .id_for_url("https://claude.ai/new")
                .await
                .unwrap()
                .as_deref(),
            Some("c_final")
        );
        assert_eq!(conversations.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_canonical_id_derived_even_when_incoming_id_is_tmp() {
        let store = fresh_store().await;
        let saved = store
            .conversations
            .save(draft("tmp_zzz", "https://chatgpt.com/c/stable9", "T", "body"))
            .await
            .unwrap();
        assert_eq!(saved.id, "c_stable9");
    }

    #[tokio::test]
    async fn test_meta_preserved_unless_overridden() {
        let store = fresh_store().await;
        store
            .conversations
            .save(ConversationDraft {
                pinned: Some(true),
                tags: Some(serde_json::json!("solo-tag")),
                ..draft("c_m", "https://chatgpt.com/c/m", "Title", "body")
            })
            .await
            .unwrap();

        // Re-save without meta: pinned and tags survive.
        let resaved = store
            .conversations
            .save(draft("c_m", "https://chatgpt.com/c/m", "Title v2", "body v2"))
            .await
            .unwrap();
        assert!(resaved.pinned);
        assert_eq!(resaved.tags, vec!["solo-tag".to_string()]);

        // Explicit override wins.
        let overridden = store
            .conversations
            .save(ConversationDraft {
                pinned: Some(false),
                ..draft("c_m", "https://chatgpt.com/c/m", "Title v3", "body v3")
            })
            .await
            .unwrap();
        assert!(!overridden.pinned);
    }

    // ===== Eviction (law 7) =====

    #[tokio::test]
    async fn test_count_cap_evicts_tail() {
        let store = fresh_store().await;
        let conversations =
            ConversationStore::with_limits(store.kv.clone(), 3, DEFAULT_MAX_BYTES);

        for i in 0..5 {
            conversations
                .save(draft(
                    &format!("c_{}", i),
                    &format!("https://chatgpt.com/c/{}", i),
                    &format!("Chat {}", i),
                    "text",
                ))
                .await
                .unwrap();
        }

        let listing = conversations.search(&SearchQuery::default()).await.unwrap();
        assert_eq!(listing.len(), 3);
        let ids: Vec<&str> = listing.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["c_4", "c_3", "c_2"]);
        assert!(conversations.get("c_0").await.unwrap().is_none());
        assert!(conversations
            .id_for_url("https://chatgpt.com/c/0")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_byte_cap_evicts_but_keeps_at_least_one() {
        let store = fresh_store().await;
        let conversations = ConversationStore::with_limits(store.kv.clone(), 100, 4096);

        let big = "x".repeat(3000);
        for i in 0..3 {
            conversations
                .save(draft(
                    &format!("c_big{}", i),
                    &format!("https://chatgpt.com/c/big{}", i),
                    "Big",
                    &big,
                ))
                .await
                .unwrap();
        }
        let count = conversations.count().await.unwrap();
        assert!(count >= 1 && count < 3);
    }

    // ===== Meta updates =====

    #[tokio::test]
    async fn test_update_meta_moves_to_head() {
        let store = fresh_store().await;
        let conversations = &store.conversations;
        conversations
            .save(draft("c_a", "https://chatgpt.com/c/a", "A", "a"))
            .await
            .unwrap();
        conversations
            .save(draft("c_b", "https://chatgpt.com/c/b", "B", "b"))
            .await
            .unwrap();

        let updated = conversations
            .update_meta(
                "c_a",
                MetaPatch {
                    pinned: Some(true),
                    tags: Some(serde_json::json!(["starred"])),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert!(updated.pinned);

        let listing = conversations.search(&SearchQuery::default()).await.unwrap();
        assert_eq!(listing[0].id, "c_a");

        assert!(conversations
            .update_meta("missing", MetaPatch::default())
            .await
            .unwrap()
            .is_none());
    }

    // ===== Search (laws 8, 9, E3) =====

    async fn seed_search_store(store: &MemoryStore) {
        let conversations = &store.conversations;
        // A: query in title. B: query in tag. C: query in body only.
        conversations
            .save(draft(
                "c_a",
                "https://chatgpt.com/c/a",
                "Django deployment woes",
                "nothing relevant here",
            ))
            .await
            .unwrap();
        conversations
            .save(ConversationDraft {
                tags: Some(serde_json::json!(["django"])),
                ..draft("c_b", "https://chatgpt.com/c/b", "Deploy help", "other things")
            })
            .await
            .unwrap();
        conversations
            .save(draft(
                "c_c",
                "https://chatgpt.com/c/c",
                "Random chat",
                "we talked about django internals",
            ))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_search_ranking_title_tag_text() {
        let store = fresh_store().await;
        seed_search_store(&store).await;

        let results = store
            .conversations
            .search(&SearchQuery {
                query: "django".into(),
                sort: SearchSort::Relevance,
                ..Default::default()
            })
            .await
            .unwrap();

        let ids: Vec<&str> = results.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["c_a", "c_b", "c_c"]);
    }

    #[tokio::test]
    async fn test_search_requires_a_hit() {
        let store = fresh_store().await;
        seed_search_store(&store).await;
        let results = store
            .conversations
            .search(&SearchQuery {
                query: "kubernetes".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_phrase_in_title_scores_high() {
        let store = fresh_store().await;
        store
            .conversations
            .save(draft(
                "c_t",
                "https://chatgpt.com/c/t",
                "fix memory leak tonight",
                "unrelated",
            ))
            .await
            .unwrap();
        store
            .conversations
            .save(draft(
                "c_u",
                "https://chatgpt.com/c/u",
                "other title",
                "we should fix memory leak later",
            ))
            .await
            .unwrap();

        let results = store
            .conversations
            .search(&SearchQuery {
                query: "memory leak".into(),
                sort: SearchSort::Relevance,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(results[0].id, "c_t");
        assert_eq!(results[1].id, "c_u");
    }

    #[tokio::test]
    async fn test_empty_query_orders_pinned_then_recent() {
        let store = fresh_store().await;
        let conversations = &store.conversations;
        conversations
            .save(draft("c_old", "https://chatgpt.com/c/old", "Old", "x"))
            .await
            .unwrap();
        conversations
            .save(ConversationDraft {
                pinned: Some(true),
                ..draft("c_pin", "https://chatgpt.com/c/pin", "Pinned", "x")
            })
            .await
            .unwrap();
        conversations
            .save(draft("c_new", "https://chatgpt.com/c/new", "New", "x"))
            .await
            .unwrap();

        let results = conversations
            .search(&SearchQuery {
                limit: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, "c_pin");
        assert_eq!(results[1].id, "c_new");
    }

    #[tokio::test]
    async fn test_filters_pinned_tag_and_code() {
        let store = fresh_store().await;
        let conversations = &store.conversations;
        conversations
            .save(ConversationDraft {
                pinned: Some(true),
                tags: Some(serde_json::json!(["work"])),
                ..draft(
                    "c_code",
                    "https://chatgpt.com/c/code",
                    "Code chat",
                    "some ```rust\nfn main() {}\n``` block",
                )
            })
            .await
            .unwrap();
        conversations
            .save(draft("c_plain", "https://chatgpt.com/c/plain", "Plain", "no code"))
            .await
            .unwrap();

        let pinned_only = conversations
            .search(&SearchQuery {
                filters: SearchFilters {
                    pinned_only: true,
                    ..Default::default()
                },
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(pinned_only.len(), 1);
        assert_eq!(pinned_only[0].id, "c_code");

        let has_code = conversations
            .search(&SearchQuery {
                filters: SearchFilters {
                    has_code: true,
                    ..Default::default()
                },
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(has_code.len(), 1);

        let by_tag = conversations
            .search(&SearchQuery {
                filters: SearchFilters {
                    tag: Some("work".into()),
                    ..Default::default()
                },
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_tag.len(), 1);
    }

    // ===== Global notes =====

    #[tokio::test]
    async fn test_global_notes_roundtrip() {
        let store = fresh_store().await;
        assert_eq!(store.conversations.global_notes().await.unwrap(), "");
        store
            .conversations
            .set_global_notes("remember the milk")
            .await
            .unwrap();
        assert_eq!(
            store.conversations.global_notes().await.unwrap(),
            "remember the milk"
        );
    }

    // ===== Delete =====

    #[tokio::test]
    async fn test_delete_removes_everywhere() {
        let store = fresh_store().await;
        store
            .conversations
            .save(draft("c_d", "https://chatgpt.com/c/d", "D", "d"))
            .await
            .unwrap();
        assert!(store.conversations.delete("c_d").await.unwrap());
        assert!(!store.conversations.delete("c_d").await.unwrap());
        assert!(store.conversations.get("c_d").await.unwrap().is_none());
        assert!(store
            .conversations
            .id_for_url("https://chatgpt.com/c/d")
            .await
            .unwrap()
            .is_none());
    }
}
