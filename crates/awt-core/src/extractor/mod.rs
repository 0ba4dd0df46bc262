//! Pattern-based entity and relationship extraction.
//!
//! Transforms a raw text blob into graph mutations: language, framework,
//! error, topic, entity, and goal nodes plus the relationships between
//! them. Purely pattern-driven; no learned models.

pub mod patterns;

use std::collections::HashMap;
use std::sync::Arc;

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::json;
use tracing::debug;

use crate::graph::{EdgeDraft, EdgeType, MemoryGraph, NodeDraft, NodeType};
pub use patterns::{ErrorSignature, FrameworkPattern, LanguagePattern, PatternLibrary, TopicPattern};

const MIN_INPUT_LEN: usize = 20;
const CODE_BLOCK_MIN_LEN: usize = 10;
const CODE_BLOCK_TRUNCATE: usize = 500;
const LANGUAGE_SCORE_CEILING: f64 = 30.0;

lazy_static! {
    static ref FENCED_BLOCK: Regex =
        Regex::new(r"(?s)```([A-Za-z0-9_+-]*)\n(.*?)```").unwrap();
    static ref FILE_MENTION: Regex = Regex::new(
        r"\b[\w./-]*\w\.(?:py|ipynb|js|jsx|mjs|ts|tsx|rs|go|java|rb|php|c|cc|cpp|h|hpp|cs|swift|kt|sql|sh|css|html|json|yaml|yml|toml|md)\b"
    )
    .unwrap();
    static ref FUNCTION_DEF: Regex =
        Regex::new(r"\b(?:def|fn|func|fun|function)\s+([A-Za-z_]\w*)\s*\(").unwrap();
    static ref CLASS_MENTION: Regex =
        Regex::new(r"\b[A-Z][a-z0-9]+(?:[A-Z][a-z0-9]+)+\b").unwrap();
    static ref URL_MENTION: Regex = Regex::new(r#"https?://[^\s<>"')\]]+"#).unwrap();
    static ref GOAL_TEMPLATES: Vec<Regex> = vec![
        Regex::new(r"(?i)\bi(?:'m| am)? (?:want|trying|need)(?: to)? ([^.!?\n]{5,100})").unwrap(),
        Regex::new(r"(?i)\b(?:build|building|fix|fixing|implement|implementing|create|creating)\s+([^.!?\n]{5,100})").unwrap(),
        Regex::new(r"(?i)\bworking on ([^.!?\n]{5,100})").unwrap(),
    ];
    /// Multi-cap product names that look like PascalCase class mentions.
    static ref CLASS_STOPLIST: Vec<&'static str> = vec![
        "JavaScript", "TypeScript", "PostgreSQL", "MySQL", "MongoDB", "GitHub", "GitLab",
        "OpenAI", "MacOS", "DevOps", "GraphQL", "NodeJs", "WebSocket", "VsCode", "ChatGpt",
        "FastApi", "NextJs", "RestApi",
    ];
}

#[derive(Debug, Clone, Default)]
pub struct ExtractionContext {
    pub platform: Option<String>,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DetectedLanguage {
    pub name: String,
    pub score: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone)]
pub struct DetectedCodeBlock {
    pub language: String,
    pub content: String,
    pub full_length: usize,
}

#[derive(Debug, Clone)]
pub struct DetectedFramework {
    pub name: String,
    pub language: String,
    pub confidence: f64,
}

#[derive(Debug, Clone)]
pub struct DetectedError {
    pub error_type: String,
    pub message: String,
    pub context: String,
    pub importance: f64,
}

#[derive(Debug, Clone)]
pub struct DetectedTopic {
    pub name: String,
    pub confidence: f64,
}

/// Everything one extraction pass found and materialized.
#[derive(Debug, Clone, Default)]
pub struct ExtractionReport {
    pub languages: Vec<DetectedLanguage>,
    pub code_blocks: Vec<DetectedCodeBlock>,
    pub frameworks: Vec<DetectedFramework>,
    pub errors: Vec<DetectedError>,
    pub topics: Vec<DetectedTopic>,
    pub files: Vec<String>,
    pub functions: Vec<String>,
    pub classes: Vec<String>,
    pub urls: Vec<String>,
    pub goals: Vec<String>,
    pub node_ids: Vec<String>,
    pub edge_ids: Vec<String>,
}

pub struct Extractor {
    library: Arc<PatternLibrary>,
}

impl Default for Extractor {
    fn default() -> Self {
        Self::new()
    }
}

impl Extractor {
    pub fn new() -> Self {
        Self {
            library: Arc::new(patterns::DEFAULT_LIBRARY.clone()),
        }
    }

    pub fn with_library(library: PatternLibrary) -> Self {
        Self {
            library: Arc::new(library),
        }
    }

    /// Run the full detection pipeline over `text` and materialize nodes and
    /// edges in `graph`. Inputs shorter than 20 chars yield an empty report.
    pub fn extract(
        &self,
        graph: &mut MemoryGraph,
        text: &str,
        ctx: &ExtractionContext,
    ) -> ExtractionReport {
        let mut report = ExtractionReport::default();
        if text.trim().len() < MIN_INPUT_LEN {
            return report;
        }

        let lower = text.to_lowercase();

        report.languages = self.detect_languages(text, &lower);
        report.code_blocks = self.extract_code_blocks(text);
        report.frameworks = self.detect_frameworks(&lower);
        report.errors = self.detect_errors(text);
        report.topics = self.detect_topics(&lower);
        self.detect_entities(text, &mut report);
        report.goals = detect_goals(text);

        self.materialize(graph, ctx, &mut report);
        self.apply_session_effects(graph, &report);

        debug!(
            languages = report.languages.len(),
            code_blocks = report.code_blocks.len(),
            errors = report.errors.len(),
            topics = report.topics.len(),
            goals = report.goals.len(),
            "extraction pass complete"
        );
        report
    }

    // ===== Detection =====

    /// Score each language: 2 per keyword hit, 3 per pattern match, 5 per
    /// strong-marker mention; confidence = min(score/30, 1). Keeps the top
    /// three at confidence >= 0.3.
    fn detect_languages(&self, text: &str, lower: &str) -> Vec<DetectedLanguage> {
        let mut detected: Vec<DetectedLanguage> = self
            .library
            .languages
            .iter()
            .filter_map(|lang| {
                let keyword_hits = lang
                    .keywords
                    .iter()
                    .filter(|kw| lower.contains(kw.as_str()))
                    .count();
                let pattern_hits: usize = lang
                    .patterns
                    .iter()
                    .map(|p| p.find_iter(text).count())
                    .sum();
                let marker_hits: usize = lang
                    .markers
                    .iter()
                    .map(|m| lower.matches(m.as_str()).count())
                    .sum();

                let score =
                    2.0 * keyword_hits as f64 + 3.0 * pattern_hits as f64 + 5.0 * marker_hits as f64;
                if score <= 0.0 {
                    return None;
                }
                Some(DetectedLanguage {
                    name: lang.name.clone(),
                    score,
                    confidence: (score / LANGUAGE_SCORE_CEILING).min(1.0),
                })
            })
            .collect();

        detected.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        detected.truncate(3);
        detected.retain(|l| l.confidence >= 0.3);
        detected
    }

    /// Pull fenced code segments. A blank or "unknown" fence language is
    /// rescored against the language table (keyword + pattern weights only).
    fn extract_code_blocks(&self, text: &str) -> Vec<DetectedCodeBlock> {
        FENCED_BLOCK
            .captures_iter(text)
            .filter_map(|caps| {
                let content = caps.get(2)?.as_str().trim();
                if content.len() < CODE_BLOCK_MIN_LEN {
                    return None;
                }
                let declared = caps.get(1).map(|m| m.as_str().to_lowercase()).unwrap_or_default();
                let language = if declared.is_empty() || declared == "unknown" {
                    self.rescore_language(content)
                } else {
                    declared
                };
                Some(DetectedCodeBlock {
                    language,
                    content: truncate_chars(content, CODE_BLOCK_TRUNCATE),
                    full_length: content.len(),
                })
            })
            .collect()
    }

    fn rescore_language(&self, content: &str) -> String {
        let lower = content.to_lowercase();
        self.library
            .languages
            .iter()
            .map(|lang| {
                let keyword_hits = lang
                    .keywords
                    .iter()
                    .filter(|kw| lower.contains(kw.as_str()))
                    .count();
                let pattern_hits: usize = lang
                    .patterns
                    .iter()
                    .map(|p| p.find_iter(content).count())
                    .sum();
                (lang.name.as_str(), 2 * keyword_hits + 3 * pattern_hits)
            })
            .filter(|(_, score)| *score > 0)
            .max_by_key(|(_, score)| *score)
            .map(|(name, _)| name.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Count indicator hits per framework; confidence =
    /// min(hits/indicators + 0.3, 1). Dedup by name, keep top five at
    /// confidence >= 0.4.
    fn detect_frameworks(&self, lower: &str) -> Vec<DetectedFramework> {
        let mut best: HashMap<String, DetectedFramework> = HashMap::new();
        for lang in &self.library.languages {
            for framework in &lang.frameworks {
                let hits = framework
                    .indicators
                    .iter()
                    .filter(|ind| lower.contains(ind.as_str()))
                    .count();
                if hits == 0 {
                    continue;
                }
                let confidence =
                    (hits as f64 / framework.indicators.len() as f64 + 0.3).min(1.0);
                let entry = DetectedFramework {
                    name: framework.name.clone(),
                    language: lang.name.clone(),
                    confidence,
                };
                best.entry(framework.name.clone())
                    .and_modify(|existing| {
                        if confidence > existing.confidence {
                            *existing = entry.clone();
                        }
                    })
                    .or_insert(entry);
            }
        }

        let mut detected: Vec<DetectedFramework> = best.into_values().collect();
        detected.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        detected.truncate(5);
        detected.retain(|f| f.confidence >= 0.4);
        detected
    }

    /// Up to three matches per signature with surrounding context, deduped
    /// by exact message, top five by importance.
    fn detect_errors(&self, text: &str) -> Vec<DetectedError> {
        let mut seen: Vec<DetectedError> = Vec::new();
        for signature in &self.library.errors {
            for found in signature.pattern.find_iter(text).take(3) {
                let message = found.as_str().trim().to_string();
                if seen.iter().any(|e| e.message == message) {
                    continue;
                }
                let start = floor_char_boundary(text, found.start().saturating_sub(100));
                let end = floor_char_boundary(text, (found.end() + 200).min(text.len()));
                seen.push(DetectedError {
                    error_type: signature.error_type.clone(),
                    message,
                    context: text[start..end].to_string(),
                    importance: signature.importance,
                });
            }
        }
        seen.sort_by(|a, b| {
            b.importance
                .partial_cmp(&a.importance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        seen.truncate(5);
        seen
    }

    /// Two keyword hits minimum; confidence = min(hits/keywords + 0.2, 1);
    /// top three.
    fn detect_topics(&self, lower: &str) -> Vec<DetectedTopic> {
        let mut detected: Vec<DetectedTopic> = self
            .library
            .topics
            .iter()
            .filter_map(|topic| {
                let hits = topic
                    .keywords
                    .iter()
                    .filter(|kw| contains_word(lower, kw))
                    .count();
                if hits < 2 {
                    return None;
                }
                Some(DetectedTopic {
                    name: topic.name.clone(),
                    confidence: (hits as f64 / topic.keywords.len() as f64 + 0.2).min(1.0),
                })
            })
            .collect();
        detected.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        detected.truncate(3);
        detected
    }

    fn detect_entities(&self, text: &str, report: &mut ExtractionReport) {
        report.files = dedupe_capped(
            FILE_MENTION.find_iter(text).map(|m| m.as_str().to_string()),
            10,
        );
        report.functions = dedupe_capped(
            FUNCTION_DEF
                .captures_iter(text)
                .filter_map(|c| c.get(1).map(|m| m.as_str().to_string())),
            10,
        );
        report.classes = dedupe_capped(
            CLASS_MENTION
                .find_iter(text)
                .map(|m| m.as_str().to_string())
                .filter(|name| !CLASS_STOPLIST.contains(&name.as_str())),
            10,
        );
        report.urls = dedupe_capped(
            URL_MENTION.find_iter(text).map(|m| m.as_str().to_string()),
            10,
        );
    }

    // ===== Materialization =====

    fn materialize(
        &self,
        graph: &mut MemoryGraph,
        ctx: &ExtractionContext,
        report: &mut ExtractionReport,
    ) {
        let draft_base = |confidence: Option<f64>, importance: Option<f64>| NodeDraft {
            importance,
            confidence,
            source: Some("extractor".into()),
            platform: ctx.platform.clone(),
            session_id: ctx.session_id.clone(),
            ..Default::default()
        };

        let mut node_ids = Vec::new();
        let mut edge_ids = Vec::new();
        let mut language_nodes: HashMap<String, String> = HashMap::new();

        for lang in &report.languages {
            let node = graph.add_node(
                NodeType::Language,
                &lang.name,
                draft_base(Some(lang.confidence), Some(0.6)),
            );
            language_nodes.insert(lang.name.clone(), node.id.clone());
            node_ids.push(node.id);
        }

        let mut last_code_block: Option<String> = None;
        for block in &report.code_blocks {
            let mut draft = draft_base(None, Some(0.6));
            draft.extra.insert("language".into(), json!(block.language));
            draft
                .extra
                .insert("fullLength".into(), json!(block.full_length));
            let node = graph.add_node(NodeType::CodeBlock, &block.content, draft);
            if let Some(lang_id) = language_nodes.get(&block.language) {
                if let Some(edge) =
                    graph.add_edge(&node.id, lang_id, EdgeType::Uses, EdgeDraft::default())
                {
                    edge_ids.push(edge.id);
                }
            }
            last_code_block = Some(node.id.clone());
            node_ids.push(node.id);
        }

        for framework in &report.frameworks {
            let node = graph.add_node(
                NodeType::Framework,
                &framework.name,
                draft_base(Some(framework.confidence), Some(0.6)),
            );
            if let Some(lang_id) = language_nodes.get(&framework.language) {
                if let Some(edge) =
                    graph.add_edge(&node.id, lang_id, EdgeType::PartOf, EdgeDraft::default())
                {
                    edge_ids.push(edge.id);
                }
            }
            node_ids.push(node.id);
        }

        for error in &report.errors {
            let mut draft = draft_base(None, Some(error.importance));
            draft
                .extra
                .insert("errorType".into(), json!(error.error_type));
            draft.extra.insert("context".into(), json!(error.context));
            let node = graph.add_node(NodeType::Error, &error.message, draft);
            if let Some(block_id) = &last_code_block {
                if let Some(edge) =
                    graph.add_edge(&node.id, block_id, EdgeType::RelatedTo, EdgeDraft::default())
                {
                    edge_ids.push(edge.id);
                }
            }
            node_ids.push(node.id);
        }

        let mut topic_nodes: Vec<String> = Vec::new();
        for topic in &report.topics {
            let node = graph.add_node(
                NodeType::Topic,
                &topic.name,
                draft_base(Some(topic.confidence), None),
            );
            topic_nodes.push(node.id.clone());
            node_ids.push(node.id);
        }

        for file in &report.files {
            let node = graph.add_node(NodeType::File, file, draft_base(None, None));
            let ext = file.rfind('.').map(|idx| &file[idx..]);
            if let Some(lang_name) = ext.and_then(|e| self.library.language_for_extension(e)) {
                if let Some(lang_id) = language_nodes.get(lang_name) {
                    if let Some(edge) =
                        graph.add_edge(&node.id, lang_id, EdgeType::Uses, EdgeDraft::default())
                    {
                        edge_ids.push(edge.id);
                    }
                }
            }
            node_ids.push(node.id);
        }
        for function in &report.functions {
            node_ids.push(
                graph
                    .add_node(NodeType::Function, function, draft_base(None, None))
                    .id,
            );
        }
        for class in &report.classes {
            node_ids.push(
                graph
                    .add_node(NodeType::Class, class, draft_base(None, None))
                    .id,
            );
        }
        for url in &report.urls {
            node_ids.push(
                graph
                    .add_node(NodeType::Url, url, draft_base(None, None))
                    .id,
            );
        }

        let mut goal_nodes: Vec<String> = Vec::new();
        for goal in &report.goals {
            let node = graph.add_node(NodeType::Goal, goal, draft_base(None, Some(0.7)));
            goal_nodes.push(node.id.clone());
            node_ids.push(node.id);
        }

        // goal <-> topic (bidirectional), topic -> primary language
        for goal_id in &goal_nodes {
            for topic_id in &topic_nodes {
                if let Some(edge) = graph.add_edge(
                    goal_id,
                    topic_id,
                    EdgeType::RelatedTo,
                    EdgeDraft {
                        bidirectional: true,
                        ..Default::default()
                    },
                ) {
                    edge_ids.push(edge.id);
                }
            }
        }
        if let Some(primary_lang_id) = report
            .languages
            .first()
            .and_then(|l| language_nodes.get(&l.name))
        {
            for topic_id in &topic_nodes {
                if let Some(edge) = graph.add_edge(
                    topic_id,
                    primary_lang_id,
                    EdgeType::RelatedTo,
                    EdgeDraft::default(),
                ) {
                    edge_ids.push(edge.id);
                }
            }
        }

        report.node_ids = node_ids;
        report.edge_ids = edge_ids;
    }

    fn apply_session_effects(&self, graph: &mut MemoryGraph, report: &ExtractionReport) {
        let primary_language = report.languages.first().map(|l| l.name.clone());
        let primary_framework = report.frameworks.first().map(|f| f.name.clone());
        let primary_topic = report.topics.first().map(|t| t.name.clone());

        if let Some(session) = graph.active_session_mut() {
            session.code_block_count += report.code_blocks.len() as u32;
            session.error_count += report.errors.len() as u32;
            if primary_language.is_some() {
                session.primary_language = primary_language;
            }
            if primary_framework.is_some() {
                session.primary_framework = primary_framework;
            }
            if primary_topic.is_some() {
                session.primary_topic = primary_topic;
            }
        }
    }
}

fn detect_goals(text: &str) -> Vec<String> {
    let mut goals = Vec::new();
    for template in GOAL_TEMPLATES.iter() {
        for caps in template.captures_iter(text) {
            let Some(tail) = caps.get(1) else { continue };
            let tail_len = tail.as_str().trim().len();
            if !(5..=100).contains(&tail_len) {
                continue;
            }
            let goal = caps.get(0).map(|m| m.as_str().trim().to_string());
            if let Some(goal) = goal {
                if !goals.contains(&goal) {
                    goals.push(goal);
                }
            }
        }
    }
    goals.truncate(3);
    goals
}

fn contains_word(haystack_lower: &str, needle_lower: &str) -> bool {
    haystack_lower.match_indices(needle_lower).any(|(idx, _)| {
        let before_ok = idx == 0
            || !haystack_lower[..idx]
                .chars()
                .next_back()
                .is_some_and(|c| c.is_alphanumeric());
        let after = idx + needle_lower.len();
        let after_ok = after >= haystack_lower.len()
            || !haystack_lower[after..]
                .chars()
                .next()
                .is_some_and(|c| c.is_alphanumeric());
        before_ok && after_ok
    })
}

fn dedupe_capped<I: Iterator<Item = String>>(items: I, cap: usize) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for item in items {
        if !out.contains(&item) {
            out.push(item);
            if out.len() >= cap {
                break;
            }
        }
    }
    out
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let cut = floor_char_boundary(text, max);
    text[..cut].to_string()
}

fn floor_char_boundary(text: &str, mut idx: usize) -> usize {
    if idx >= text.len() {
        return text.len();
    }
    while idx > 0 && !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{QueryCriteria, SessionDraft};

    fn extract(text: &str) -> (MemoryGraph, ExtractionReport) {
        let mut graph = MemoryGraph::new();
        let extractor = Extractor::new();
        let report = extractor.extract(&mut graph, text, &ExtractionContext::default());
        (graph, report)
    }

    // ===== Guard rails =====

    #[test]
    fn test_short_input_yields_empty_report() {
        let (graph, report) = extract("too short");
        assert!(report.node_ids.is_empty());
        assert_eq!(graph.node_count(), 0);
    }

    // ===== E1: languages, frameworks, topics, errors, goals =====

    #[test]
    fn test_python_django_scenario() {
        let (graph, report) = extract(
            "I'm using Python with Django to build a REST API. Got a TypeError.",
        );

        let python = report
            .languages
            .iter()
            .find(|l| l.name == "python")
            .expect("python detected");
        assert!(python.confidence >= 0.3);

        let django = report
            .frameworks
            .iter()
            .find(|f| f.name == "django")
            .expect("django detected");
        assert!(django.confidence >= 0.4);
        assert_eq!(django.language, "python");

        assert!(report.topics.iter().any(|t| t.name == "web development"));
        assert!(report
            .errors
            .iter()
            .any(|e| e.message.starts_with("TypeError")));
        assert!(report.goals.iter().any(|g| g.contains("build a REST API")));

        // Materialized: framework --part_of--> language edge exists.
        let lang_nodes = graph.query(&QueryCriteria::of_type(NodeType::Language));
        let fw_nodes = graph.query(&QueryCriteria::of_type(NodeType::Framework));
        assert_eq!(lang_nodes[0].content, "python");
        assert_eq!(fw_nodes[0].content, "django");
        assert!(graph
            .find_edge(&fw_nodes[0].id, &lang_nodes[0].id, EdgeType::PartOf)
            .is_some());

        let goal_nodes = graph.query(&QueryCriteria::of_type(NodeType::Goal));
        assert_eq!(goal_nodes.len(), 1);
        let error_nodes = graph.query(&QueryCriteria::of_type(NodeType::Error));
        assert_eq!(error_nodes.len(), 1);
    }

    // ===== Code blocks =====

    #[test]
    fn test_code_block_with_declared_language() {
        let text = "Here is the handler:\n```python\ndef handle(request):\n    return render(request)\n```\nthanks";
        let (graph, report) = extract(text);
        assert_eq!(report.code_blocks.len(), 1);
        assert_eq!(report.code_blocks[0].language, "python");

        let blocks = graph.query(&QueryCriteria::of_type(NodeType::CodeBlock));
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].metadata.extra["language"], json!("python"));
    }

    #[test]
    fn test_code_block_language_rescored_when_blank() {
        let text = "Look at this snippet please:\n```\nconst total = items.map(x => x.price);\nconsole.log(total);\n```";
        let (_, report) = extract(text);
        assert_eq!(report.code_blocks.len(), 1);
        assert_eq!(report.code_blocks[0].language, "javascript");
    }

    #[test]
    fn test_tiny_code_block_skipped() {
        let text = "a fence that is too small to matter ```py\nx=1\n``` end";
        let (_, report) = extract(text);
        assert!(report.code_blocks.is_empty());
    }

    #[test]
    fn test_long_code_block_truncated_with_full_length_kept() {
        let body = "x = 1\n".repeat(200);
        let text = format!("big one:\n```python\n{}```", body);
        let (_, report) = extract(&text);
        assert_eq!(report.code_blocks.len(), 1);
        assert!(report.code_blocks[0].content.len() <= CODE_BLOCK_TRUNCATE);
        assert!(report.code_blocks[0].full_length > CODE_BLOCK_TRUNCATE);
    }

    #[test]
    fn test_error_links_to_most_recent_code_block() {
        let text = "```python\ndef broken():\n    return undefined_name\n```\nTypeError: cannot call undefined_name";
        let (graph, _) = extract(text);
        let errors = graph.query(&QueryCriteria::of_type(NodeType::Error));
        let blocks = graph.query(&QueryCriteria::of_type(NodeType::CodeBlock));
        assert!(graph
            .find_edge(&errors[0].id, &blocks[0].id, EdgeType::RelatedTo)
            .is_some());
    }

    // ===== Entities =====

    #[test]
    fn test_entity_extraction_and_dedup() {
        let text = "Open main.py and main.py again, then utils.rs. Call function parse_args() \
                    via def parse_args(argv): and check MyHandler plus JavaScript is ignored. \
                    See https://example.com/docs for details.";
        let (graph, report) = extract(text);

        assert_eq!(report.files, vec!["main.py".to_string(), "utils.rs".to_string()]);
        assert_eq!(report.functions, vec!["parse_args".to_string()]);
        assert!(report.classes.contains(&"MyHandler".to_string()));
        assert!(!report.classes.iter().any(|c| c == "JavaScript"));
        assert_eq!(report.urls, vec!["https://example.com/docs".to_string()]);

        assert_eq!(graph.query(&QueryCriteria::of_type(NodeType::File)).len(), 2);
        assert_eq!(graph.query(&QueryCriteria::of_type(NodeType::Url)).len(), 1);
    }

    #[test]
    fn test_file_linked_to_language_by_extension() {
        let text = "In Python, edit scripts/report.py to import csv and fix the def export() path.";
        let (graph, _) = extract(text);
        let files = graph.query(&QueryCriteria::of_type(NodeType::File));
        let langs = graph.query(&QueryCriteria::of_type(NodeType::Language));
        assert_eq!(files.len(), 1);
        assert!(graph
            .find_edge(&files[0].id, &langs[0].id, EdgeType::Uses)
            .is_some());
    }

    // ===== Goals and topics =====

    #[test]
    fn test_goal_topic_bidirectional_relationship() {
        let text = "I want to deploy the api server with docker and a ci pipeline for the backend.";
        let (graph, report) = extract(text);
        assert!(!report.goals.is_empty());
        assert!(!report.topics.is_empty());

        let goals = graph.query(&QueryCriteria::of_type(NodeType::Goal));
        let topics = graph.query(&QueryCriteria::of_type(NodeType::Topic));
        let edge_id = graph
            .find_edge(&goals[0].id, &topics[0].id, EdgeType::RelatedTo)
            .expect("goal-topic edge");
        assert!(graph.get_edge(&edge_id).unwrap().bidirectional);
    }

    #[test]
    fn test_topics_require_two_keyword_hits() {
        let (_, report) = extract("just one mention of docker in this sentence here");
        assert!(report.topics.iter().all(|t| t.name != "devops"));
    }

    // ===== Session side-effects =====

    #[test]
    fn test_session_counters_and_primaries_updated() {
        let mut graph = MemoryGraph::new();
        graph.start_session(SessionDraft {
            platform: "chatgpt".into(),
            ..Default::default()
        });
        let extractor = Extractor::new();
        extractor.extract(
            &mut graph,
            "Using Python with Django for the backend api server.\n```python\ndef view(request):\n    pass\n```\nTypeError: bad call",
            &ExtractionContext::default(),
        );

        let session = graph.active_session().unwrap();
        assert_eq!(session.code_block_count, 1);
        assert_eq!(session.error_count, 1);
        assert_eq!(session.primary_language.as_deref(), Some("python"));
        assert_eq!(session.primary_framework.as_deref(), Some("django"));
    }

    // ===== Injectable tables =====

    #[test]
    fn test_synthetic_library_injection() {
        let library = PatternLibrary::new(
            vec![LanguagePattern {
                name: "klingon".into(),
                keywords: strs_vec(&["qapla"]),
                patterns: vec![Regex::new(r"\bbatleth\b").unwrap()],
                markers: strs_vec(&["klingon", ".klg"]),
                frameworks: vec![FrameworkPattern::new("birdofprey", &["cloak", "decloak"])],
            }],
            vec![ErrorSignature::new("HonorError", r"HonorError[^\n]*", 0.9)],
            vec![TopicPattern::new("space combat", &["cloak", "torpedo", "shields"])],
        );
        let extractor = Extractor::with_library(library);
        let mut graph = MemoryGraph::new();
        let report = extractor.extract(
            &mut graph,
            "qapla! the klingon batleth code uses cloak and decloak, torpedo shields. HonorError: dishonor",
            &ExtractionContext::default(),
        );

        assert_eq!(report.languages[0].name, "klingon");
        assert_eq!(report.frameworks[0].name, "birdofprey");
        assert_eq!(report.topics[0].name, "space combat");
        assert_eq!(report.errors[0].error_type, "HonorError");
    }

    fn strs_vec(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }
}
