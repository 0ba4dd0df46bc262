//! Relevance-filtered context rendering under a platform token budget.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::graph::{MemoryGraph, Node, NodeType, QueryCriteria, SortBy};
use crate::utils::TextUtils;

/// Rendering strategies. `Custom` carries a template with
/// `{{variable}}` placeholders.
#[derive(Debug, Clone, PartialEq)]
pub enum ContextStrategy {
    Minimal,
    Structured,
    Narrative,
    System,
    Custom(String),
}

impl ContextStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            ContextStrategy::Minimal => "minimal",
            ContextStrategy::Structured => "structured",
            ContextStrategy::Narrative => "narrative",
            ContextStrategy::System => "system",
            ContextStrategy::Custom(_) => "custom",
        }
    }
}

/// Approximate token budget per chat platform (tokens ~= chars / 4).
pub fn platform_token_budget(platform: &str) -> usize {
    match platform {
        "chatgpt" => 1500,
        "claude" => 2000,
        "perplexity" => 1000,
        "gemini" => 1500,
        "poe" => 1000,
        "copilot" => 800,
        "bing" => 600,
        "you" => 800,
        "huggingface" => 500,
        "grok" => 1000,
        _ => 1000,
    }
}

/// The rendered context plus bookkeeping returned to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextPayload {
    pub text: String,
    pub tokens: usize,
    pub strategy: String,
    pub platform: String,
    pub node_count: usize,
    pub generated_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

/// Relevance-ranked slices of the graph feeding every strategy.
#[derive(Debug, Default)]
struct ContextBuckets {
    languages: Vec<Node>,
    frameworks: Vec<Node>,
    errors: Vec<Node>,
    goals: Vec<Node>,
    topics: Vec<Node>,
    files: Vec<Node>,
    code: Vec<Node>,
}

impl ContextBuckets {
    fn node_count(&self) -> usize {
        self.languages.len()
            + self.frameworks.len()
            + self.errors.len()
            + self.goals.len()
            + self.topics.len()
            + self.files.len()
            + self.code.len()
    }
}

pub struct ContextGenerator;

impl ContextGenerator {
    pub fn generate(
        graph: &MemoryGraph,
        platform: &str,
        strategy: &ContextStrategy,
    ) -> ContextPayload {
        Self::generate_at(graph, platform, strategy, Utc::now())
    }

    pub fn generate_at(
        graph: &MemoryGraph,
        platform: &str,
        strategy: &ContextStrategy,
        now: DateTime<Utc>,
    ) -> ContextPayload {
        let buckets = Self::gather(graph, now);
        let max_tokens = platform_token_budget(platform);
        let max_chars = max_tokens * 4;

        let (text, metadata) = match strategy {
            ContextStrategy::Minimal => (String::new(), Self::minimal_metadata(&buckets, now)),
            ContextStrategy::Structured => (Self::render_structured(&buckets), json!({})),
            ContextStrategy::Narrative => (Self::render_narrative(&buckets, now), json!({})),
            ContextStrategy::System => (Self::render_system(&buckets), json!({})),
            ContextStrategy::Custom(template) => {
                (Self::render_custom(template, &buckets), json!({}))
            }
        };

        let text = TextUtils::truncate_at_word(&text, max_chars).into_owned();
        let tokens = text.len() / 4;
        debug!(
            platform,
            strategy = strategy.name(),
            tokens,
            nodes = buckets.node_count(),
            "context generated"
        );

        ContextPayload {
            tokens,
            text,
            strategy: strategy.name().to_string(),
            platform: platform.to_string(),
            node_count: buckets.node_count(),
            generated_at: now,
            metadata,
        }
    }

    fn gather(graph: &MemoryGraph, now: DateTime<Utc>) -> ContextBuckets {
        let pick = |node_type: NodeType, limit: usize| -> Vec<Node> {
            graph.query_at(
                &QueryCriteria {
                    types: vec![node_type],
                    within_hours: Some(24.0),
                    sort: SortBy::Relevance,
                    limit: Some(limit),
                    ..Default::default()
                },
                now,
            )
        };
        ContextBuckets {
            languages: pick(NodeType::Language, 3),
            frameworks: pick(NodeType::Framework, 3),
            errors: pick(NodeType::Error, 2),
            goals: pick(NodeType::Goal, 2),
            topics: pick(NodeType::Topic, 3),
            files: pick(NodeType::File, 5),
            code: pick(NodeType::CodeBlock, 1),
        }
    }

    fn age_hours(node: &Node, now: DateTime<Utc>) -> f64 {
        now.signed_duration_since(node.metadata.created_at)
            .num_milliseconds()
            .max(0) as f64
            / 3_600_000.0
    }

    fn minimal_metadata(buckets: &ContextBuckets, now: DateTime<Utc>) -> serde_json::Value {
        let error = buckets
            .errors
            .first()
            .filter(|e| Self::age_hours(e, now) <= 2.0)
            .map(|e| e.content.clone());
        json!({
            "language": buckets.languages.first().map(|n| n.content.clone()),
            "framework": buckets.frameworks.first().map(|n| n.content.clone()),
            "error": error,
            "goal": buckets.goals.first().map(|n| n.content.clone()),
        })
    }

    fn render_structured(buckets: &ContextBuckets) -> String {
        let contents = |nodes: &[Node]| -> Vec<String> {
            nodes.iter().map(|n| n.content.clone()).collect()
        };
        let errors: Vec<String> = buckets
            .errors
            .iter()
            .map(|n| TextUtils::truncate_at_word(&n.content, 100).into_owned())
            .collect();
        let block = json!({
            "languages": contents(&buckets.languages),
            "frameworks": contents(&buckets.frameworks),
            "recent_errors": errors,
            "goals": contents(&buckets.goals),
            "topics": contents(&buckets.topics),
            "files": contents(&buckets.files),
        });
        serde_json::to_string_pretty(&block).unwrap_or_default()
    }

    fn render_narrative(buckets: &ContextBuckets, now: DateTime<Utc>) -> String {
        let mut clauses: Vec<String> = Vec::new();

        if !buckets.languages.is_empty() {
            let mut stack: Vec<&str> = buckets
                .languages
                .iter()
                .map(|n| n.content.as_str())
                .collect();
            stack.extend(buckets.frameworks.iter().map(|n| n.content.as_str()));
            clauses.push(format!("Working with {}", stack.join(", ")));
        }
        if let Some(topic) = buckets.topics.first() {
            clauses.push(format!("focused on {}", topic.content));
        }
        if let Some(goal) = buckets.goals.first() {
            clauses.push(format!("currently trying to {}", goal.content));
        }
        if let Some(error) = buckets
            .errors
            .first()
            .filter(|e| Self::age_hours(e, now) <= 4.0)
        {
            clauses.push(format!(
                "recently hit: {}",
                TextUtils::truncate_at_word(&error.content, 120)
            ));
        }
        if !buckets.files.is_empty() {
            let names: Vec<&str> = buckets.files.iter().map(|n| n.content.as_str()).collect();
            clauses.push(format!("touching files {}", names.join(", ")));
        }

        if clauses.is_empty() {
            String::new()
        } else {
            let mut paragraph = clauses.join("; ");
            paragraph.push('.');
            paragraph
        }
    }

    fn render_system(buckets: &ContextBuckets) -> String {
        let mut lines: Vec<String> = vec!["<work_context>".to_string()];
        if let Some(lang) = buckets.languages.first() {
            lines.push(format!("primary_language: {}", lang.content));
        }
        if !buckets.frameworks.is_empty() {
            let stack: Vec<&str> = buckets
                .frameworks
                .iter()
                .map(|n| n.content.as_str())
                .collect();
            lines.push(format!("tech_stack: {}", stack.join(", ")));
        }
        if let Some(goal) = buckets.goals.first() {
            lines.push(format!("current_task: {}", goal.content));
        }
        if !buckets.files.is_empty() {
            let names: Vec<&str> = buckets.files.iter().map(|n| n.content.as_str()).collect();
            lines.push(format!("working_files: {}", names.join(", ")));
        }
        if let Some(code) = buckets.code.first() {
            lines.push(format!(
                "recent_code: {}",
                TextUtils::truncate_at_word(&code.content, 160)
            ));
        }
        if let Some(error) = buckets.errors.first() {
            lines.push(format!(
                "current_issue: {}",
                TextUtils::truncate_at_word(&error.content, 160)
            ));
        }
        lines.push("</work_context>".to_string());
        lines.join("\n")
    }

    fn render_custom(template: &str, buckets: &ContextBuckets) -> String {
        let joined = |nodes: &[Node]| -> String {
            nodes
                .iter()
                .map(|n| n.content.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        };
        let first = |nodes: &[Node]| -> String {
            nodes
                .first()
                .map(|n| n.content.clone())
                .unwrap_or_default()
        };

        let mut out = template.to_string();
        // Plural placeholders first: `{{languages}}` contains `{{language`.
        let substitutions = [
            ("{{languages}}", joined(&buckets.languages)),
            ("{{language}}", first(&buckets.languages)),
            ("{{frameworks}}", joined(&buckets.frameworks)),
            ("{{framework}}", first(&buckets.frameworks)),
            ("{{error}}", first(&buckets.errors)),
            ("{{goals}}", joined(&buckets.goals)),
            ("{{goal}}", first(&buckets.goals)),
            ("{{topics}}", joined(&buckets.topics)),
            ("{{topic}}", first(&buckets.topics)),
            ("{{files}}", joined(&buckets.files)),
            ("{{code}}", first(&buckets.code)),
        ];
        for (placeholder, value) in substitutions {
            out = out.replace(placeholder, &value);
        }
        out
    }
}
