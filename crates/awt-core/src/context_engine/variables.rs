//! Template variable auto-fill from the memory graph.
//!
//! Variable names are grouped into equivalence classes (language/lang/…,
//! framework/library/…) and resolved against a 24 h relevance query.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::graph::{MemoryGraph, NodeType, QueryCriteria, SortBy};

/// One auto-detected variable value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableBinding {
    pub value: String,
    pub confidence: f64,
    pub source: String,
    pub auto_detected: bool,
}

fn class_for(name: &str) -> Option<NodeType> {
    match name.to_lowercase().as_str() {
        "language" | "lang" | "programming_language" | "proglang" => Some(NodeType::Language),
        "framework" | "library" | "stack" | "tech" => Some(NodeType::Framework),
        "error" | "exception" | "bug" | "issue" => Some(NodeType::Error),
        "code" | "snippet" | "source" => Some(NodeType::CodeBlock),
        "goal" | "task" | "objective" => Some(NodeType::Goal),
        "topic" | "context" | "domain" => Some(NodeType::Topic),
        "file" | "filename" | "path" => Some(NodeType::File),
        "function" | "method" | "func" => Some(NodeType::Function),
        "class" | "component" => Some(NodeType::Class),
        _ => None,
    }
}

/// Resolve `names` to values from nodes created in the last 24 hours,
/// highest relevance first. Unknown names are simply absent from the map.
pub fn map_to_variables(
    graph: &MemoryGraph,
    names: &[String],
) -> HashMap<String, VariableBinding> {
    map_to_variables_at(graph, names, Utc::now())
}

pub fn map_to_variables_at(
    graph: &MemoryGraph,
    names: &[String],
    now: DateTime<Utc>,
) -> HashMap<String, VariableBinding> {
    let mut bindings = HashMap::new();
    for name in names {
        let Some(node_type) = class_for(name) else {
            continue;
        };
        let top = graph
            .query_at(
                &QueryCriteria {
                    types: vec![node_type],
                    within_hours: Some(24.0),
                    sort: SortBy::Relevance,
                    limit: Some(1),
                    ..Default::default()
                },
                now,
            )
            .into_iter()
            .next();
        if let Some(node) = top {
            bindings.insert(
                name.clone(),
                VariableBinding {
                    value: node.content,
                    confidence: node.confidence,
                    source: "memory_graph".to_string(),
                    auto_detected: true,
                },
            );
        }
    }
    bindings
}
