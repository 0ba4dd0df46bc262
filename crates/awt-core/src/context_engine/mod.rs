//! Builds compact textual context from the memory graph for prompt
//! injection and template variable auto-fill.

pub mod generator;
pub mod variables;

pub use generator::{platform_token_budget, ContextGenerator, ContextPayload, ContextStrategy};
pub use variables::{map_to_variables, VariableBinding};
