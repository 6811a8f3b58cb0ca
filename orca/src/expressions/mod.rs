//! Expression evaluation over stage contexts.
//!
//! Stage definitions may embed `${...}` expressions in their context. Before
//! a stage runs, the planner evaluates them through a
//! [`ContextParameterProcessor`] backed by a pluggable [`ExpressionEvaluator`].
//! Failures never abort planning: they are collected in an
//! [`ExpressionEvaluationSummary`] and the original text is kept.

mod placeholder;
mod processor;
mod summary;

pub use placeholder::PlaceholderEvaluator;
pub use processor::{process_default_entries, ContextParameterProcessor};
pub use summary::{ExpressionEvaluationSummary, ExpressionFailure};

use crate::core::ContextMap;
use crate::errors::ExpressionError;
use serde_json::Value;

/// A pluggable expression language.
pub trait ExpressionEvaluator: Send + Sync {
    /// Returns true if the text contains at least one expression.
    fn contains_expression(&self, text: &str) -> bool;

    /// Evaluates the expressions in `text` against `context`.
    fn evaluate(&self, text: &str, context: &ContextMap) -> Result<Value, ExpressionError>;
}
