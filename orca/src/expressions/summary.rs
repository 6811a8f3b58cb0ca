//! Record of expression outcomes for one stage.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One failed expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpressionFailure {
    /// Severity, always "ERROR" for evaluation failures.
    pub level: String,
    /// What went wrong.
    pub description: String,
}

/// Counts evaluated expressions and collects failures keyed by expression.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpressionEvaluationSummary {
    /// Number of expressions evaluated, failed ones included.
    pub total_evaluated: usize,
    /// Failures keyed by the expression text.
    pub failures: BTreeMap<String, Vec<ExpressionFailure>>,
}

impl ExpressionEvaluationSummary {
    /// Creates an empty summary.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one evaluation.
    pub fn record_evaluated(&mut self) {
        self.total_evaluated += 1;
    }

    /// Records a failure for an expression.
    pub fn add_failure(&mut self, expression: impl Into<String>, description: impl Into<String>) {
        let failure = ExpressionFailure {
            level: "ERROR".to_string(),
            description: description.into(),
        };
        let entries = self.failures.entry(expression.into()).or_default();
        if !entries.contains(&failure) {
            entries.push(failure);
        }
    }

    /// Returns true if any expression failed.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }

    /// Number of distinct failing expressions.
    #[must_use]
    pub fn failure_count(&self) -> usize {
        self.failures.len()
    }
}
