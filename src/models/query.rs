use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::error::Rejection;

/// Table/column reference extracted from a candidate's SQL
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ColumnRef {
    /// Resolved table name when the column could be attributed to one
    pub table: Option<String>,
    pub column: String,
}

impl std::fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.table {
            Some(table) => write!(f, "{}.{}", table, self.column),
            None => write!(f, "{}", self.column),
        }
    }
}

/// Identifiers a query touches
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReferencedIdentifiers {
    pub tables: BTreeSet<String>,
    pub columns: BTreeSet<ColumnRef>,
}

/// One synthesized query proposal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateQuery {
    pub sql: String,
    pub referenced: ReferencedIdentifiers,
    pub confidence: f64,
    pub explanation: String,
    pub reasoning: Option<String>,
    /// Synthesis attempt (1-based) that produced this candidate
    pub attempt: u32,
}

impl CandidateQuery {
    pub fn new(sql: impl Into<String>, confidence: f64, explanation: impl Into<String>, attempt: u32) -> Self {
        Self {
            sql: sql.into(),
            referenced: ReferencedIdentifiers::default(),
            confidence: confidence.clamp(0.0, 1.0),
            explanation: explanation.into(),
            reasoning: None,
            attempt,
        }
    }
}

/// Query text that passed validation.
///
/// Only the validator can build one; the execution connector only accepts this type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedQuery {
    sql: String,
    referenced: ReferencedIdentifiers,
}

impl ValidatedQuery {
    pub(crate) fn new(sql: String, referenced: ReferencedIdentifiers) -> Self {
        Self { sql, referenced }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn referenced(&self) -> &ReferencedIdentifiers {
        &self.referenced
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValidationVerdict {
    Accept(ValidatedQuery),
    Reject(Rejection),
    NeedsRewrite(Rejection),
}

impl ValidationVerdict {
    pub fn is_accept(&self) -> bool {
        matches!(self, ValidationVerdict::Accept(_))
    }
}

/// Why a previous attempt failed; fed into the next synthesis call
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryFeedback {
    pub attempt: u32,
    pub sql: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnMeta {
    pub name: String,
    pub type_name: String,
}

/// Rows returned by one execution. Owned by the turn and never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionResult {
    pub columns: Vec<ColumnMeta>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub row_count: usize,
    pub execution_time_ms: u64,
    pub truncated: bool,
}

impl ExecutionResult {
    pub fn new(columns: Vec<ColumnMeta>, rows: Vec<Vec<serde_json::Value>>, execution_time_ms: u64, truncated: bool) -> Self {
        let row_count = rows.len();
        Self {
            columns,
            rows,
            row_count,
            execution_time_ms,
            truncated,
        }
    }

    /// Drop rows past `row_cap`, setting `truncated` when anything was dropped
    pub fn enforce_row_cap(mut self, row_cap: usize) -> Self {
        if self.rows.len() > row_cap {
            self.rows.truncate(row_cap);
            self.truncated = true;
        }
        self.row_count = self.rows.len();
        self
    }

    /// Index of a column by case-insensitive name
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|column| column.name.eq_ignore_ascii_case(name))
    }

    /// Short description kept in conversation history
    pub fn summary(&self) -> String {
        let names: Vec<&str> = self.columns.iter().map(|c| c.name.as_str()).collect();
        let mut summary = format!("{} rows ({})", self.row_count, names.join(", "));
        if self.truncated {
            summary.push_str(", truncated");
        }
        summary
    }
}
