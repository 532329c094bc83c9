use crate::config::PipelineConfig;
use crate::models::{CandidateQuery, ConversationContext, PipelineError, RetryFeedback, SchemaCatalog};
use crate::services::llm_service::{clean_sql, extract_json, CompletionRequest, LlmService};
use crate::validation::SqlValidator;
use serde::Deserialize;
use std::collections::HashSet;

/// Confidence given to candidates the model did not score
const DEFAULT_CANDIDATE_CONFIDENCE: f64 = 0.5;

const SYNTHESIS_SYSTEM_PROMPT: &str = r#"You are a PostgreSQL expert. Convert the user's question into a single read-only SQL query.

Rules:
1. Generate only one SELECT statement (WITH ... SELECT is fine)
2. Use only the tables and columns listed in the schema; never invent names
3. Qualify columns with table aliases when more than one table is involved
4. Join tables through the listed relationships
5. Do not add comments or a trailing semicolon
6. Prefer explicit column lists over SELECT *

Respond with JSON only:
{"candidates": [{"reasoning": "...", "sql": "SELECT ...", "explanation": "what the query returns, in plain words", "confidence": 0.0}]}
Order candidates from most to least likely."#;

#[derive(Debug, Deserialize)]
struct RawSynthesis {
    #[serde(default)]
    candidates: Vec<RawCandidate>,
}

#[derive(Debug, Deserialize)]
struct RawCandidate {
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(alias = "sql_query", alias = "query")]
    sql: String,
    #[serde(default)]
    explanation: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
}

/// One synthesis call within a turn
#[derive(Debug, Clone, Copy)]
pub struct SynthesisAttempt<'a> {
    /// 1-based
    pub attempt: u32,
    /// Reasons earlier candidates of this turn were refused
    pub feedback: &'a [RetryFeedback],
    /// Require a row limit, appending one when the model leaves it out
    pub force_row_cap: bool,
}

impl SynthesisAttempt<'_> {
    pub fn first() -> SynthesisAttempt<'static> {
        SynthesisAttempt {
            attempt: 1,
            feedback: &[],
            force_row_cap: false,
        }
    }
}

/// Turns a question into ranked candidate queries grounded in the catalog
#[derive(Clone)]
pub struct QuerySynthesizer {
    llm: LlmService,
    max_attempts: u32,
    max_candidates: usize,
    min_confidence: f64,
    row_cap: usize,
    history_window: usize,
}

impl QuerySynthesizer {
    pub fn new(llm: LlmService, config: &PipelineConfig) -> Self {
        Self {
            llm,
            max_attempts: config.max_attempts.max(1),
            max_candidates: config.max_candidates.max(1),
            min_confidence: config.min_candidate_confidence,
            row_cap: config.row_cap,
            history_window: config.history_window,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Candidates at or above the minimum confidence, best first.
    ///
    /// An empty list means this attempt produced nothing usable; on the
    /// last attempt that becomes `SynthesisExhausted` instead.
    pub async fn synthesize(
        &self,
        question: &str,
        schema: &SchemaCatalog,
        context: &ConversationContext,
        attempt: SynthesisAttempt<'_>,
    ) -> Result<Vec<CandidateQuery>, PipelineError> {
        let prompt = self.build_prompt(question, schema, context, &attempt);
        tracing::debug!("Synthesis prompt (attempt {}):\n{}", attempt.attempt, prompt);

        let response = self
            .llm
            .complete(CompletionRequest::new(SYNTHESIS_SYSTEM_PROMPT, prompt))
            .await?;

        let mut candidates = self.parse_candidates(&response.text, schema, attempt.attempt);
        if attempt.force_row_cap {
            candidates = candidates
                .into_iter()
                .map(|candidate| self.with_row_cap(candidate))
                .collect();
        }

        tracing::info!(
            "Synthesis attempt {} produced {} candidate(s)",
            attempt.attempt,
            candidates.len()
        );

        if candidates.is_empty() && attempt.attempt >= self.max_attempts {
            return Err(PipelineError::SynthesisExhausted {
                attempts: attempt.attempt,
                last_reason: attempt.feedback.last().map(|f| f.reason.clone()),
            });
        }

        Ok(candidates)
    }

    fn build_prompt(
        &self,
        question: &str,
        schema: &SchemaCatalog,
        context: &ConversationContext,
        attempt: &SynthesisAttempt<'_>,
    ) -> String {
        let mut prompt = schema.prompt_context();

        let history = context.render_history(self.history_window);
        if !history.is_empty() {
            prompt.push_str("\nConversation so far:\n");
            prompt.push_str(&history);
        }

        if !attempt.feedback.is_empty() {
            prompt.push_str("\nEarlier attempts for this question were rejected:\n");
            for feedback in attempt.feedback {
                match &feedback.sql {
                    Some(sql) => prompt.push_str(&format!(
                        "- attempt {}: {}\n  rejected because: {}\n",
                        feedback.attempt, sql, feedback.reason
                    )),
                    None => prompt.push_str(&format!("- attempt {}: {}\n", feedback.attempt, feedback.reason)),
                }
            }
            prompt.push_str("Fix these problems in the new query.\n");
        }

        if attempt.force_row_cap {
            prompt.push_str(&format!("\nThe query must end with LIMIT {}.\n", self.row_cap));
        }

        prompt.push_str(&format!(
            "\nReturn at most {} candidates.\nQuestion: {}",
            self.max_candidates, question
        ));
        prompt
    }

    /// Read candidates from model output. Bare SQL is accepted as a single
    /// candidate; anything else yields none.
    fn parse_candidates(&self, text: &str, schema: &SchemaCatalog, attempt: u32) -> Vec<CandidateQuery> {
        let raw: Vec<RawCandidate> = match extract_json(text) {
            Some(json) => match serde_json::from_str::<RawSynthesis>(json) {
                Ok(parsed) if !parsed.candidates.is_empty() => parsed.candidates,
                _ => serde_json::from_str::<RawCandidate>(json)
                    .map(|single| vec![single])
                    .unwrap_or_default(),
            },
            None => Vec::new(),
        };

        let raw = if raw.is_empty() {
            let sql = clean_sql(text);
            let lowered = sql.to_lowercase();
            if lowered.starts_with("select") || lowered.starts_with("with") {
                vec![RawCandidate {
                    reasoning: None,
                    sql,
                    explanation: None,
                    confidence: None,
                }]
            } else {
                tracing::warn!("Synthesis output contains no candidates: {}", text);
                Vec::new()
            }
        } else {
            raw
        };

        let mut seen = HashSet::new();
        let mut candidates: Vec<CandidateQuery> = raw
            .into_iter()
            .filter_map(|raw| {
                let sql = clean_sql(&raw.sql).trim_end_matches(';').trim().to_string();
                if sql.is_empty() || !seen.insert(normalize_sql(&sql)) {
                    return None;
                }

                let mut candidate = CandidateQuery::new(
                    sql,
                    raw.confidence.unwrap_or(DEFAULT_CANDIDATE_CONFIDENCE),
                    raw.explanation.unwrap_or_default(),
                    attempt,
                );
                candidate.reasoning = raw.reasoning.filter(|r| !r.trim().is_empty());
                candidate.referenced = SqlValidator::referenced_identifiers(&candidate.sql, schema);
                Some(candidate)
            })
            .filter(|candidate| {
                let keep = candidate.confidence >= self.min_confidence;
                if !keep {
                    tracing::debug!(
                        "Dropping candidate below minimum confidence ({:.2}): {}",
                        candidate.confidence,
                        candidate.sql
                    );
                }
                keep
            })
            .collect();

        // Stable, so equal scores keep the model's order
        candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        candidates.truncate(self.max_candidates);
        candidates
    }

    fn with_row_cap(&self, mut candidate: CandidateQuery) -> CandidateQuery {
        match SqlValidator::ensure_limit(&candidate.sql, self.row_cap as u64) {
            Ok(sql) => candidate.sql = sql,
            // Unparseable SQL goes to the validator unchanged and is rejected there
            Err(rejection) => tracing::debug!("Could not append row cap: {}", rejection),
        }
        candidate
    }
}

/// Whitespace- and case-insensitive form used to collapse duplicates
fn normalize_sql(sql: &str) -> String {
    sql.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
