use crate::config::PipelineConfig;
use crate::models::{
    CandidateQuery, ConversationContext, Intent, IntentClassification, PipelineError, ResponseBody, RetryFeedback,
    SchemaCatalog, TurnResponse, TurnStage, ValidatedQuery, ValidationVerdict, VisualizationHint,
};
use crate::services::chat_service::ChatResponder;
use crate::services::intent_router::IntentRouter;
use crate::services::query_service::QueryService;
use crate::services::query_synthesizer::{QuerySynthesizer, SynthesisAttempt};
use crate::services::schema_catalog::SchemaCatalogService;
use crate::validation::SqlValidator;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Where a session stands between turns
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    /// The next message answers `clarification` about `original_question`
    AwaitingClarification {
        original_question: String,
        clarification: String,
    },
}

/// One conversation. Only the orchestrator mutates it.
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    context: ConversationContext,
    state: SessionState,
    created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(history_capacity: usize) -> Self {
        Self::with_id(Uuid::new_v4(), history_capacity)
    }

    pub fn with_id(id: Uuid, history_capacity: usize) -> Self {
        Self {
            id,
            context: ConversationContext::new(history_capacity),
            state: SessionState::Idle,
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn context(&self) -> &ConversationContext {
        &self.context
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// The question a new message stands for: a pending clarification
    /// gets the message merged in as its answer
    fn turn_question(&self, message: &str) -> String {
        let message = message.trim();
        match &self.state {
            SessionState::Idle => message.to_string(),
            SessionState::AwaitingClarification { original_question, .. } => {
                format!("{}\nClarification: {}", original_question, message)
            }
        }
    }
}

/// The caller abandoned the turn; nothing was recorded
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("Turn was cancelled")]
pub struct TurnCancelled;

#[derive(Default)]
struct TurnProgress {
    trace: Vec<TurnStage>,
    classification: Option<IntentClassification>,
}

impl TurnProgress {
    fn enter(&mut self, stage: TurnStage) {
        tracing::debug!("Turn stage: {:?}", stage);
        self.trace.push(stage);
    }
}

/// Drives one turn through classification, the synthesize/validate/execute
/// loop or chat, and records the outcome in the session.
pub struct Orchestrator {
    catalog: Arc<SchemaCatalogService>,
    router: IntentRouter,
    synthesizer: QuerySynthesizer,
    validator: SqlValidator,
    connector: QueryService,
    chat: Arc<dyn ChatResponder>,
    config: PipelineConfig,
}

impl Orchestrator {
    pub fn new(
        catalog: Arc<SchemaCatalogService>,
        router: IntentRouter,
        synthesizer: QuerySynthesizer,
        validator: SqlValidator,
        connector: QueryService,
        chat: Arc<dyn ChatResponder>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            catalog,
            router,
            synthesizer,
            validator,
            connector,
            chat,
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Process one user message.
    ///
    /// Always yields exactly one `TurnResponse` unless `cancel` fires first,
    /// in which case partial work is dropped and the session is untouched.
    pub async fn handle_turn(
        &self,
        session: &mut Session,
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<TurnResponse, TurnCancelled> {
        let started = Instant::now();
        let deadline = started + self.config.turn_deadline();
        let turn_index = session.context.next_index();
        let question = session.turn_question(message);
        let mut progress = TurnProgress::default();

        tracing::info!("Session {} turn {}: {}", session.id, turn_index, question);

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = tokio::time::timeout_at(
                deadline,
                self.run_pipeline(turn_index, &question, &session.context, deadline, &mut progress),
            ) => Some(result),
        };

        let mut response = match outcome {
            None => {
                tracing::info!("Session {} turn {} cancelled", session.id, turn_index);
                return Err(TurnCancelled);
            }
            Some(Ok(response)) => response,
            Some(Err(_)) => {
                let error = PipelineError::TurnDeadlineExceeded(self.config.turn_deadline_ms);
                self.failure(turn_index, progress.classification.as_ref(), &question, error)
            }
        };

        progress.enter(TurnStage::Responding);

        session.state = match response.clarification_question() {
            Some(clarification) => SessionState::AwaitingClarification {
                original_question: question.clone(),
                clarification: clarification.to_string(),
            },
            None => SessionState::Idle,
        };
        session
            .context
            .push(question, response.intent, response.query.clone(), summarize(&response.body));

        response.trace = progress.trace;
        response.elapsed_ms = started.elapsed().as_millis() as u64;

        tracing::info!(
            "Session {} turn {} answered as {} in {} ms",
            session.id,
            turn_index,
            response.intent.as_str(),
            response.elapsed_ms
        );
        Ok(response)
    }

    async fn run_pipeline(
        &self,
        turn_index: u64,
        question: &str,
        context: &ConversationContext,
        deadline: Instant,
        progress: &mut TurnProgress,
    ) -> TurnResponse {
        progress.enter(TurnStage::Classifying);
        let catalog = self.catalog.current().ok();
        let classification = match self.router.classify(question, context, catalog.as_deref()).await {
            Ok(classification) => classification,
            Err(error) => return self.failure(turn_index, None, question, error),
        };
        progress.classification = Some(classification.clone());
        let question = classification.effective_question(question).to_string();

        if classification.intent.needs_query() {
            return self
                .answer_with_query(turn_index, &classification, &question, context, deadline, progress)
                .await;
        }

        match classification.intent {
            Intent::Chat => {
                progress.enter(TurnStage::Chatting);
                match self.chat.respond(&question, context).await {
                    Ok(text) => TurnResponse::new(
                        turn_index,
                        classification.intent,
                        classification.confidence,
                        question,
                        ResponseBody::Chat { text },
                    ),
                    Err(error) => self.failure(turn_index, Some(&classification), &question, error),
                }
            }
            _ => {
                progress.enter(TurnStage::AwaitingClarification);
                let clarification = ask_about(&classification);
                TurnResponse::new(
                    turn_index,
                    classification.intent,
                    classification.confidence,
                    question,
                    ResponseBody::Clarification { question: clarification },
                )
            }
        }
    }

    /// Bounded synthesize → validate → execute loop. Rejections from the
    /// validator or the engine become feedback for the next attempt.
    async fn answer_with_query(
        &self,
        turn_index: u64,
        classification: &IntentClassification,
        question: &str,
        context: &ConversationContext,
        deadline: Instant,
        progress: &mut TurnProgress,
    ) -> TurnResponse {
        let catalog = match self.catalog.current() {
            Ok(catalog) => catalog,
            Err(error) => return self.failure(turn_index, Some(classification), question, error),
        };

        let max_attempts = self.synthesizer.max_attempts();
        let mut feedback: Vec<RetryFeedback> = Vec::new();
        let mut last_failure: Option<PipelineError> = None;
        let mut force_row_cap = false;

        for attempt in 1..=max_attempts {
            progress.enter(TurnStage::Synthesizing);
            let synthesis = SynthesisAttempt {
                attempt,
                feedback: &feedback,
                force_row_cap,
            };
            let candidates = match self.synthesizer.synthesize(question, &catalog, context, synthesis).await {
                Ok(candidates) => candidates,
                Err(PipelineError::SynthesisExhausted { .. }) => break,
                Err(error) => return self.failure(turn_index, Some(classification), question, error),
            };

            if candidates.is_empty() {
                feedback.push(RetryFeedback {
                    attempt,
                    sql: None,
                    reason: "No candidate query reached the minimum confidence".to_string(),
                });
                continue;
            }

            progress.enter(TurnStage::Validating);
            let mut accepted: Option<(ValidatedQuery, String)> = None;
            for candidate in candidates {
                match self.validator.validate(&candidate, &catalog) {
                    ValidationVerdict::Accept(query) => {
                        accepted = Some((query, candidate.explanation));
                        break;
                    }
                    ValidationVerdict::NeedsRewrite(rejection) => {
                        tracing::warn!("Attempt {} needs rewrite: {}", attempt, rejection);
                        // No retry left to carry the row cap, so cap this candidate directly
                        if attempt == max_attempts {
                            if let Some(query) = self.cap_rows(&candidate, &catalog) {
                                accepted = Some((query, candidate.explanation));
                                break;
                            }
                        }
                        force_row_cap = true;
                        feedback.push(RetryFeedback {
                            attempt,
                            sql: Some(candidate.sql),
                            reason: rejection.to_string(),
                        });
                        last_failure = Some(rejection.into());
                    }
                    ValidationVerdict::Reject(rejection) => {
                        tracing::warn!("Attempt {} rejected: {}", attempt, rejection);
                        feedback.push(RetryFeedback {
                            attempt,
                            sql: Some(candidate.sql),
                            reason: rejection.to_string(),
                        });
                        last_failure = Some(rejection.into());
                    }
                }
            }

            let Some((query, explanation)) = accepted else {
                continue;
            };

            progress.enter(TurnStage::Executing);
            let budget = deadline
                .saturating_duration_since(Instant::now())
                .min(self.config.query_timeout());
            match self.connector.execute(&query, budget).await {
                Ok(result) => {
                    let mut response = TurnResponse::new(
                        turn_index,
                        classification.intent,
                        classification.confidence,
                        question,
                        ResponseBody::Rows { result },
                    );
                    response.query = Some(query.sql().to_string());
                    response.explanation = Some(explanation).filter(|e| !e.trim().is_empty());
                    if classification.intent == Intent::Visualize {
                        response.visualization_hint = Some(VisualizationHint {
                            request: question.to_string(),
                        });
                    }
                    return response;
                }
                Err(error) if error.is_retryable() => {
                    tracing::warn!("Attempt {} failed on execution: {}", attempt, error);
                    let reason = match &error {
                        PipelineError::QueryRejectedByEngine(message) => format!("Database error: {}", message),
                        other => other.to_string(),
                    };
                    feedback.push(RetryFeedback {
                        attempt,
                        sql: Some(query.sql().to_string()),
                        reason,
                    });
                    last_failure = Some(error);
                }
                Err(error) => return self.failure(turn_index, Some(classification), question, error),
            }
        }

        let exhausted = PipelineError::SynthesisExhausted {
            attempts: max_attempts,
            last_reason: feedback.last().map(|f| f.reason.clone()),
        };
        tracing::warn!("Session turn {}: {}", turn_index, exhausted);

        progress.enter(TurnStage::AwaitingClarification);
        TurnResponse::new(
            turn_index,
            classification.intent,
            classification.confidence,
            question,
            ResponseBody::Clarification {
                question: rephrase_request(last_failure.as_ref()),
            },
        )
    }

    /// Append the row cap to a candidate and validate it again
    fn cap_rows(&self, candidate: &CandidateQuery, catalog: &SchemaCatalog) -> Option<ValidatedQuery> {
        let capped = SqlValidator::ensure_limit(&candidate.sql, self.config.row_cap as u64).ok()?;
        match self.validator.validate_sql(&capped, catalog) {
            ValidationVerdict::Accept(query) => {
                tracing::info!("Accepted candidate with forced LIMIT {}", self.config.row_cap);
                Some(query)
            }
            _ => None,
        }
    }

    fn failure(
        &self,
        turn_index: u64,
        classification: Option<&IntentClassification>,
        question: &str,
        error: PipelineError,
    ) -> TurnResponse {
        tracing::error!("Turn {} failed: {}", turn_index, error);
        // Unclassified turns are reported as needing clarification
        let intent = classification.map_or(Intent::NeedsClarification, |c| c.intent);
        let mut response = TurnResponse::failure(turn_index, intent, question, &error);
        response.confidence = classification.map_or(0.0, |c| c.confidence);
        response
    }
}

/// Clarification built from what the router could not resolve
fn ask_about(classification: &IntentClassification) -> String {
    if let Some(question) = &classification.clarification_question {
        return question.clone();
    }
    let ambiguities = &classification.ambiguities;
    if ambiguities.is_empty() {
        return "I'm not sure what you'd like to see. Could you say which data you mean, for example a table or a time period?"
            .to_string();
    }
    format!(
        "Before I run anything, could you clarify the following: {}?",
        ambiguities.join("; ")
    )
}

/// Clarification after the attempt cap, hinting at the last problem
fn rephrase_request(last_failure: Option<&PipelineError>) -> String {
    let hint = match last_failure {
        Some(PipelineError::UnsafeOperation(_)) => {
            " I can only read data, so requests to change or delete it can't be run.".to_string()
        }
        Some(PipelineError::UnknownIdentifier(detail)) => {
            format!(" Some names did not match the database ({}).", detail)
        }
        Some(PipelineError::PotentiallyUnbounded(_)) => {
            " The query would scan too much data without a filter.".to_string()
        }
        _ => String::new(),
    };
    format!(
        "I couldn't build a query I'm confident in for that question.{} Could you rephrase it or name the tables and columns you mean?",
        hint
    )
}

fn summarize(body: &ResponseBody) -> Option<String> {
    match body {
        ResponseBody::Rows { result } => Some(result.summary()),
        ResponseBody::Chat { text } => Some(text.chars().take(200).collect()),
        ResponseBody::Clarification { question } => Some(format!("asked: {}", question)),
        ResponseBody::Failure { code, .. } => Some(format!("failed: {}", code)),
    }
}
