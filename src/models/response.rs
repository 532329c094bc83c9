use serde::{Deserialize, Serialize};

use super::error::PipelineError;
use super::intent::Intent;
use super::query::ExecutionResult;

/// Pipeline stage a turn passed through
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TurnStage {
    Classifying,
    Synthesizing,
    Validating,
    Executing,
    Chatting,
    Responding,
    AwaitingClarification,
}

/// Exactly one payload per turn
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResponseBody {
    Rows { result: ExecutionResult },
    Chat { text: String },
    Clarification { question: String },
    Failure { code: String, message: String },
}

/// Request forwarded to the visualization collaborator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VisualizationHint {
    pub request: String,
}

/// The single structured answer emitted for a turn
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TurnResponse {
    pub turn_index: u64,
    pub intent: Intent,
    pub confidence: f64,
    /// Question the pipeline actually worked from
    pub question: String,
    pub query: Option<String>,
    pub explanation: Option<String>,
    pub body: ResponseBody,
    pub visualization_hint: Option<VisualizationHint>,
    pub trace: Vec<TurnStage>,
    pub elapsed_ms: u64,
}

impl TurnResponse {
    pub fn new(turn_index: u64, intent: Intent, confidence: f64, question: impl Into<String>, body: ResponseBody) -> Self {
        Self {
            turn_index,
            intent,
            confidence,
            question: question.into(),
            query: None,
            explanation: None,
            body,
            visualization_hint: None,
            trace: Vec::new(),
            elapsed_ms: 0,
        }
    }

    pub fn failure(turn_index: u64, intent: Intent, question: impl Into<String>, error: &PipelineError) -> Self {
        Self::new(
            turn_index,
            intent,
            0.0,
            question,
            ResponseBody::Failure {
                code: error.code().to_string(),
                message: error.user_message(),
            },
        )
    }

    pub fn execution_result(&self) -> Option<&ExecutionResult> {
        match &self.body {
            ResponseBody::Rows { result } => Some(result),
            _ => None,
        }
    }

    pub fn chat_text(&self) -> Option<&str> {
        match &self.body {
            ResponseBody::Chat { text } => Some(text),
            _ => None,
        }
    }

    pub fn clarification_question(&self) -> Option<&str> {
        match &self.body {
            ResponseBody::Clarification { question } => Some(question),
            _ => None,
        }
    }

    pub fn failure_code(&self) -> Option<&str> {
        match &self.body {
            ResponseBody::Failure { code, .. } => Some(code),
            _ => None,
        }
    }
}
