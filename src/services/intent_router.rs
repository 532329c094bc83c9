use crate::models::{ConversationContext, Intent, IntentClassification, PipelineError, SchemaCatalog};
use crate::services::llm_service::{extract_json, CompletionRequest, LlmService};
use serde::Deserialize;

const ROUTER_SYSTEM_PROMPT: &str = r#"You route questions asked to a PostgreSQL data assistant.

Classify the latest question into exactly one intent:
- run_query: the user wants data from the database
- visualize: the user wants a chart or plot of data from the database
- chat: greetings, questions about the assistant, or general questions that need no data
- needs_clarification: the question is too vague to answer (unknown table, missing metric or time range),
  or the tables listed cannot answer it

If the question refers to earlier turns ("those", "the same but for 2017"), rewrite it into a standalone question.
List the aspects you could not resolve in "ambiguities".
For needs_clarification, write the follow-up question to ask the user in "clarification_question".

Respond with JSON only:
{"intent": "run_query", "confidence": 0.0, "rewritten_question": null, "ambiguities": [], "clarification_question": null}"#;

#[derive(Debug, Deserialize)]
struct RawClassification {
    intent: String,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    rewritten_question: Option<String>,
    #[serde(default)]
    ambiguities: Vec<String>,
    #[serde(default)]
    clarification_question: Option<String>,
}

/// Classifies each turn into an intent.
///
/// Stateless: everything is derived from the question, the conversation
/// history and the schema summary passed in.
#[derive(Clone)]
pub struct IntentRouter {
    llm: LlmService,
    confidence_threshold: f64,
    history_window: usize,
}

impl IntentRouter {
    pub fn new(llm: LlmService, confidence_threshold: f64, history_window: usize) -> Self {
        Self {
            llm,
            confidence_threshold,
            history_window,
        }
    }

    /// Classify `question`. Confidence below the threshold always yields
    /// `NeedsClarification`.
    pub async fn classify(
        &self,
        question: &str,
        context: &ConversationContext,
        schema: Option<&SchemaCatalog>,
    ) -> Result<IntentClassification, PipelineError> {
        let request = CompletionRequest::new(ROUTER_SYSTEM_PROMPT, self.build_prompt(question, context, schema));
        let response = self.llm.complete(request).await?;

        let classification = Self::parse_classification(&response.text).apply_threshold(self.confidence_threshold);
        tracing::info!(
            "Classified turn as {} (confidence {:.2})",
            classification.intent.as_str(),
            classification.confidence
        );
        Ok(classification)
    }

    fn build_prompt(&self, question: &str, context: &ConversationContext, schema: Option<&SchemaCatalog>) -> String {
        let mut prompt = String::new();
        match schema {
            Some(catalog) => {
                prompt.push_str("Database tables:\n");
                prompt.push_str(&catalog.summary());
            }
            None => prompt.push_str("Database tables: unavailable\n"),
        }

        let history = context.render_history(self.history_window);
        if !history.is_empty() {
            prompt.push_str("\nConversation so far:\n");
            prompt.push_str(&history);
        }

        prompt.push_str(&format!("\nQuestion: {}", question));
        prompt
    }

    /// Output that cannot be read as a classification becomes
    /// `NeedsClarification` with zero confidence.
    fn parse_classification(text: &str) -> IntentClassification {
        let raw = extract_json(text).and_then(|json| serde_json::from_str::<RawClassification>(json).ok());

        let Some(raw) = raw else {
            tracing::warn!("Unreadable classification output: {}", text);
            return IntentClassification::new(Intent::NeedsClarification, 0.0);
        };

        let Some(intent) = Intent::from_label(&raw.intent) else {
            tracing::warn!("Unknown intent label: {}", raw.intent);
            return IntentClassification::new(Intent::NeedsClarification, 0.0);
        };

        let mut classification = IntentClassification::new(intent, raw.confidence);
        classification.rewritten_question = raw
            .rewritten_question
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty());
        classification.ambiguities = raw
            .ambiguities
            .into_iter()
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .collect();
        classification.clarification_question = raw
            .clarification_question
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty());
        classification
    }
}
