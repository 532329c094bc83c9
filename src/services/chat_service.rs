use crate::models::{ConversationContext, PipelineError};
use crate::services::llm_service::{ChatMessage, CompletionRequest, LlmService};
use crate::services::schema_catalog::SchemaCatalogService;
use std::sync::Arc;

/// Answers turns classified as chat
#[async_trait::async_trait]
pub trait ChatResponder: Send + Sync {
    async fn respond(&self, question: &str, context: &ConversationContext) -> Result<String, PipelineError>;
}

const CHAT_SYSTEM_PROMPT: &str = "You are a friendly assistant that helps people explore a PostgreSQL database. \
Answer briefly in plain language. You cannot change data. If the user asks for data, suggest how they could phrase the question.";

/// Chat answers from the language model, with the schema summary and
/// recent turns as context
pub struct LlmChatResponder {
    llm: LlmService,
    catalog: Option<Arc<SchemaCatalogService>>,
    history_window: usize,
}

impl LlmChatResponder {
    pub fn new(llm: LlmService, catalog: Option<Arc<SchemaCatalogService>>, history_window: usize) -> Self {
        Self {
            llm,
            catalog,
            history_window,
        }
    }

    fn build_request(&self, question: &str, context: &ConversationContext) -> CompletionRequest {
        let mut system = CHAT_SYSTEM_PROMPT.to_string();
        if let Some(catalog) = self.catalog.as_ref().and_then(|c| c.current().ok()) {
            system.push_str("\n\nTables you can query:\n");
            system.push_str(&catalog.summary());
        }

        let mut messages = Vec::new();
        for turn in context.recent(self.history_window) {
            messages.push(ChatMessage::user(turn.question.clone()));
            let reply = turn
                .result_summary
                .clone()
                .or_else(|| turn.query.clone())
                .unwrap_or_else(|| format!("({})", turn.intent.as_str()));
            messages.push(ChatMessage::assistant(reply));
        }
        messages.push(ChatMessage::user(question));

        CompletionRequest::with_messages(system, messages)
    }
}

#[async_trait::async_trait]
impl ChatResponder for LlmChatResponder {
    async fn respond(&self, question: &str, context: &ConversationContext) -> Result<String, PipelineError> {
        let response = self.llm.complete(self.build_request(question, context)).await?;
        Ok(response.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Intent;
    use crate::test_support::{bookings_catalog, FakeAdapter, ScriptedLlm};
    use std::time::Duration;

    #[tokio::test]
    async fn test_reply_uses_schema_and_history() {
        let llm = Arc::new(ScriptedLlm::new());
        llm.push_text("Hi! I can answer questions about bookings and tickets.");

        let catalog = Arc::new(SchemaCatalogService::new(
            Arc::new(FakeAdapter::new().with_catalog(bookings_catalog())),
            None,
            "bookings",
            0,
        ));
        catalog.load().await.unwrap();

        let mut context = ConversationContext::new(10);
        context.push(
            "How many bookings?",
            Intent::RunQuery,
            Some("SELECT count(*) FROM bookings".into()),
            Some("1 rows (count)".into()),
        );

        let responder = LlmChatResponder::new(
            LlmService::with_backoff(llm.clone(), Duration::from_millis(1)),
            Some(catalog),
            3,
        );
        let text = responder.respond("What can you do?", &context).await.unwrap();
        assert!(text.starts_with("Hi!"));

        let request = llm.last_request().unwrap();
        assert!(request.system.contains("tickets(ticket_no, book_ref, passenger_name)"));
        assert_eq!(request.messages.len(), 3);
        assert_eq!(request.messages[1].content, "1 rows (count)");
        assert_eq!(request.messages[2].content, "What can you do?");
    }

    #[tokio::test]
    async fn test_works_without_catalog() {
        let llm = Arc::new(ScriptedLlm::new());
        llm.push_text("Hello.");
        let responder = LlmChatResponder::new(LlmService::with_backoff(llm.clone(), Duration::from_millis(1)), None, 3);

        assert_eq!(responder.respond("hi", &ConversationContext::new(2)).await.unwrap(), "Hello.");
        assert!(!llm.last_request().unwrap().system.contains("Tables you can query"));
    }
}
