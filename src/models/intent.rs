use serde::{Deserialize, Serialize};

/// Classified purpose of a user turn
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    RunQuery,
    Visualize,
    Chat,
    NeedsClarification,
}

impl Intent {
    /// Lenient parse of a model-produced label
    pub fn from_label(label: &str) -> Option<Self> {
        let normalized: String = label
            .trim()
            .to_lowercase()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();
        match normalized.as_str() {
            "runquery" | "query" | "text2sql" | "sql" => Some(Intent::RunQuery),
            "visualize" | "visualization" | "chart" => Some(Intent::Visualize),
            "chat" | "conversation" => Some(Intent::Chat),
            "needsclarification" | "clarification" | "clarify" => Some(Intent::NeedsClarification),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::RunQuery => "run_query",
            Intent::Visualize => "visualize",
            Intent::Chat => "chat",
            Intent::NeedsClarification => "needs_clarification",
        }
    }

    /// Intents that go through synthesis, validation and execution
    pub fn needs_query(&self) -> bool {
        matches!(self, Intent::RunQuery | Intent::Visualize)
    }
}

/// Result of classifying one turn. Produced fresh per turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IntentClassification {
    pub intent: Intent,
    pub confidence: f64,
    /// Question rewritten against conversation context, if the model resolved references
    pub rewritten_question: Option<String>,
    /// Aspects the model could not resolve (table, time range, metric, ...)
    #[serde(default)]
    pub ambiguities: Vec<String>,
    /// Follow-up question written by the model, e.g. when the schema cannot answer the question
    #[serde(default)]
    pub clarification_question: Option<String>,
}

impl IntentClassification {
    pub fn new(intent: Intent, confidence: f64) -> Self {
        Self {
            intent,
            confidence: confidence.clamp(0.0, 1.0),
            rewritten_question: None,
            ambiguities: Vec::new(),
            clarification_question: None,
        }
    }

    /// Force `NeedsClarification` when confidence is below the threshold
    pub fn apply_threshold(mut self, threshold: f64) -> Self {
        if self.confidence < threshold && self.intent != Intent::NeedsClarification {
            tracing::debug!(
                "Confidence {:.2} below threshold {:.2}, downgrading {} to needs_clarification",
                self.confidence,
                threshold,
                self.intent.as_str()
            );
            self.intent = Intent::NeedsClarification;
        }
        self
    }

    /// Question the downstream stages should work from
    pub fn effective_question<'a>(&'a self, original: &'a str) -> &'a str {
        self.rewritten_question
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .unwrap_or(original)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_parsing() {
        assert_eq!(Intent::from_label("run_query"), Some(Intent::RunQuery));
        assert_eq!(Intent::from_label("Text2SQL"), Some(Intent::RunQuery));
        assert_eq!(Intent::from_label("Visualization"), Some(Intent::Visualize));
        assert_eq!(Intent::from_label("needs-clarification"), Some(Intent::NeedsClarification));
        assert_eq!(Intent::from_label("weather"), None);
    }

    #[test]
    fn test_threshold_forces_clarification() {
        let low = IntentClassification::new(Intent::RunQuery, 0.4).apply_threshold(0.6);
        assert_eq!(low.intent, Intent::NeedsClarification);

        let high = IntentClassification::new(Intent::Chat, 0.9).apply_threshold(0.6);
        assert_eq!(high.intent, Intent::Chat);

        let at_threshold = IntentClassification::new(Intent::RunQuery, 0.6).apply_threshold(0.6);
        assert_eq!(at_threshold.intent, Intent::RunQuery);
    }

    #[test]
    fn test_confidence_is_clamped() {
        assert_eq!(IntentClassification::new(Intent::Chat, 1.7).confidence, 1.0);
        assert_eq!(IntentClassification::new(Intent::Chat, -0.2).confidence, 0.0);
    }

    #[test]
    fn test_effective_question_prefers_rewrite() {
        let mut classification = IntentClassification::new(Intent::RunQuery, 0.9);
        assert_eq!(classification.effective_question("show those"), "show those");
        classification.rewritten_question = Some("show bookings from 2017".into());
        assert_eq!(
            classification.effective_question("show those"),
            "show bookings from 2017"
        );
    }
}
