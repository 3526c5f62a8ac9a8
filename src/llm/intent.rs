//! Request intent classification.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{ChatMessage, ChatOptions, GeneratorPool};
use crate::error::Result;
use crate::util::extract_json;

/// The fixed set of intent tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    /// Factual question answerable from knowledge or context
    Question,
    /// Do something in the world (run, create, modify)
    Action,
    /// Look something up
    Search,
    /// Compute a value
    Calculation,
    /// Examine or compare material
    Analysis,
    /// Small talk
    Conversation,
}

impl Intent {
    pub const ALL: [Intent; 6] = [
        Intent::Question,
        Intent::Action,
        Intent::Search,
        Intent::Calculation,
        Intent::Analysis,
        Intent::Conversation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Question => "question",
            Intent::Action => "action",
            Intent::Search => "search",
            Intent::Calculation => "calculation",
            Intent::Analysis => "analysis",
            Intent::Conversation => "conversation",
        }
    }

    fn parse(tag: &str) -> Option<Self> {
        let tag = tag.trim().to_lowercase();
        Self::ALL.into_iter().find(|i| i.as_str() == tag)
    }
}

/// Outcome of intent recognition.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntentResult {
    pub intent: Intent,
    /// 0.0 to 1.0
    pub confidence: f64,
    pub needs_tools: bool,
}

impl IntentResult {
    /// Used when classification fails: assume tools are needed.
    pub fn fallback() -> Self {
        Self {
            intent: Intent::Action,
            confidence: 0.0,
            needs_tools: true,
        }
    }

    /// Parse a model response, tolerating fences and think-tags.
    ///
    /// Unknown intents map to `action`; confidence is clamped to [0, 1];
    /// a missing `needs_tools` is inferred from the intent.
    pub fn from_response(text: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(&extract_json(text)).ok()?;
        let intent = value
            .get("intent")
            .and_then(Value::as_str)
            .and_then(Intent::parse)
            .unwrap_or(Intent::Action);
        let confidence = value
            .get("confidence")
            .and_then(Value::as_f64)
            .unwrap_or(0.5)
            .clamp(0.0, 1.0);
        let needs_tools = value
            .get("needs_tools")
            .and_then(Value::as_bool)
            .unwrap_or(matches!(
                intent,
                Intent::Action | Intent::Search | Intent::Calculation
            ));
        Some(Self {
            intent,
            confidence,
            needs_tools,
        })
    }
}

fn intent_prompt() -> String {
    let tags: Vec<&str> = Intent::ALL.iter().map(Intent::as_str).collect();
    format!(
        "Classify the user's request. Reply with JSON only:\n\
         {{\"intent\": one of [{}], \"confidence\": number between 0 and 1, \
         \"needs_tools\": true if answering requires calling external tools}}",
        tags.join(", ")
    )
}

impl GeneratorPool {
    /// Classify a request into one of the fixed intent tags.
    pub async fn recognize_intent(&self, request: &str) -> Result<IntentResult> {
        let messages = vec![ChatMessage::system(intent_prompt()), ChatMessage::user(request)];
        let options = ChatOptions::with_temperature(0.0).max_tokens(200).json();
        let response = self.chat(messages, None, options, None).await?;
        let text = response.content.unwrap_or_default();

        Ok(IntentResult::from_response(&text).unwrap_or_else(|| {
            debug!("Unparseable intent response, assuming tools are needed");
            IntentResult::fallback()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_response() {
        let r = IntentResult::from_response(r#"{"intent":"calculation","confidence":0.9,"needs_tools":true}"#).unwrap();
        assert_eq!(r.intent, Intent::Calculation);
        assert!(r.needs_tools);
        assert!((r.confidence - 0.9).abs() < f64::EPSILON);
    }

    #[test]
    fn tolerates_noise_and_unknown_tags() {
        let r = IntentResult::from_response(
            "<think>hmm</think>```json\n{\"intent\":\"Chit-Chat\",\"confidence\":7}\n```",
        )
        .unwrap();
        assert_eq!(r.intent, Intent::Action);
        assert_eq!(r.confidence, 1.0);
        assert!(r.needs_tools);
    }

    #[test]
    fn needs_tools_inferred_from_intent() {
        let r = IntentResult::from_response(r#"{"intent":"conversation"}"#).unwrap();
        assert!(!r.needs_tools);
    }

    #[test]
    fn garbage_is_none() {
        assert!(IntentResult::from_response("no json here").is_none());
    }
}
