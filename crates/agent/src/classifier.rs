//! Intent classification.
//!
//! A classifier turns a raw customer message into the seven-field decision
//! record plus any facts it could extract (currently the selected slot). The
//! keyword classifier is deterministic and needs no network. The reasoning
//! classifier asks an [`LlmClient`] and decodes its free-text answer.

use std::collections::BTreeMap;

use async_trait::async_trait;
use caseflow_core::decision::{DecisionType, DecodeFailure, DecodedResponse, ResponseDecoder};
use caseflow_core::plan::Facts;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::warn;

use crate::llm::{LlmClient, LlmError};
use crate::planner::{
    CONFIRM_SLOT_INTENT, OFFER_SLOTS_INTENT, REBOOK_INTENT, SELECTED_SLOT_FACT,
};

pub const ACKNOWLEDGE_MISSED_INTENT: &str = "acknowledge_missed";
pub const CANCEL_INTENT: &str = "cancel_appointment";
pub const RESCHEDULE_INTENT: &str = "reschedule_appointment";
pub const UNKNOWN_INTENT: &str = "unknown";

const MISSED_KEYWORDS: &[&str] = &["missed", "didn't make", "couldn't make", "no-show"];
const REBOOK_KEYWORDS: &[&str] = &["rebook", "reschedule", "new appointment", "different time"];
const OFFER_KEYWORDS: &[&str] = &["options", "available", "which times", "what times"];
const CANCEL_KEYWORDS: &[&str] = &["cancel", "don't want"];
const RESCHEDULE_KEYWORDS: &[&str] = &["reschedule", "move", "change time"];

/// Goal statement for a known intent, or the catch-all goal.
pub fn goal_for(intent: &str) -> &'static str {
    match intent {
        REBOOK_INTENT => "Rebook the missed appointment with minimal customer effort",
        OFFER_SLOTS_INTENT => "Offer the customer open slots to choose from",
        CONFIRM_SLOT_INTENT => "Book the slot the customer selected and confirm it",
        ACKNOWLEDGE_MISSED_INTENT => {
            "Acknowledge the missed appointment and learn what the customer needs"
        }
        CANCEL_INTENT => "Cancel appointment and record cancellation reason",
        RESCHEDULE_INTENT => "Reschedule existing appointment to new time",
        _ => "Understand customer intent and route appropriately",
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Classification {
    pub intent: String,
    pub goal: String,
    pub decision: String,
    pub decision_type: DecisionType,
    pub reasoning: String,
    pub recommended_action: String,
    pub confidence: f64,
    /// Extra facts handed to the planner.
    pub facts: Facts,
}

impl Classification {
    fn from_decoded(decoded: DecodedResponse, facts: Facts) -> Self {
        Self {
            intent: decoded.intent,
            goal: decoded.goal,
            decision: decoded.decision,
            decision_type: decoded.decision_type,
            reasoning: decoded.reasoning,
            recommended_action: decoded.recommended_action,
            confidence: decoded.confidence,
            facts,
        }
    }
}

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("classifier answer could not be decoded: {0}")]
    Decode(#[source] DecodeFailure),
    #[error("classifier backend unavailable: {0}")]
    Unavailable(String),
}

impl From<LlmError> for ClassifierError {
    fn from(error: LlmError) -> Self {
        Self::Unavailable(error.to_string())
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ClassifyRequest<'a> {
    pub correlation_id: &'a str,
    pub customer_id: &'a str,
    pub message: &'a str,
}

#[async_trait]
pub trait IntentClassifier: Send + Sync {
    async fn classify(
        &self,
        request: ClassifyRequest<'_>,
    ) -> Result<Classification, ClassifierError>;

    fn name(&self) -> &'static str;
}

/// Finds `slot_003`, `slot 003` or `slot 3` and returns the normalised id.
pub fn mentioned_slot_id(message: &str) -> Option<String> {
    let lowered = message.to_lowercase();
    let tokens = lowered
        .split(|c: char| c.is_whitespace() || matches!(c, ',' | '.' | '!' | '?' | ':' | ';'))
        .filter(|token| !token.is_empty())
        .collect::<Vec<_>>();

    tokens.iter().enumerate().find_map(|(position, token)| {
        let raw_id = match token.strip_prefix("slot_") {
            Some(suffix) => suffix,
            None if *token == "slot" => *tokens.get(position + 1)?,
            None => return None,
        };
        let raw_id = raw_id.trim_start_matches('#');
        let well_formed = raw_id.chars().all(|c| c.is_ascii_alphanumeric())
            && raw_id.chars().any(|c| c.is_ascii_digit());
        if !well_formed {
            return None;
        }
        if raw_id.chars().all(|c| c.is_ascii_digit()) {
            Some(format!("slot_{raw_id:0>3}"))
        } else {
            Some(format!("slot_{raw_id}"))
        }
    })
}

fn contains_any(text: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|keyword| text.contains(keyword))
}

#[derive(Clone, Debug, Default)]
pub struct KeywordIntentClassifier;

struct Rule {
    intent: &'static str,
    decision: &'static str,
    decision_type: DecisionType,
    reasoning: &'static str,
    recommended_action: &'static str,
    confidence: f64,
}

impl KeywordIntentClassifier {
    fn rule_for(message: &str) -> Rule {
        let lowered = message.to_lowercase();
        let missed = contains_any(&lowered, MISSED_KEYWORDS);
        let rebook = contains_any(&lowered, REBOOK_KEYWORDS);

        if mentioned_slot_id(message).is_some() {
            return Rule {
                intent: CONFIRM_SLOT_INTENT,
                decision: "automate",
                decision_type: DecisionType::Automate,
                reasoning: "Customer picked a specific slot for the missed appointment",
                recommended_action: "rebook_appointment",
                confidence: 0.85,
            };
        }
        if missed && contains_any(&lowered, OFFER_KEYWORDS) {
            return Rule {
                intent: OFFER_SLOTS_INTENT,
                decision: "automate",
                decision_type: DecisionType::Automate,
                reasoning: "Customer missed an appointment and asked which times are open",
                recommended_action: "get_available_slots",
                confidence: 0.85,
            };
        }
        if missed && rebook {
            return Rule {
                intent: REBOOK_INTENT,
                decision: "automate",
                decision_type: DecisionType::Automate,
                reasoning: "Customer missed an appointment and asked to rebook it",
                recommended_action: "rebook_appointment",
                confidence: 0.9,
            };
        }
        if missed {
            return Rule {
                intent: ACKNOWLEDGE_MISSED_INTENT,
                decision: "clarify",
                decision_type: DecisionType::Clarify,
                reasoning: "Customer mentioned a missed appointment without saying what they want",
                recommended_action: "request_clarification",
                confidence: 0.6,
            };
        }
        if contains_any(&lowered, CANCEL_KEYWORDS) {
            return Rule {
                intent: CANCEL_INTENT,
                decision: "escalate",
                decision_type: DecisionType::Escalate,
                reasoning: "Cancellations are handled by a specialist",
                recommended_action: "escalate_to_human",
                confidence: 0.7,
            };
        }
        if contains_any(&lowered, RESCHEDULE_KEYWORDS) {
            return Rule {
                intent: RESCHEDULE_INTENT,
                decision: "escalate",
                decision_type: DecisionType::Escalate,
                reasoning: "Rescheduling a kept appointment is handled by a specialist",
                recommended_action: "escalate_to_human",
                confidence: 0.7,
            };
        }
        Rule {
            intent: UNKNOWN_INTENT,
            decision: "escalate",
            decision_type: DecisionType::Escalate,
            reasoning: "No known request pattern matched the message",
            recommended_action: "request_clarification",
            confidence: 0.3,
        }
    }
}

#[async_trait]
impl IntentClassifier for KeywordIntentClassifier {
    async fn classify(
        &self,
        request: ClassifyRequest<'_>,
    ) -> Result<Classification, ClassifierError> {
        let rule = Self::rule_for(request.message);
        let mut facts = BTreeMap::new();
        if rule.intent == CONFIRM_SLOT_INTENT {
            if let Some(slot_id) = mentioned_slot_id(request.message) {
                facts.insert(SELECTED_SLOT_FACT.to_string(), json!(slot_id));
            }
        }

        Ok(Classification {
            intent: rule.intent.to_string(),
            goal: goal_for(rule.intent).to_string(),
            decision: rule.decision.to_string(),
            decision_type: rule.decision_type,
            reasoning: rule.reasoning.to_string(),
            recommended_action: rule.recommended_action.to_string(),
            confidence: rule.confidence,
            facts,
        })
    }

    fn name(&self) -> &'static str {
        "keyword"
    }
}

const SYSTEM_PROMPT: &str = r#"You are the decision engine of a contact-center agent.
You can rebook missed appointments for eligible customers, escalate to a human, or ask for clarification.

Answer with one JSON object and nothing else:
{
  "intent": "one of the supported intents, or a short snake_case label",
  "goal": "what you are trying to achieve",
  "decision": "automate|escalate|clarify",
  "decision_type": "AUTOMATE|ESCALATE|CLARIFY",
  "reasoning": "why you made this decision",
  "recommended_action": "the next action, e.g. rebook_appointment or escalate_to_human",
  "confidence": 0.0
}
confidence is a number between 0 and 1."#;

pub struct ReasoningIntentClassifier<C> {
    client: C,
    decoder: ResponseDecoder,
    supported_intents: Vec<String>,
}

impl<C> ReasoningIntentClassifier<C>
where
    C: LlmClient,
{
    pub fn new(client: C, decoder: ResponseDecoder, supported_intents: Vec<String>) -> Self {
        Self { client, decoder, supported_intents }
    }

    pub fn user_prompt(&self, request: &ClassifyRequest<'_>) -> String {
        format!(
            "Supported intents: {}\nCustomer ID: {}\nCustomer message: {:?}\n\nClassify the message and decide.",
            self.supported_intents.join(", "),
            request.customer_id,
            request.message
        )
    }
}

#[async_trait]
impl<C> IntentClassifier for ReasoningIntentClassifier<C>
where
    C: LlmClient,
{
    async fn classify(
        &self,
        request: ClassifyRequest<'_>,
    ) -> Result<Classification, ClassifierError> {
        let raw = self.client.complete(SYSTEM_PROMPT, &self.user_prompt(&request)).await.map_err(
            |error| {
                warn!(
                    event_name = "classifier.unavailable",
                    correlation_id = %request.correlation_id,
                    provider = self.client.provider_name(),
                    error = %error,
                    "reasoning backend call failed"
                );
                ClassifierError::from(error)
            },
        )?;

        let decoded = self
            .decoder
            .decode_with_correlation(&raw, Some(request.correlation_id))
            .map_err(ClassifierError::Decode)?;

        let mut facts = BTreeMap::new();
        if let Some(slot_id) = mentioned_slot_id(request.message) {
            facts.insert(SELECTED_SLOT_FACT.to_string(), json!(slot_id));
        }
        Ok(Classification::from_decoded(decoded, facts))
    }

    fn name(&self) -> &'static str {
        "reasoning"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use caseflow_core::decision::{DecisionType, ResponseDecoder};
    use serde_json::json;

    use super::{
        mentioned_slot_id, ClassifierError, ClassifyRequest, IntentClassifier,
        KeywordIntentClassifier, ReasoningIntentClassifier, ACKNOWLEDGE_MISSED_INTENT,
        CANCEL_INTENT, UNKNOWN_INTENT,
    };
    use crate::llm::{LlmClient, LlmError};
    use crate::planner::{CONFIRM_SLOT_INTENT, OFFER_SLOTS_INTENT, REBOOK_INTENT};

    struct ScriptedLlm {
        reply: Result<String, String>,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedLlm {
        fn replying(reply: &str) -> Self {
            Self { reply: Ok(reply.to_string()), prompts: Mutex::new(Vec::new()) }
        }

        fn failing(error: &str) -> Self {
            Self { reply: Err(error.to_string()), prompts: Mutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn complete(&self, _system: &str, user: &str) -> Result<String, LlmError> {
            if let Ok(mut prompts) = self.prompts.lock() {
                prompts.push(user.to_string());
            }
            self.reply.clone().map_err(LlmError::Transport)
        }

        fn provider_name(&self) -> &str {
            "scripted"
        }

        fn model_name(&self) -> &str {
            "scripted-1"
        }
    }

    fn request(message: &str) -> ClassifyRequest<'_> {
        ClassifyRequest { correlation_id: "req-1", customer_id: "123", message }
    }

    #[tokio::test]
    async fn keyword_rules_cover_the_rebooking_flows() -> Result<(), ClassifierError> {
        let classifier = KeywordIntentClassifier;

        let rebook = classifier.classify(request("I missed my appointment, can I rebook?")).await?;
        assert_eq!(rebook.intent, REBOOK_INTENT);
        assert_eq!(rebook.decision_type, DecisionType::Automate);
        assert!((rebook.confidence - 0.9).abs() < f64::EPSILON);

        let offer = classifier
            .classify(request("I missed my appointment. What options are available?"))
            .await?;
        assert_eq!(offer.intent, OFFER_SLOTS_INTENT);

        let confirm = classifier.classify(request("Please book slot_004 for me")).await?;
        assert_eq!(confirm.intent, CONFIRM_SLOT_INTENT);
        assert_eq!(confirm.facts.get("selected_slot_id"), Some(&json!("slot_004")));

        let acknowledge = classifier.classify(request("Sorry, I missed yesterday")).await?;
        assert_eq!(acknowledge.intent, ACKNOWLEDGE_MISSED_INTENT);
        assert_eq!(acknowledge.decision_type, DecisionType::Clarify);
        Ok(())
    }

    #[tokio::test]
    async fn unmatched_messages_get_low_confidence() -> Result<(), ClassifierError> {
        let classifier = KeywordIntentClassifier;

        let cancel = classifier.classify(request("Please cancel my booking")).await?;
        assert_eq!(cancel.intent, CANCEL_INTENT);
        assert_eq!(cancel.decision_type, DecisionType::Escalate);

        let unknown = classifier.classify(request("What is the weather today")).await?;
        assert_eq!(unknown.intent, UNKNOWN_INTENT);
        assert!(unknown.confidence < 0.5);
        assert!(!unknown.goal.is_empty());
        Ok(())
    }

    #[test]
    fn slot_mentions_are_normalised() {
        assert_eq!(mentioned_slot_id("slot 3 please"), Some("slot_003".to_string()));
        assert_eq!(mentioned_slot_id("I'll take Slot_002."), Some("slot_002".to_string()));
        assert_eq!(mentioned_slot_id("the slot machine is loud"), None);
        assert_eq!(mentioned_slot_id("no slots here"), None);
    }

    #[tokio::test]
    async fn reasoning_classifier_decodes_fenced_answers() -> Result<(), ClassifierError> {
        let reply = "Sure!\n```json\n{\"intent\": \"missed_appointment_rebook\", \"goal\": \"rebook\", \
                     \"decision\": \"automate\", \"decision_type\": \"AUTOMATE\", \"reasoning\": \"eligible\", \
                     \"recommended_action\": \"rebook_appointment\", \"confidence\": 0.8}\n```";
        let client = ScriptedLlm::replying(reply);
        let classifier = ReasoningIntentClassifier::new(
            client,
            ResponseDecoder::default(),
            vec![REBOOK_INTENT.to_string()],
        );

        let classification = classifier.classify(request("missed it, rebook me")).await?;

        assert_eq!(classification.intent, REBOOK_INTENT);
        assert_eq!(classification.decision_type, DecisionType::Automate);
        let prompts = classifier.client.prompts.lock().map(|p| p.clone()).unwrap_or_default();
        assert!(prompts.first().is_some_and(|prompt| prompt.contains(REBOOK_INTENT)));
        Ok(())
    }

    #[tokio::test]
    async fn reasoning_classifier_reports_typed_failures() {
        let garbled = ReasoningIntentClassifier::new(
            ScriptedLlm::replying("{\"intent\": \"x\"}"),
            ResponseDecoder::default(),
            Vec::new(),
        );
        match garbled.classify(request("hello")).await {
            Err(ClassifierError::Decode(failure)) => {
                assert_eq!(failure.invalid_field(), Some("goal"));
            }
            other => panic!("expected decode failure, got {other:?}"),
        }

        let offline = ReasoningIntentClassifier::new(
            ScriptedLlm::failing("connection refused"),
            ResponseDecoder::default(),
            Vec::new(),
        );
        assert!(matches!(
            offline.classify(request("hello")).await,
            Err(ClassifierError::Unavailable(message)) if message.contains("connection refused")
        ));
    }
}
