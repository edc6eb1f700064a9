//! Adapter turning an external insight/prediction service into a hub handler.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use thiserror::Error;
use tracing::debug;

use hubflow_core::{ChangeEvent, EntityType};

use crate::executor::{HandlerError, HubHandler};
use crate::model::{Action, ActionOutput, WorkflowContext};

/// Typed prediction; raw service text never reaches the workflow model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub value: JsonValue,
    /// 0.0 - 1.0
    pub confidence: f64,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InsightError {
    #[error("insight service unavailable: {0}")]
    Unavailable(String),
    #[error("insight service returned an unusable answer: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait InsightService: Send + Sync {
    async fn predict(&self, context: JsonValue) -> Result<Insight, InsightError>;
}

/// Hub handler that asks an `InsightService` for a prediction.
///
/// Recognized action parameters:
/// - `write_field`: write the predicted value into this field of the
///   context's lead and emit the change for synchronization
/// - `min_confidence`: reject predictions below this confidence
pub struct InsightHandler {
    service: Arc<dyn InsightService>,
}

impl InsightHandler {
    pub fn new(service: Arc<dyn InsightService>) -> Self {
        Self { service }
    }

    fn context_blob(action: &Action, context: &WorkflowContext) -> JsonValue {
        json!({
            "action_type": action.action_type,
            "target": action.target,
            "parameters": action.parameters,
            "user_id": context.user_id,
            "session_id": context.session_id,
            "lead_id": context.lead_id,
            "deal_id": context.deal_id,
            "property_id": context.property_id,
            "priority": context.priority,
        })
    }
}

#[async_trait]
impl HubHandler for InsightHandler {
    async fn handle(
        &self,
        action: &Action,
        context: &WorkflowContext,
    ) -> Result<ActionOutput, HandlerError> {
        let insight = self
            .service
            .predict(Self::context_blob(action, context))
            .await
            .map_err(|e| match e {
                InsightError::Unavailable(_) => HandlerError::transient(e.to_string()),
                InsightError::Malformed(_) => HandlerError::permanent(e.to_string()),
            })?;

        if let Some(min) = action.parameters.get("min_confidence").and_then(JsonValue::as_f64) {
            if insight.confidence < min {
                return Err(HandlerError::permanent(format!(
                    "confidence {:.2} below required {min:.2}",
                    insight.confidence
                )));
            }
        }
        debug!(action_id = %action.id, confidence = insight.confidence, "insight received");

        let mut output = ActionOutput::new(json!({
            "value": insight.value,
            "confidence": insight.confidence,
        }));

        let field = action.parameters.get("write_field").and_then(JsonValue::as_str);
        if let (Some(field), Some(lead_id)) = (field, context.lead_id.as_deref()) {
            let event = ChangeEvent::update(
                action.hub.clone(),
                EntityType::Lead,
                lead_id,
                context.user_id.as_str(),
            )
            .with_priority(context.priority)
            .set(field, insight.value);
            output = output.with_change(event);
        }

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hubflow_core::HubId;

    struct FixedService(Result<Insight, InsightError>);

    #[async_trait]
    impl InsightService for FixedService {
        async fn predict(&self, context: JsonValue) -> Result<Insight, InsightError> {
            assert!(context.get("lead_id").is_some());
            self.0.clone()
        }
    }

    fn handler(answer: Result<Insight, InsightError>) -> InsightHandler {
        InsightHandler::new(Arc::new(FixedService(answer)))
    }

    fn context() -> WorkflowContext {
        WorkflowContext::new("agent_1", "s", HubId::lead_intelligence()).with_lead("lead_42")
    }

    #[tokio::test]
    async fn prediction_is_written_back_as_change_event() {
        let h = handler(Ok(Insight { value: json!(87), confidence: 0.9 }));
        let action = Action::new("score", HubId::lead_intelligence(), "score_lead", "lead_42")
            .param("write_field", json!("lead_score"));
        let output = h.handle(&action, &context()).await.unwrap();

        assert_eq!(output.result["value"], 87);
        assert_eq!(output.change_events.len(), 1);
        let event = &output.change_events[0];
        assert_eq!(event.entity_id, "lead_42");
        assert_eq!(event.new_value("lead_score"), Some(&json!(87)));
    }

    #[tokio::test]
    async fn low_confidence_is_a_permanent_failure() {
        let h = handler(Ok(Insight { value: json!("buy"), confidence: 0.3 }));
        let action = Action::new("rec", HubId::lead_intelligence(), "recommend", "lead_42")
            .param("min_confidence", json!(0.5));
        let err = h.handle(&action, &context()).await.unwrap_err();
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn unavailable_service_is_transient() {
        let h = handler(Err(InsightError::Unavailable("503".into())));
        let action = Action::new("rec", HubId::lead_intelligence(), "recommend", "lead_42");
        let err = h.handle(&action, &context()).await.unwrap_err();
        assert!(!err.is_permanent());
    }
}
