//! Default hub handlers.
//!
//! Each standard hub's real integration lives out of process. The node
//! registers an acknowledging handler per hub: it records the action and, if
//! the action carries a `changes` object, emits a change event for the
//! targeted entity so the synchronizer can propagate it.

use serde_json::json;
use tracing::info;

use hubflow_core::{ChangeEvent, EntityType, HubId};
use hubflow_workflow::{Action, ActionOutput, FnHandler, HandlerError, HubHandler, WorkflowContext};

/// Parameter holding `{field: new_value}` pairs to emit as a change event.
pub const CHANGES_PARAM: &str = "changes";
/// Optional entity type of the change (default `lead`).
pub const ENTITY_TYPE_PARAM: &str = "entity_type";
/// Optional entity id; falls back to the context id for the entity type.
pub const ENTITY_ID_PARAM: &str = "entity_id";

pub fn acknowledging(hub: HubId) -> impl HubHandler {
    let compensating_hub = hub.clone();
    FnHandler::new(move |action: Action, context: WorkflowContext| {
        let hub = hub.clone();
        async move {
            info!(
                hub = %hub,
                action_id = %action.id,
                action_type = %action.action_type,
                target = %action.target,
                "action acknowledged"
            );
            let output = ActionOutput::new(json!({
                "hub": hub.as_str(),
                "action_type": action.action_type,
                "target": action.target,
                "status": "acknowledged",
            }));
            match change_for(&hub, &action, &context) {
                Ok(Some(event)) => Ok(output.with_change(event)),
                Ok(None) => Ok(output),
                Err(e) => Err(e),
            }
        }
    })
    .on_compensate(move |action: Action, _context: WorkflowContext| {
        let hub = compensating_hub.clone();
        async move {
            info!(hub = %hub, action_id = %action.id, "action compensated");
            Ok::<(), HandlerError>(())
        }
    })
}

fn change_for(
    hub: &HubId,
    action: &Action,
    context: &WorkflowContext,
) -> Result<Option<ChangeEvent>, HandlerError> {
    let Some(changes) = action.parameters.get(CHANGES_PARAM) else {
        return Ok(None);
    };
    let fields = changes
        .as_object()
        .ok_or_else(|| HandlerError::permanent(format!("'{CHANGES_PARAM}' must be an object")))?;

    let entity_type = match action.parameters.get(ENTITY_TYPE_PARAM).and_then(|v| v.as_str()) {
        Some(raw) => raw
            .parse::<EntityType>()
            .map_err(|e| HandlerError::permanent(e.to_string()))?,
        None => EntityType::Lead,
    };
    let from_context = match entity_type {
        EntityType::Lead => context.lead_id.clone(),
        EntityType::Deal => context.deal_id.clone(),
        EntityType::Property => context.property_id.clone(),
        _ => None,
    };
    let entity_id = action
        .parameters
        .get(ENTITY_ID_PARAM)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .or(from_context)
        .ok_or_else(|| HandlerError::permanent("no entity id for change"))?;

    let event = fields.iter().fold(
        ChangeEvent::update(hub.clone(), entity_type, entity_id, context.user_id.clone())
            .with_priority(context.priority),
        |event, (field, value)| event.set(field.clone(), value.clone()),
    );
    Ok(Some(event))
}
