//! Built-in cross-hub workflow templates.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::json;

use hubflow_core::HubId;

use crate::condition::{Condition, ConditionOperator};
use crate::model::{Action, WorkflowContext};

/// Which context entity a template action operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetRef {
    Lead,
    Property,
    Deal,
}

impl TargetRef {
    fn resolve(self, context: &WorkflowContext) -> String {
        let id = match self {
            TargetRef::Lead => context.lead_id.as_deref(),
            TargetRef::Property => context.property_id.as_deref(),
            TargetRef::Deal => context.deal_id.as_deref(),
        };
        id.unwrap_or("unassigned").to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateStep {
    pub id: String,
    pub hub: HubId,
    pub action_type: String,
    pub target: TargetRef,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub condition: Option<Condition>,
}

impl TemplateStep {
    fn new(id: &str, hub: HubId, action_type: &str, target: TargetRef) -> Self {
        Self {
            id: id.to_string(),
            hub,
            action_type: action_type.to_string(),
            target,
            parameters: BTreeMap::new(),
            depends_on: Vec::new(),
            condition: None,
        }
    }

    fn param(mut self, key: &str, value: serde_json::Value) -> Self {
        self.parameters.insert(key.to_string(), value);
        self
    }

    fn after(mut self, deps: &[&str]) -> Self {
        self.depends_on.extend(deps.iter().map(|d| d.to_string()));
        self
    }

    fn when(mut self, condition: Condition) -> Self {
        if !self.depends_on.iter().any(|d| d == condition.source.as_str()) {
            self.depends_on.push(condition.source.to_string());
        }
        self.condition = Some(condition);
        self
    }
}

/// `field` of `source`'s result strictly above `threshold`.
fn above(source: &str, field: &str, threshold: serde_json::Value) -> Condition {
    Condition::new(source, field, ConditionOperator::GreaterThan, threshold)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub id: String,
    pub name: String,
    pub description: String,
    pub category: String,
    pub steps: Vec<TemplateStep>,
}

impl WorkflowTemplate {
    /// Concrete actions with targets bound to the context's entity ids.
    pub fn instantiate(&self, context: &WorkflowContext) -> Vec<Action> {
        self.steps
            .iter()
            .map(|step| {
                let mut action = Action::new(
                    step.id.as_str(),
                    step.hub.clone(),
                    step.action_type.as_str(),
                    step.target.resolve(context),
                );
                action.parameters = step.parameters.clone();
                action.depends_on = step.depends_on.iter().map(|d| d.as_str().into()).collect();
                action.condition = step.condition.clone();
                action
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct TemplateLibrary {
    templates: Vec<WorkflowTemplate>,
}

impl TemplateLibrary {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn standard() -> Self {
        Self {
            templates: vec![lead_qualification(), property_matching(), client_nurture()],
        }
    }

    pub fn add(&mut self, template: WorkflowTemplate) {
        self.templates.retain(|t| t.id != template.id);
        self.templates.push(template);
    }

    pub fn get(&self, id: &str) -> Option<&WorkflowTemplate> {
        self.templates.iter().find(|t| t.id == id)
    }

    pub fn list(&self, category: Option<&str>) -> Vec<&WorkflowTemplate> {
        self.templates
            .iter()
            .filter(|t| category.is_none_or(|c| t.category == c))
            .collect()
    }
}

fn lead_qualification() -> WorkflowTemplate {
    use TargetRef::Lead;
    let hot = above("score_lead", "lead_score", json!(70));
    WorkflowTemplate {
        id: "lead_qualification_basic".into(),
        name: "AI Lead Qualification".into(),
        description: "Score a new lead, escalate hot leads or follow up the rest, then sync the CRM record"
            .into(),
        category: "lead_management".into(),
        steps: vec![
            TemplateStep::new("score_lead", HubId::lead_intelligence(), "score_lead", Lead),
            TemplateStep::new("high_priority_action", HubId::executive(), "notification", Lead)
                .param("priority", json!("high"))
                .when(hot.clone()),
            TemplateStep::new("standard_followup", HubId::sales_copilot(), "email_send", Lead)
                .param("template", json!("standard_followup"))
                .when(hot.otherwise()),
            TemplateStep::new("update_crm", HubId::automation_studio(), "crm_update", Lead)
                .after(&["high_priority_action", "standard_followup"]),
        ],
    }
}

fn property_matching() -> WorkflowTemplate {
    use TargetRef::{Lead, Property};
    let strong = above("find_matches", "match_score", json!(0.8));
    WorkflowTemplate {
        id: "property_matching_advanced".into(),
        name: "AI Property Matching".into(),
        description: "Analyze buyer preferences and send premium or standard property matches".into(),
        category: "property_management".into(),
        steps: vec![
            TemplateStep::new("analyze_preferences", HubId::lead_intelligence(), "analyze_preferences", Lead),
            TemplateStep::new("find_matches", HubId::sales_copilot(), "property_match", Property)
                .param("max_results", json!(10))
                .after(&["analyze_preferences"]),
            TemplateStep::new("send_premium_matches", HubId::sales_copilot(), "email_send", Lead)
                .param("template", json!("premium_matches"))
                .when(strong.clone()),
            TemplateStep::new("send_standard_matches", HubId::automation_studio(), "email_send", Lead)
                .param("template", json!("standard_matches"))
                .when(strong.otherwise()),
        ],
    }
}

fn client_nurture() -> WorkflowTemplate {
    use TargetRef::Lead;
    let engaged = above("measure_engagement", "engagement_score", json!(50));
    WorkflowTemplate {
        id: "client_nurture_sequence".into(),
        name: "30-Day Client Nurture".into(),
        description: "Welcome, market report and engagement-driven follow-up".into(),
        category: "client_engagement".into(),
        steps: vec![
            TemplateStep::new("welcome_email", HubId::automation_studio(), "email_send", Lead)
                .param("template", json!("welcome")),
            TemplateStep::new("market_analysis", HubId::ops_optimization(), "market_report", Lead),
            TemplateStep::new("measure_engagement", HubId::lead_intelligence(), "engagement_score", Lead)
                .after(&["welcome_email", "market_analysis"]),
            TemplateStep::new("high_engagement_path", HubId::sales_copilot(), "personal_checkin", Lead)
                .when(engaged.clone()),
            TemplateStep::new("re_engagement_path", HubId::automation_studio(), "email_send", Lead)
                .param("template", json!("re_engagement"))
                .when(engaged.otherwise()),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph;

    #[test]
    fn standard_templates_are_valid_dags() {
        let library = TemplateLibrary::standard();
        let context = WorkflowContext::new("u", "s", HubId::executive()).with_lead("lead_7");
        for template in library.list(None) {
            let actions = template.instantiate(&context);
            assert!(graph::validate(&actions).is_ok(), "{} is not a DAG", template.id);
        }
        assert_eq!(library.list(None).len(), 3);
    }

    #[test]
    fn instantiation_binds_context_targets() {
        let library = TemplateLibrary::standard();
        let context = WorkflowContext::new("u", "s", HubId::executive()).with_lead("lead_7");
        let actions = library
            .get("lead_qualification_basic")
            .unwrap()
            .instantiate(&context);
        assert!(actions.iter().all(|a| a.target == "lead_7"));
    }

    #[test]
    fn branch_steps_are_complementary() {
        let library = TemplateLibrary::standard();
        let context = WorkflowContext::new("u", "s", HubId::executive()).with_lead("lead_7");
        let actions = library
            .get("lead_qualification_basic")
            .unwrap()
            .instantiate(&context);
        let guard = |id: &str| {
            actions
                .iter()
                .find(|a| a.id.as_str() == id)
                .and_then(|a| a.condition.clone())
                .unwrap()
        };
        let high = guard("high_priority_action");
        let low = guard("standard_followup");
        for score in [30, 85] {
            let result = json!({ "lead_score": score });
            assert_ne!(high.holds(Some(&result)), low.holds(Some(&result)));
        }
        assert!(actions.iter().all(|a| a.action_type != "condition_check"));
    }

    #[test]
    fn list_filters_by_category() {
        let library = TemplateLibrary::standard();
        let found = library.list(Some("client_engagement"));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "client_nurture_sequence");
    }
}
