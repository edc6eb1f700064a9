//! Field validation ahead of propagation.
//!
//! Three tiers, selected by the event's `IntegrityLevel`:
//!
//! - **Basic**: type/format checks per field (email, phone, numbers, enums)
//! - **Business**: entity-specific rules (lead score 0-100, known deal stages)
//! - **Strict**: referential checks; `<kind>_id` fields must name an entity
//!   some hub already holds
//!
//! Every failing field is reported, not just the first.

use std::collections::BTreeMap;

use serde_json::Value as JsonValue;

use hubflow_core::{ChangeEvent, ChangeKind, EntityKey, EntityType, IntegrityLevel};

use crate::error::{FieldError, ValidationFailed};

/// Existence check used by referential validation.
pub trait ReferenceLookup: Send + Sync {
    fn exists(&self, key: &EntityKey) -> bool;
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldRule {
    Email,
    Phone,
    Number,
    /// Inclusive numeric range; either bound may be open.
    Range { min: Option<f64>, max: Option<f64> },
    NonEmpty,
    OneOf(Vec<String>),
}

impl FieldRule {
    pub fn at_least(min: f64) -> Self {
        FieldRule::Range {
            min: Some(min),
            max: None,
        }
    }

    pub fn between(min: f64, max: f64) -> Self {
        FieldRule::Range {
            min: Some(min),
            max: Some(max),
        }
    }

    pub fn one_of(values: &[&str]) -> Self {
        FieldRule::OneOf(values.iter().map(|v| v.to_string()).collect())
    }

    fn check(&self, field: &str, value: &JsonValue) -> Option<FieldError> {
        // Null clears a field; only `NonEmpty` forbids that.
        if value.is_null() {
            return match self {
                FieldRule::NonEmpty => Some(FieldError::new(field, "empty", "value must not be empty")),
                _ => None,
            };
        }

        match self {
            FieldRule::Email => match value.as_str() {
                Some(s) if is_email(s) => None,
                _ => Some(FieldError::new(field, "invalid_email", format!("'{}' is not a valid email address", display(value)))),
            },
            FieldRule::Phone => match value.as_str() {
                Some(s) if is_phone(s) => None,
                _ => Some(FieldError::new(field, "invalid_phone", format!("'{}' is not a valid phone number", display(value)))),
            },
            FieldRule::Number => match value.as_f64() {
                Some(_) => None,
                None => Some(FieldError::new(field, "not_a_number", "value must be numeric")),
            },
            FieldRule::Range { min, max } => {
                let Some(n) = value.as_f64() else {
                    return Some(FieldError::new(field, "not_a_number", "value must be numeric"));
                };
                let below = min.is_some_and(|m| n < m);
                let above = max.is_some_and(|m| n > m);
                (below || above).then(|| {
                    FieldError::new(
                        field,
                        "out_of_range",
                        format!("{n} is outside [{}, {}]", bound(*min), bound(*max)),
                    )
                })
            }
            FieldRule::NonEmpty => {
                let empty = match value {
                    JsonValue::String(s) => s.trim().is_empty(),
                    JsonValue::Array(a) => a.is_empty(),
                    JsonValue::Object(o) => o.is_empty(),
                    _ => false,
                };
                empty.then(|| FieldError::new(field, "empty", "value must not be empty"))
            }
            FieldRule::OneOf(allowed) => match value.as_str() {
                Some(s) if allowed.iter().any(|a| a == s) => None,
                _ => Some(FieldError::new(
                    field,
                    "unknown_value",
                    format!("'{}' is not one of {}", display(value), allowed.join(", ")),
                )),
            },
        }
    }
}

fn display(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn bound(b: Option<f64>) -> String {
    b.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

fn is_email(s: &str) -> bool {
    if s.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = s.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && domain.split('.').all(|label| !label.is_empty())
}

fn is_phone(s: &str) -> bool {
    let allowed = s
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | '(' | ')' | ' ' | '.'));
    let digits = s.chars().filter(char::is_ascii_digit).count();
    allowed && (7..=15).contains(&digits)
}

type RuleTable = BTreeMap<String, FieldRule>;

#[derive(Debug, Clone, Default)]
pub struct DataValidator {
    /// Format rules applying to every entity type.
    common: RuleTable,
    format: BTreeMap<EntityType, RuleTable>,
    business: BTreeMap<EntityType, RuleTable>,
}

impl DataValidator {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Rules for the CRM entity kinds the hubs exchange.
    pub fn standard() -> Self {
        use EntityType::{Agent, Contact, Deal, Lead, Property};

        Self::default()
            .common_rule("email", FieldRule::Email)
            .common_rule("phone", FieldRule::Phone)
            .format_rule(Lead, "lead_score", FieldRule::Number)
            .format_rule(Lead, "name", FieldRule::NonEmpty)
            .format_rule(
                Lead,
                "status",
                FieldRule::one_of(&["new", "contacted", "qualified", "nurturing", "converted", "lost"]),
            )
            .format_rule(Contact, "name", FieldRule::NonEmpty)
            .format_rule(Deal, "value", FieldRule::Number)
            .format_rule(Property, "price", FieldRule::Number)
            .format_rule(Property, "bedrooms", FieldRule::Number)
            .format_rule(Agent, "name", FieldRule::NonEmpty)
            .business_rule(Lead, "lead_score", FieldRule::between(0.0, 100.0))
            .business_rule(Deal, "value", FieldRule::at_least(0.0))
            .business_rule(
                Deal,
                "stage",
                FieldRule::one_of(&[
                    "prospecting",
                    "qualification",
                    "proposal",
                    "negotiation",
                    "closed_won",
                    "closed_lost",
                ]),
            )
            .business_rule(Property, "price", FieldRule::at_least(0.0))
            .business_rule(Property, "bedrooms", FieldRule::between(0.0, 50.0))
            .business_rule(Agent, "commission_rate", FieldRule::between(0.0, 1.0))
    }

    pub fn common_rule(mut self, field: &str, rule: FieldRule) -> Self {
        self.common.insert(field.to_string(), rule);
        self
    }

    pub fn format_rule(mut self, entity: EntityType, field: &str, rule: FieldRule) -> Self {
        self.format.entry(entity).or_default().insert(field.to_string(), rule);
        self
    }

    pub fn business_rule(mut self, entity: EntityType, field: &str, rule: FieldRule) -> Self {
        self.business.entry(entity).or_default().insert(field.to_string(), rule);
        self
    }

    /// Validate `event` at its own integrity level.
    ///
    /// Referential checks only run when `references` is given.
    pub fn validate(
        &self,
        event: &ChangeEvent,
        references: Option<&dyn ReferenceLookup>,
    ) -> Result<(), ValidationFailed> {
        let mut errors = Vec::new();

        if event.entity_id.trim().is_empty() {
            errors.push(FieldError::new("entity_id", "empty", "entity id must not be empty"));
        }
        if event.kind != ChangeKind::Delete && event.fields.is_empty() {
            errors.push(FieldError::new("fields", "empty", "change carries no fields"));
        }

        let format = self.format.get(&event.entity_type);
        let business = self.business.get(&event.entity_type);

        for (field, change) in &event.fields {
            let value = &change.new;
            let format_rule = format.and_then(|t| t.get(field)).or_else(|| self.common.get(field));
            if let Some(error) = format_rule.and_then(|r| r.check(field, value)) {
                errors.push(error);
                continue;
            }

            if event.integrity >= IntegrityLevel::Business {
                if let Some(error) = business.and_then(|t| t.get(field)).and_then(|r| r.check(field, value)) {
                    errors.push(error);
                    continue;
                }
            }

            if event.integrity >= IntegrityLevel::Strict {
                if let Some(refs) = references {
                    if let Some(error) = check_reference(field, value, refs) {
                        errors.push(error);
                    }
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationFailed { errors })
        }
    }
}

fn check_reference(field: &str, value: &JsonValue, refs: &dyn ReferenceLookup) -> Option<FieldError> {
    let entity_type = EntityType::referenced_by(field)?;
    let id = value.as_str()?;
    let key = EntityKey::new(entity_type, id);
    (!refs.exists(&key)).then(|| {
        FieldError::new(field, "missing_reference", format!("{key} does not exist in any hub"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use hubflow_core::HubId;
    use serde_json::json;
    use std::collections::BTreeSet;

    struct Known(BTreeSet<EntityKey>);

    impl ReferenceLookup for Known {
        fn exists(&self, key: &EntityKey) -> bool {
            self.0.contains(key)
        }
    }

    fn lead(field: &str, value: JsonValue) -> ChangeEvent {
        ChangeEvent::update(HubId::lead_intelligence(), EntityType::Lead, "lead_42", "agent_1")
            .set(field, value)
    }

    #[test]
    fn email_format_is_checked() {
        let v = DataValidator::standard();
        let err = v.validate(&lead("email", json!("not-an-email")), None).unwrap_err();
        assert_eq!(err.errors.len(), 1);
        assert_eq!(err.errors[0].code, "invalid_email");
        assert!(v.validate(&lead("email", json!("jane@example.com")), None).is_ok());
        assert!(v.validate(&lead("email", json!("a@b")), None).is_err());
        assert!(v.validate(&lead("email", json!("a b@c.com")), None).is_err());
    }

    #[test]
    fn phone_and_null_values() {
        let v = DataValidator::standard();
        assert!(v.validate(&lead("phone", json!("+1 (555) 010-2030")), None).is_ok());
        assert!(v.validate(&lead("phone", json!("12")), None).is_err());
        assert!(v.validate(&lead("phone", JsonValue::Null), None).is_ok());
        assert!(v.validate(&lead("name", JsonValue::Null), None).is_err());
    }

    #[test]
    fn business_rules_depend_on_integrity_level() {
        let v = DataValidator::standard();
        let high = lead("lead_score", json!(140));
        assert!(v.validate(&high, None).is_err());
        let basic = high.clone().with_integrity(IntegrityLevel::Basic);
        assert!(v.validate(&basic, None).is_ok());
        assert!(v.validate(&lead("lead_score", json!("high")), None).is_err());
    }

    #[test]
    fn deal_rules() {
        let v = DataValidator::standard();
        let deal = ChangeEvent::update(HubId::sales_copilot(), EntityType::Deal, "d1", "u")
            .set("value", json!(-5))
            .set("stage", json!("dreaming"));
        let err = v.validate(&deal, None).unwrap_err();
        let fields: Vec<_> = err.errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["stage", "value"]);
    }

    #[test]
    fn strict_level_checks_references() {
        let v = DataValidator::standard();
        let known = Known([EntityKey::new(EntityType::Lead, "lead_1")].into_iter().collect());
        let deal = |lead_id: &str| {
            ChangeEvent::update(HubId::sales_copilot(), EntityType::Deal, "d1", "u")
                .set("lead_id", json!(lead_id))
                .with_integrity(IntegrityLevel::Strict)
        };
        assert!(v.validate(&deal("lead_1"), Some(&known)).is_ok());
        let err = v.validate(&deal("lead_9"), Some(&known)).unwrap_err();
        assert_eq!(err.errors[0].code, "missing_reference");
        // Business level ignores references.
        let relaxed = deal("lead_9").with_integrity(IntegrityLevel::Business);
        assert!(v.validate(&relaxed, Some(&known)).is_ok());
    }

    #[test]
    fn empty_update_is_rejected_but_delete_is_not() {
        let v = DataValidator::standard();
        let empty = ChangeEvent::update(HubId::executive(), EntityType::Lead, "l1", "u");
        assert!(v.validate(&empty, None).is_err());
        let delete = ChangeEvent::delete(HubId::executive(), EntityType::Lead, "l1", "u");
        assert!(v.validate(&delete, None).is_ok());
    }
}
