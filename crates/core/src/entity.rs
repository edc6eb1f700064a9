//! Business entity addressing.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Kind of business entity a change event refers to.
///
/// Known kinds get their own variant so validation and business rules can
/// dispatch on the tag; anything else travels as `Other`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Lead,
    Deal,
    Property,
    Agent,
    Contact,
    Other(String),
}

impl EntityType {
    pub fn as_str(&self) -> &str {
        match self {
            EntityType::Lead => "lead",
            EntityType::Deal => "deal",
            EntityType::Property => "property",
            EntityType::Agent => "agent",
            EntityType::Contact => "contact",
            EntityType::Other(name) => name,
        }
    }

    /// Entity type referenced by a `<kind>_id` field name, if any.
    pub fn referenced_by(field: &str) -> Option<EntityType> {
        let kind = field.strip_suffix("_id")?;
        match kind {
            "lead" => Some(EntityType::Lead),
            "deal" => Some(EntityType::Deal),
            "property" => Some(EntityType::Property),
            "agent" => Some(EntityType::Agent),
            "contact" => Some(EntityType::Contact),
            _ => None,
        }
    }
}

impl core::fmt::Display for EntityType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err(CoreError::invalid_entity("entity type must not be empty"));
        }
        Ok(match s {
            "lead" => EntityType::Lead,
            "deal" => EntityType::Deal,
            "property" => EntityType::Property,
            "agent" => EntityType::Agent,
            "contact" => EntityType::Contact,
            other => EntityType::Other(other.to_string()),
        })
    }
}

/// (entity type, entity id): the unit of conflict detection and locking.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    pub entity_type: EntityType,
    pub entity_id: String,
}

impl EntityKey {
    pub fn new(entity_type: EntityType, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
        }
    }
}

impl core::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.entity_id)
    }
}
