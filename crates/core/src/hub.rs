//! Hub identity.
//!
//! A hub is an independently-owned subsystem. Hubs are open-ended: new hubs
//! register a handler at runtime, so `HubId` is a validated string rather
//! than a closed enum. The five hubs the product ships with have named
//! constructors.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

pub const EXECUTIVE: &str = "executive";
pub const LEAD_INTELLIGENCE: &str = "lead_intelligence";
pub const AUTOMATION_STUDIO: &str = "automation_studio";
pub const SALES_COPILOT: &str = "sales_copilot";
pub const OPS_OPTIMIZATION: &str = "ops_optimization";

/// Standard hubs, in default conflict tie-break order (earlier wins).
pub const STANDARD_HUBS: [&str; 5] = [
    EXECUTIVE,
    LEAD_INTELLIGENCE,
    SALES_COPILOT,
    AUTOMATION_STUDIO,
    OPS_OPTIMIZATION,
];

/// Identifier of a hub: lowercase ascii letters, digits and `_`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HubId(String);

impl HubId {
    pub fn new(name: impl Into<String>) -> Result<Self, CoreError> {
        let name = name.into();
        if name.is_empty() {
            return Err(CoreError::invalid_hub("hub id must not be empty"));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(CoreError::invalid_hub(format!(
                "{name}: only lowercase ascii, digits and '_' are allowed"
            )));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn executive() -> Self {
        Self(EXECUTIVE.to_string())
    }

    pub fn lead_intelligence() -> Self {
        Self(LEAD_INTELLIGENCE.to_string())
    }

    pub fn automation_studio() -> Self {
        Self(AUTOMATION_STUDIO.to_string())
    }

    pub fn sales_copilot() -> Self {
        Self(SALES_COPILOT.to_string())
    }

    pub fn ops_optimization() -> Self {
        Self(OPS_OPTIMIZATION.to_string())
    }

    /// The standard hubs in default tie-break order.
    pub fn standard() -> Vec<HubId> {
        STANDARD_HUBS.iter().map(|h| Self(h.to_string())).collect()
    }
}

impl core::fmt::Display for HubId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for HubId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for HubId {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<HubId> for String {
    fn from(value: HubId) -> Self {
        value.0
    }
}
