//! Domain schema model (deserialized from declarative YAML files).

use serde::{Deserialize, Serialize};

/// An entity type a domain can extract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityTypeDef {
    /// Stable id, e.g. "person" or "function".
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Hints for free-form properties the extractor should look for.
    #[serde(default)]
    pub property_hints: Vec<String>,
}

/// A relationship type with its allowed endpoint type pairs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipTypeDef {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Allowed source entity type ids.
    pub source_types: Vec<String>,
    /// Allowed target entity type ids.
    pub target_types: Vec<String>,
}

/// Minimum confidences the extractor should honor for this domain.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceThresholds {
    pub entity_extraction: f64,
    pub relationship_extraction: f64,
}

impl Default for ConfidenceThresholds {
    fn default() -> Self {
        Self {
            entity_extraction: 0.5,
            relationship_extraction: 0.5,
        }
    }
}

/// One declarative domain schema (one file in the registry directory).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainSchema {
    /// Case-insensitive, whitespace-trimmed id; normalized on load.
    pub domain_id: String,
    pub display_name: String,
    pub version: u32,
    pub description: String,
    pub entity_types: Vec<EntityTypeDef>,
    pub relationship_types: Vec<RelationshipTypeDef>,
    #[serde(default)]
    pub confidence_thresholds: ConfidenceThresholds,
}

impl DomainSchema {
    /// Whether this domain extracts the given entity type.
    pub fn supports_entity_type(&self, entity_type: &str) -> bool {
        let wanted = entity_type.trim().to_lowercase();
        self.entity_types.iter().any(|t| t.id == wanted)
    }

    pub fn summary(&self) -> DomainSummary {
        DomainSummary {
            domain_id: self.domain_id.clone(),
            display_name: self.display_name.clone(),
            description: self.description.clone(),
            version: self.version,
        }
    }
}

/// Listing row for a registered domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainSummary {
    pub domain_id: String,
    pub display_name: String,
    pub description: String,
    pub version: u32,
}

/// Alternative the classifier considered (preserved when the floor demotes
/// the original pick).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainAlternative {
    pub domain: String,
    pub confidence: f64,
}

/// Outcome of content classification. Never an error: failures collapse to
/// the fallback domain with confidence 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub domain: String,
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub alternatives: Vec<DomainAlternative>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supports_entity_type_is_case_insensitive() {
        let schema = DomainSchema {
            domain_id: "software_docs".to_string(),
            display_name: "Software Documentation".to_string(),
            version: 1,
            description: "API docs".to_string(),
            entity_types: vec![EntityTypeDef {
                id: "function".to_string(),
                display_name: "Function".to_string(),
                description: None,
                property_hints: vec![],
            }],
            relationship_types: vec![],
            confidence_thresholds: ConfidenceThresholds::default(),
        };

        assert!(schema.supports_entity_type("FUNCTION"));
        assert!(schema.supports_entity_type(" function "));
        assert!(!schema.supports_entity_type("class"));
    }
}
