//! Prompt and output-schema generation from a domain schema.
//!
//! The generator is pure: the same schema always produces the same prompt
//! and the same JSON schema, so job snapshots stay reproducible.

use serde_json::{Value as JsonValue, json};

use super::schema::DomainSchema;

/// Builds system prompts and schema-constrained output descriptions.
#[derive(Debug, Clone, Default)]
pub struct DomainPromptGenerator;

impl DomainPromptGenerator {
    pub fn new() -> Self {
        Self
    }

    /// Build the extraction system prompt for a domain.
    pub fn system_prompt(&self, schema: &DomainSchema) -> String {
        let mut prompt = String::new();

        prompt.push_str(&format!(
            "You are an expert knowledge extractor for the domain \"{}\" ({}).\n\n",
            schema.display_name, schema.description
        ));

        prompt.push_str("Extract entities of ONLY these types:\n");
        for entity_type in &schema.entity_types {
            prompt.push_str(&format!(
                "- {} ({})",
                entity_type.id, entity_type.display_name
            ));
            if let Some(description) = &entity_type.description {
                prompt.push_str(&format!(": {description}"));
            }
            if !entity_type.property_hints.is_empty() {
                prompt.push_str(&format!(
                    " [properties: {}]",
                    entity_type.property_hints.join(", ")
                ));
            }
            prompt.push('\n');
        }

        prompt.push_str("\nExtract relationships of ONLY these types:\n");
        for rel in &schema.relationship_types {
            prompt.push_str(&format!(
                "- {} ({}): {} -> {}\n",
                rel.id,
                rel.display_name,
                rel.source_types.join("|"),
                rel.target_types.join("|"),
            ));
        }

        prompt.push_str(&format!(
            "\nOnly report entities with confidence >= {:.2} and relationships with confidence >= {:.2}.\n",
            schema.confidence_thresholds.entity_extraction,
            schema.confidence_thresholds.relationship_extraction,
        ));

        prompt.push_str(
            "\nRespond with ONLY a JSON object of the form \
             {\"entities\": [...], \"relationships\": [...]} and no other text.",
        );

        prompt
    }

    /// Build the JSON output schema for providers that support
    /// schema-constrained decoding.
    pub fn output_schema(&self, schema: &DomainSchema) -> JsonValue {
        let entity_type_ids: Vec<&str> =
            schema.entity_types.iter().map(|t| t.id.as_str()).collect();
        let relationship_type_ids: Vec<&str> = schema
            .relationship_types
            .iter()
            .map(|t| t.id.as_str())
            .collect();

        json!({
            "type": "object",
            "properties": {
                "entities": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "name": { "type": "string" },
                            "entity_type": { "type": "string", "enum": entity_type_ids },
                            "description": { "type": "string" },
                            "properties": { "type": "object" },
                            "confidence": { "type": "number", "minimum": 0.0, "maximum": 1.0 }
                        },
                        "required": ["name", "entity_type", "confidence"]
                    }
                },
                "relationships": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "source_entity": { "type": "string" },
                            "target_entity": { "type": "string" },
                            "relationship_type": { "type": "string", "enum": relationship_type_ids },
                            "confidence": { "type": "number", "minimum": 0.0, "maximum": 1.0 },
                            "context": { "type": "string" }
                        },
                        "required": ["source_entity", "target_entity", "relationship_type", "confidence"]
                    }
                }
            },
            "required": ["entities", "relationships"]
        })
    }
}
