//! Domain schemas: declarative descriptions of what to extract per domain.

pub mod prompt;
pub mod registry;
pub mod schema;

pub use prompt::DomainPromptGenerator;
pub use registry::{DomainSchemaRegistry, SchemaLoadError};
pub use schema::{
    ClassificationResult, ConfidenceThresholds, DomainAlternative, DomainSchema, DomainSummary,
    EntityTypeDef, RelationshipTypeDef,
};
