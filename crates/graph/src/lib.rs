//! Labeled-property graph store mirroring the entity read model.
//!
//! Nodes are keyed by `(id, tenant_id)`; relationships carry confidence and
//! provenance annotations. The `GraphStore` trait abstracts the database so
//! projections and similarity services run identically against Neo4j and
//! the in-memory implementation used by tests.

pub mod in_memory;
pub mod neo4j;
pub mod store;

pub use in_memory::InMemoryGraphStore;
pub use neo4j::Neo4jGraphStore;
pub use store::{
    EntityNode, GraphError, GraphRelationship, GraphStore, MergeSyncReport, sanitize_rel_type,
};
