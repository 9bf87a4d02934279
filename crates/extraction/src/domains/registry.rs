//! Domain schema registry.
//!
//! Loads every `*.yaml`/`*.yml` file in a directory at startup. After load
//! the registry is read-only; the optional hot-reload mode (development
//! only) re-reads the directory on every access. Constructed once at
//! process startup and passed explicitly into the components that need it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tracing::{info, warn};

use super::schema::{DomainSchema, DomainSummary};

/// Fallback domain used when no domain is configured or classification
/// fails.
pub const DEFAULT_FALLBACK_DOMAIN: &str = "encyclopedia_wiki";

#[derive(Debug, Error)]
pub enum SchemaLoadError {
    #[error("schema directory {0} is not readable: {1}")]
    Directory(PathBuf, String),

    #[error("schema file {0} could not be read: {1}")]
    Io(PathBuf, String),

    #[error("schema file {0} is not valid: {1}")]
    Parse(PathBuf, String),

    #[error("duplicate domain id '{0}' (from {1})")]
    Duplicate(String, PathBuf),

    #[error("unknown domain '{0}'")]
    UnknownDomain(String),
}

/// Registry of loaded domain schemas.
pub struct DomainSchemaRegistry {
    schema_dir: PathBuf,
    schemas: RwLock<HashMap<String, Arc<DomainSchema>>>,
    hot_reload: bool,
}

impl std::fmt::Debug for DomainSchemaRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainSchemaRegistry")
            .field("schema_dir", &self.schema_dir)
            .field("hot_reload", &self.hot_reload)
            .field("domains", &self.len())
            .finish()
    }
}

impl DomainSchemaRegistry {
    /// Load all schemas from a directory.
    pub fn load(schema_dir: impl Into<PathBuf>) -> Result<Self, SchemaLoadError> {
        Self::load_with_options(schema_dir, false)
    }

    /// Load with hot reload enabled (re-reads the directory on every
    /// access; development only).
    pub fn load_with_options(
        schema_dir: impl Into<PathBuf>,
        hot_reload: bool,
    ) -> Result<Self, SchemaLoadError> {
        let schema_dir = schema_dir.into();
        if hot_reload {
            warn!("domain schema hot reload is enabled; use only in development");
        }

        let schemas = load_directory(&schema_dir)?;
        info!(domains = schemas.len(), dir = %schema_dir.display(), "domain schemas loaded");

        Ok(Self {
            schema_dir,
            schemas: RwLock::new(schemas),
            hot_reload,
        })
    }

    /// Construct from in-memory schemas (tests).
    pub fn from_schemas(schemas: Vec<DomainSchema>) -> Self {
        let map = schemas
            .into_iter()
            .map(|mut s| {
                s.domain_id = normalize_domain_id(&s.domain_id);
                (s.domain_id.clone(), Arc::new(s))
            })
            .collect();
        Self {
            schema_dir: PathBuf::new(),
            schemas: RwLock::new(map),
            hot_reload: false,
        }
    }

    /// Re-read every schema file (also used internally by hot reload).
    pub fn reload(&self) -> Result<usize, SchemaLoadError> {
        let fresh = load_directory(&self.schema_dir)?;
        let count = fresh.len();
        let mut guard = self.schemas.write().unwrap_or_else(|e| e.into_inner());
        *guard = fresh;
        Ok(count)
    }

    fn maybe_hot_reload(&self) {
        if self.hot_reload {
            if let Err(err) = self.reload() {
                warn!(error = %err, "hot reload failed, keeping previous schemas");
            }
        }
    }

    pub fn get_schema(&self, domain_id: &str) -> Result<Arc<DomainSchema>, SchemaLoadError> {
        self.get_schema_or_none(domain_id)
            .ok_or_else(|| SchemaLoadError::UnknownDomain(normalize_domain_id(domain_id)))
    }

    pub fn get_schema_or_none(&self, domain_id: &str) -> Option<Arc<DomainSchema>> {
        self.maybe_hot_reload();
        let guard = self.schemas.read().unwrap_or_else(|e| e.into_inner());
        guard.get(&normalize_domain_id(domain_id)).cloned()
    }

    /// The schema used when no domain is configured.
    pub fn get_default_schema(&self) -> Option<Arc<DomainSchema>> {
        self.get_schema_or_none(DEFAULT_FALLBACK_DOMAIN).or_else(|| {
            self.maybe_hot_reload();
            let guard = self.schemas.read().unwrap_or_else(|e| e.into_inner());
            let mut ids: Vec<&String> = guard.keys().collect();
            ids.sort();
            ids.first().and_then(|id| guard.get(*id).cloned())
        })
    }

    pub fn has_domain(&self, domain_id: &str) -> bool {
        self.get_schema_or_none(domain_id).is_some()
    }

    pub fn list_domains(&self) -> Vec<DomainSummary> {
        self.maybe_hot_reload();
        let guard = self.schemas.read().unwrap_or_else(|e| e.into_inner());
        let mut summaries: Vec<DomainSummary> = guard.values().map(|s| s.summary()).collect();
        summaries.sort_by(|a, b| a.domain_id.cmp(&b.domain_id));
        summaries
    }

    pub fn list_domain_ids(&self) -> Vec<String> {
        self.list_domains().into_iter().map(|d| d.domain_id).collect()
    }

    /// Schemas that extract the given entity type.
    pub fn schemas_for_entity_type(&self, entity_type: &str) -> Vec<Arc<DomainSchema>> {
        self.maybe_hot_reload();
        let guard = self.schemas.read().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<Arc<DomainSchema>> = guard
            .values()
            .filter(|s| s.supports_entity_type(entity_type))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.domain_id.cmp(&b.domain_id));
        out
    }

    pub fn len(&self) -> usize {
        let guard = self.schemas.read().unwrap_or_else(|e| e.into_inner());
        guard.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn normalize_domain_id(raw: &str) -> String {
    raw.trim().to_lowercase()
}

fn load_directory(dir: &Path) -> Result<HashMap<String, Arc<DomainSchema>>, SchemaLoadError> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| SchemaLoadError::Directory(dir.to_path_buf(), e.to_string()))?;

    let mut schemas = HashMap::new();

    for entry in entries {
        let entry =
            entry.map_err(|e| SchemaLoadError::Directory(dir.to_path_buf(), e.to_string()))?;
        let path = entry.path();
        let is_yaml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"));
        if !is_yaml {
            continue;
        }

        let raw = std::fs::read_to_string(&path)
            .map_err(|e| SchemaLoadError::Io(path.clone(), e.to_string()))?;
        let mut schema: DomainSchema = serde_yaml::from_str(&raw)
            .map_err(|e| SchemaLoadError::Parse(path.clone(), e.to_string()))?;

        schema.domain_id = normalize_domain_id(&schema.domain_id);
        for entity_type in &mut schema.entity_types {
            entity_type.id = entity_type.id.trim().to_lowercase();
        }

        if schemas.contains_key(&schema.domain_id) {
            return Err(SchemaLoadError::Duplicate(schema.domain_id, path));
        }
        schemas.insert(schema.domain_id.clone(), Arc::new(schema));
    }

    Ok(schemas)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::schema::{ConfidenceThresholds, EntityTypeDef};

    fn schema(id: &str, entity_types: &[&str]) -> DomainSchema {
        DomainSchema {
            domain_id: id.to_string(),
            display_name: id.to_string(),
            version: 1,
            description: format!("{id} test domain"),
            entity_types: entity_types
                .iter()
                .map(|t| EntityTypeDef {
                    id: t.to_string(),
                    display_name: t.to_string(),
                    description: None,
                    property_hints: vec![],
                })
                .collect(),
            relationship_types: vec![],
            confidence_thresholds: ConfidenceThresholds::default(),
        }
    }

    #[test]
    fn domain_ids_are_normalized() {
        let registry =
            DomainSchemaRegistry::from_schemas(vec![schema("  Literature_Fiction ", &["person"])]);

        assert!(registry.has_domain("literature_fiction"));
        assert!(registry.has_domain("LITERATURE_FICTION"));
        assert!(!registry.has_domain("nonexistent"));
    }

    #[test]
    fn default_schema_prefers_encyclopedia() {
        let registry = DomainSchemaRegistry::from_schemas(vec![
            schema("aaa_domain", &["thing"]),
            schema("encyclopedia_wiki", &["concept"]),
        ]);

        let default = registry.get_default_schema().unwrap();
        assert_eq!(default.domain_id, "encyclopedia_wiki");
    }

    #[test]
    fn default_falls_back_to_first_sorted_domain() {
        let registry = DomainSchemaRegistry::from_schemas(vec![
            schema("zzz", &["thing"]),
            schema("aaa", &["thing"]),
        ]);

        let default = registry.get_default_schema().unwrap();
        assert_eq!(default.domain_id, "aaa");
    }

    #[test]
    fn lookup_by_entity_type() {
        let registry = DomainSchemaRegistry::from_schemas(vec![
            schema("software", &["function", "class"]),
            schema("fiction", &["person", "place"]),
        ]);

        let hits = registry.schemas_for_entity_type("function");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].domain_id, "software");
    }

    #[test]
    fn loads_yaml_files_from_directory() {
        let dir = std::env::temp_dir().join(format!("kmapper-schemas-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("software.yaml"),
            r#"
domain_id: Software_Docs
display_name: Software Documentation
version: 2
description: API and library documentation
entity_types:
  - id: Function
    display_name: Function
    property_hints: [signature, return_type]
relationship_types:
  - id: calls
    display_name: Calls
    source_types: [function]
    target_types: [function]
confidence_thresholds:
  entity_extraction: 0.6
  relationship_extraction: 0.5
"#,
        )
        .unwrap();
        std::fs::write(dir.join("notes.txt"), "ignored").unwrap();

        let registry = DomainSchemaRegistry::load(&dir).unwrap();
        assert_eq!(registry.len(), 1);

        let schema = registry.get_schema("software_docs").unwrap();
        assert_eq!(schema.version, 2);
        assert!(schema.supports_entity_type("function"));
        assert_eq!(schema.confidence_thresholds.entity_extraction, 0.6);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn unknown_domain_errors() {
        let registry = DomainSchemaRegistry::from_schemas(vec![]);
        let err = registry.get_schema("missing").unwrap_err();
        assert!(matches!(err, SchemaLoadError::UnknownDomain(_)));
    }
}
