//! Blocking engine: candidate generation without the O(n²) scan.
//!
//! Candidates are retrieved by OR-combining selective predicates against
//! the entity table, filtered to canonical same-tenant rows and capped at
//! `max_block_size + 1` (the extra row detects truncation). Which keys
//! matched each candidate is tracked for provenance and diagnostics.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use kmapper_consolidation::{ConsolidationConfig, soundex};
use kmapper_core::{EntityId, TenantId};

use crate::read_model::{BlockingQuery, EntityRecord, EntityStore, ReadModelError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockingStrategy {
    /// Same first `min_prefix_length` characters of `normalized_name`.
    Prefix,
    /// Same `entity_type`.
    EntityType,
    /// Same soundex code (generated column on the database side).
    Soundex,
    /// Trigram similarity via the store's trigram operator.
    Trigram,
}

impl BlockingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockingStrategy::Prefix => "prefix",
            BlockingStrategy::EntityType => "entity_type",
            BlockingStrategy::Soundex => "soundex",
            BlockingStrategy::Trigram => "trigram",
        }
    }
}

/// Result of one blocking query.
#[derive(Debug, Clone)]
pub struct BlockingResult {
    pub candidates: Vec<EntityRecord>,
    pub strategies_used: Vec<BlockingStrategy>,
    /// candidate id → which keys matched it.
    pub matched_keys: HashMap<EntityId, Vec<String>>,
    /// key name → how many candidates it contributed.
    pub block_sizes: HashMap<String, u64>,
    pub total_candidates: usize,
    pub truncated: bool,
}

/// Per-tenant blocking statistics for monitoring and tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockingStatistics {
    pub total_canonical_entities: u64,
    pub entities_by_type: HashMap<String, u64>,
    pub distinct_soundex_codes: u64,
    pub strategies_configured: Vec<String>,
    pub max_block_size: usize,
    pub min_prefix_length: usize,
}

/// Generates merge candidates for one entity at a time.
#[derive(Debug, Clone)]
pub struct BlockingEngine {
    max_block_size: usize,
    min_prefix_length: usize,
    strategies: Vec<BlockingStrategy>,
}

impl Default for BlockingEngine {
    fn default() -> Self {
        Self {
            max_block_size: 500,
            min_prefix_length: 5,
            strategies: vec![
                BlockingStrategy::Prefix,
                BlockingStrategy::EntityType,
                BlockingStrategy::Soundex,
            ],
        }
    }
}

impl BlockingEngine {
    pub fn new(max_block_size: usize, min_prefix_length: usize) -> Self {
        Self {
            max_block_size,
            min_prefix_length,
            ..Default::default()
        }
    }

    pub fn with_strategies(mut self, strategies: Vec<BlockingStrategy>) -> Self {
        self.strategies = strategies;
        self
    }

    /// Find candidates for `entity`, honoring the tenant config's
    /// `max_block_size` when given.
    pub async fn find_candidates(
        &self,
        store: &dyn EntityStore,
        entity: &EntityRecord,
        tenant_id: TenantId,
        config: Option<&ConsolidationConfig>,
    ) -> Result<BlockingResult, ReadModelError> {
        let max_size = config.map_or(self.max_block_size, |c| c.max_block_size);

        let mut query = BlockingQuery {
            exclude_id: Some(entity.id),
            limit: max_size + 1,
            ..Default::default()
        };
        let mut strategies_used = Vec::new();

        for strategy in &self.strategies {
            match strategy {
                BlockingStrategy::Prefix => {
                    let prefix: String = entity
                        .normalized_name
                        .chars()
                        .take(self.min_prefix_length)
                        .collect();
                    if prefix.chars().count() < self.min_prefix_length {
                        debug!(name = %entity.normalized_name, "name too short for prefix blocking");
                        continue;
                    }
                    query.prefix = Some(prefix);
                    strategies_used.push(*strategy);
                }
                BlockingStrategy::EntityType => {
                    query.entity_type = Some(entity.entity_type.clone());
                    strategies_used.push(*strategy);
                }
                BlockingStrategy::Soundex => {
                    let code = soundex(&entity.name);
                    if code.is_empty() {
                        continue;
                    }
                    query.soundex = Some(code);
                    strategies_used.push(*strategy);
                }
                BlockingStrategy::Trigram => {
                    if entity.normalized_name.is_empty() {
                        continue;
                    }
                    query.trigram_of = Some(entity.normalized_name.clone());
                    strategies_used.push(*strategy);
                }
            }
        }

        if query.is_empty() {
            warn!(entity_id = %entity.id, name = %entity.name, "no blocking conditions could be built");
            return Ok(BlockingResult {
                candidates: vec![],
                strategies_used: vec![],
                matched_keys: HashMap::new(),
                block_sizes: HashMap::new(),
                total_candidates: 0,
                truncated: false,
            });
        }

        let mut candidates = store.find_blocking_candidates(tenant_id, &query).await?;

        let truncated = candidates.len() > max_size;
        if truncated {
            candidates.truncate(max_size);
            debug!(
                entity_id = %entity.id,
                max_size,
                "blocking result truncated"
            );
        }

        let mut matched_keys = HashMap::with_capacity(candidates.len());
        let mut block_sizes: HashMap<String, u64> = HashMap::new();
        for candidate in &candidates {
            let keys = self.matching_keys(entity, candidate);
            for key in &keys {
                *block_sizes.entry(key.clone()).or_default() += 1;
            }
            matched_keys.insert(candidate.id, keys);
        }

        Ok(BlockingResult {
            total_candidates: candidates.len(),
            candidates,
            strategies_used,
            matched_keys,
            block_sizes,
            truncated,
        })
    }

    /// Which blocking keys link the pair (prefix/type/soundex; trigram
    /// matches are implicit in the retrieval).
    fn matching_keys(&self, entity: &EntityRecord, candidate: &EntityRecord) -> Vec<String> {
        let mut matched = Vec::new();

        let entity_prefix: String = entity
            .normalized_name
            .chars()
            .take(self.min_prefix_length)
            .collect();
        let candidate_prefix: String = candidate
            .normalized_name
            .chars()
            .take(self.min_prefix_length)
            .collect();
        if !entity_prefix.is_empty() && entity_prefix == candidate_prefix {
            matched.push("prefix".to_string());
        }

        if entity.entity_type == candidate.entity_type {
            matched.push("entity_type".to_string());
        }

        let entity_soundex = soundex(&entity.name);
        if !entity_soundex.is_empty() && entity_soundex == soundex(&candidate.name) {
            matched.push("soundex".to_string());
        }

        matched
    }

    pub async fn statistics(
        &self,
        store: &dyn EntityStore,
        tenant_id: TenantId,
    ) -> Result<BlockingStatistics, ReadModelError> {
        Ok(BlockingStatistics {
            total_canonical_entities: store.count_canonical(tenant_id).await?,
            entities_by_type: store.count_canonical_by_type(tenant_id).await?,
            distinct_soundex_codes: store.distinct_soundex_count(tenant_id).await?,
            strategies_configured: self.strategies.iter().map(|s| s.as_str().to_string()).collect(),
            max_block_size: self.max_block_size,
            min_prefix_length: self.min_prefix_length,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use kmapper_core::PageId;

    use crate::read_model::InMemoryReadModel;

    fn record(tenant: TenantId, name: &str, entity_type: &str) -> EntityRecord {
        EntityRecord {
            id: EntityId::new(),
            tenant_id: tenant,
            source_page_id: Some(PageId::new()),
            entity_type: entity_type.to_string(),
            name: name.to_string(),
            normalized_name: name.to_lowercase(),
            description: None,
            properties: serde_json::json!({}),
            extraction_method: "llm".to_string(),
            confidence: 0.9,
            is_canonical: true,
            is_alias_of: None,
            graph_node_id: None,
            synced_to_graph: false,
            synced_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn candidates_never_include_source_or_foreign_tenants() {
        let store = InMemoryReadModel::new();
        let tenant = TenantId::new();
        let source = record(tenant, "ACME Corp", "ORG");
        let candidate = record(tenant, "ACME Corporation", "ORG");
        let foreign = record(TenantId::new(), "ACME Corp", "ORG");

        for r in [&source, &candidate, &foreign] {
            store.upsert_entity(r.clone()).await.unwrap();
        }

        let engine = BlockingEngine::default();
        let result = engine
            .find_candidates(&store, &source, tenant, None)
            .await
            .unwrap();

        assert_eq!(result.total_candidates, 1);
        assert_eq!(result.candidates[0].id, candidate.id);
        assert!(result.matched_keys[&candidate.id].contains(&"prefix".to_string()));
        assert!(result.matched_keys[&candidate.id].contains(&"entity_type".to_string()));
    }

    #[tokio::test]
    async fn truncation_is_detected_via_extra_row() {
        let store = InMemoryReadModel::new();
        let tenant = TenantId::new();
        let source = record(tenant, "Widget", "ORG");
        store.upsert_entity(source.clone()).await.unwrap();

        for i in 0..5 {
            store
                .upsert_entity(record(tenant, &format!("Entity {i}"), "ORG"))
                .await
                .unwrap();
        }

        let config = ConsolidationConfig {
            max_block_size: 3,
            ..Default::default()
        };
        let engine = BlockingEngine::default();
        let result = engine
            .find_candidates(&store, &source, tenant, Some(&config))
            .await
            .unwrap();

        assert!(result.truncated);
        assert_eq!(result.total_candidates, 3);
    }

    #[tokio::test]
    async fn short_names_skip_prefix_but_keep_other_strategies() {
        let store = InMemoryReadModel::new();
        let tenant = TenantId::new();
        let source = record(tenant, "Ab", "ORG");
        let same_type = record(tenant, "Completely Different", "ORG");
        store.upsert_entity(source.clone()).await.unwrap();
        store.upsert_entity(same_type.clone()).await.unwrap();

        let engine = BlockingEngine::default();
        let result = engine
            .find_candidates(&store, &source, tenant, None)
            .await
            .unwrap();

        assert!(!result.strategies_used.contains(&BlockingStrategy::Prefix));
        assert!(result.strategies_used.contains(&BlockingStrategy::EntityType));
        assert_eq!(result.total_candidates, 1);
    }

    #[tokio::test]
    async fn statistics_summarize_the_tenant() {
        let store = InMemoryReadModel::new();
        let tenant = TenantId::new();
        store.upsert_entity(record(tenant, "Robert", "PERSON")).await.unwrap();
        store.upsert_entity(record(tenant, "Rupert", "PERSON")).await.unwrap();
        store.upsert_entity(record(tenant, "ACME", "ORG")).await.unwrap();

        let engine = BlockingEngine::default();
        let stats = engine.statistics(&store, tenant).await.unwrap();

        assert_eq!(stats.total_canonical_entities, 3);
        assert_eq!(stats.entities_by_type["PERSON"], 2);
        // Robert and Rupert share a soundex code.
        assert_eq!(stats.distinct_soundex_codes, 2);
    }
}
