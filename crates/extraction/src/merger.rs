//! Cross-chunk entity merging.
//!
//! Chunked extraction emits the same real-world entity several times under
//! slightly different names. The merger collapses per-chunk entity lists
//! into one deduplicated set per document:
//!
//! 1. Simple pass: name similarity at or above `high_threshold` with
//!    matching types merges automatically.
//! 2. Ambiguous pass: similarity in `[low_threshold, high_threshold)` is
//!    handed to an optional LLM resolver; anything unresolved stays
//!    separate (false merges are worse than missed merges).
//! 3. Relationship remap: endpoints are rewritten to surviving names and
//!    parallel relationships deduplicated keeping the highest confidence.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use strsim::jaro_winkler;
use tracing::{debug, info, warn};

use kmapper_inference::{InferenceProvider, InferenceRequest, ProviderError};

/// Entity emitted by extraction over a single chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkEntity {
    pub name: String,
    pub normalized_name: String,
    pub entity_type: String,
    pub description: Option<String>,
    pub properties: JsonValue,
    pub confidence: f64,
    pub source_chunk: u32,
}

/// Relationship emitted by extraction over a single chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRelationship {
    pub source_entity_name: String,
    pub target_entity_name: String,
    pub relationship_type: String,
    pub confidence: f64,
    pub context: Option<String>,
    pub source_chunk: u32,
}

/// A pair the simple pass could not decide.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AmbiguousPair {
    pub left: ChunkEntity,
    pub right: ChunkEntity,
    pub similarity: f64,
}

/// One resolver decision per ambiguous pair (index into the submitted batch).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MergeDecision {
    pub pair_index: usize,
    pub should_merge: bool,
    #[serde(default)]
    pub merged_name: Option<String>,
    #[serde(default = "default_decision_confidence")]
    pub confidence: f64,
}

fn default_decision_confidence() -> f64 {
    0.8
}

/// Resolves ambiguous entity pairs (typically with an LLM).
#[async_trait]
pub trait MergeResolver: Send + Sync {
    async fn resolve(&self, pairs: &[AmbiguousPair]) -> Result<Vec<MergeDecision>, ProviderError>;
}

/// Result of a cross-chunk merge.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub entities: Vec<ChunkEntity>,
    pub relationships: Vec<ChunkRelationship>,
    /// original name → surviving name, for every collapsed entity.
    pub name_remap: HashMap<String, String>,
    pub simple_merges: usize,
    pub llm_merges: usize,
}

/// Deduplicates entities and relationships across chunks.
#[derive(Debug, Clone)]
pub struct CrossChunkMerger {
    high_threshold: f64,
    low_threshold: f64,
    batch_size: usize,
}

impl Default for CrossChunkMerger {
    fn default() -> Self {
        Self {
            high_threshold: 0.90,
            low_threshold: 0.70,
            batch_size: 10,
        }
    }
}

impl CrossChunkMerger {
    pub fn new(high_threshold: f64, low_threshold: f64) -> Self {
        Self {
            high_threshold,
            low_threshold,
            batch_size: 10,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Merge without a resolver: ambiguous pairs are conservatively kept
    /// separate.
    pub fn merge(
        &self,
        entities: Vec<ChunkEntity>,
        relationships: Vec<ChunkRelationship>,
    ) -> MergeOutcome {
        let (mut outcome, _ambiguous) = self.simple_pass(entities);
        outcome.relationships = self.remap_relationships(relationships, &outcome);
        outcome
    }

    /// Merge with an LLM resolver for ambiguous pairs.
    pub async fn merge_with_resolver(
        &self,
        entities: Vec<ChunkEntity>,
        relationships: Vec<ChunkRelationship>,
        resolver: &dyn MergeResolver,
    ) -> MergeOutcome {
        let (mut outcome, ambiguous) = self.simple_pass(entities);

        if !ambiguous.is_empty() {
            info!(candidates = ambiguous.len(), "resolving ambiguous entity pairs");
            for batch in ambiguous.chunks(self.batch_size) {
                match resolver.resolve(batch).await {
                    Ok(decisions) => self.apply_decisions(&mut outcome, batch, &decisions),
                    Err(err) => {
                        // Unreachable resolver means every pair in the batch
                        // stays separate.
                        warn!(error = %err, "merge resolver failed, keeping pairs separate");
                    }
                }
            }
        }

        outcome.relationships = self.remap_relationships(relationships, &outcome);
        outcome
    }

    fn simple_pass(&self, entities: Vec<ChunkEntity>) -> (MergeOutcome, Vec<AmbiguousPair>) {
        let mut kept: Vec<ChunkEntity> = Vec::new();
        let mut name_remap: HashMap<String, String> = HashMap::new();
        let mut ambiguous: Vec<AmbiguousPair> = Vec::new();
        let mut simple_merges = 0usize;

        for entity in entities {
            let mut merged_into: Option<usize> = None;

            for (i, rep) in kept.iter().enumerate() {
                if rep.entity_type != entity.entity_type {
                    continue;
                }
                let similarity = jaro_winkler(&rep.normalized_name, &entity.normalized_name);
                if similarity >= self.high_threshold {
                    merged_into = Some(i);
                    break;
                }
                if similarity >= self.low_threshold {
                    ambiguous.push(AmbiguousPair {
                        left: rep.clone(),
                        right: entity.clone(),
                        similarity,
                    });
                }
            }

            match merged_into {
                Some(i) => {
                    simple_merges += 1;
                    let previous_rep_name = kept[i].name.clone();
                    let survivor_name = merge_into(&mut kept[i], entity.clone());
                    name_remap.insert(entity.name, survivor_name.clone());
                    if previous_rep_name != survivor_name {
                        // The representative was renamed; repoint everything
                        // that mapped to its old name.
                        for target in name_remap.values_mut() {
                            if *target == previous_rep_name {
                                *target = survivor_name.clone();
                            }
                        }
                        name_remap.insert(previous_rep_name, survivor_name);
                    }
                }
                None => kept.push(entity),
            }
        }

        debug!(
            kept = kept.len(),
            merged = simple_merges,
            ambiguous = ambiguous.len(),
            "simple merge pass finished"
        );

        (
            MergeOutcome {
                entities: kept,
                relationships: vec![],
                name_remap,
                simple_merges,
                llm_merges: 0,
            },
            ambiguous,
        )
    }

    fn apply_decisions(
        &self,
        outcome: &mut MergeOutcome,
        batch: &[AmbiguousPair],
        decisions: &[MergeDecision],
    ) {
        for decision in decisions {
            if !decision.should_merge {
                continue;
            }
            let Some(pair) = batch.get(decision.pair_index) else {
                warn!(index = decision.pair_index, "resolver returned out-of-range pair index");
                continue;
            };

            let left_idx = outcome
                .entities
                .iter()
                .position(|e| e.name == pair.left.name);
            let right_idx = outcome
                .entities
                .iter()
                .position(|e| e.name == pair.right.name);

            // A pair member may already have been collapsed by an earlier
            // decision in this batch.
            let (Some(left_idx), Some(right_idx)) = (left_idx, right_idx) else {
                continue;
            };
            if left_idx == right_idx {
                continue;
            }

            let removed = outcome.entities.remove(right_idx);
            let left_idx = if right_idx < left_idx { left_idx - 1 } else { left_idx };

            let removed_name = removed.name.clone();
            let previous_rep_name = outcome.entities[left_idx].name.clone();
            let mut survivor_name = merge_into(&mut outcome.entities[left_idx], removed);

            if let Some(name) = &decision.merged_name {
                if !name.trim().is_empty() {
                    outcome.entities[left_idx].name = name.trim().to_string();
                    survivor_name = outcome.entities[left_idx].name.clone();
                }
            }

            for target in outcome.name_remap.values_mut() {
                if *target == removed_name || *target == previous_rep_name {
                    *target = survivor_name.clone();
                }
            }
            outcome.name_remap.insert(removed_name, survivor_name.clone());
            if previous_rep_name != survivor_name {
                outcome.name_remap.insert(previous_rep_name, survivor_name);
            }
            outcome.llm_merges += 1;
        }
    }

    fn remap_relationships(
        &self,
        relationships: Vec<ChunkRelationship>,
        outcome: &MergeOutcome,
    ) -> Vec<ChunkRelationship> {
        let surviving: HashMap<&str, ()> = outcome
            .entities
            .iter()
            .map(|e| (e.name.as_str(), ()))
            .collect();

        let resolve = |name: &str| -> Option<String> {
            if surviving.contains_key(name) {
                return Some(name.to_string());
            }
            outcome.name_remap.get(name).cloned()
        };

        let mut best: HashMap<(String, String, String), ChunkRelationship> = HashMap::new();

        for mut rel in relationships {
            let (Some(source), Some(target)) = (
                resolve(&rel.source_entity_name),
                resolve(&rel.target_entity_name),
            ) else {
                debug!(
                    source = %rel.source_entity_name,
                    target = %rel.target_entity_name,
                    "dropping relationship with unresolved endpoint"
                );
                continue;
            };

            if source == target {
                continue;
            }

            rel.source_entity_name = source.clone();
            rel.target_entity_name = target.clone();

            let key = (source, target, rel.relationship_type.clone());
            match best.get(&key) {
                Some(existing) if existing.confidence >= rel.confidence => {}
                _ => {
                    best.insert(key, rel);
                }
            }
        }

        let mut out: Vec<ChunkRelationship> = best.into_values().collect();
        out.sort_by(|a, b| {
            (&a.source_entity_name, &a.target_entity_name, &a.relationship_type).cmp(&(
                &b.source_entity_name,
                &b.target_entity_name,
                &b.relationship_type,
            ))
        });
        out
    }
}

/// Merge `incoming` into the representative, keeping the stronger identity.
///
/// Winner: higher extraction confidence, then longer canonical name. Returns
/// the surviving name.
fn merge_into(rep: &mut ChunkEntity, incoming: ChunkEntity) -> String {
    let incoming_wins = incoming.confidence > rep.confidence
        || (incoming.confidence == rep.confidence && incoming.name.len() > rep.name.len());

    if incoming_wins {
        let old_description = rep.description.take();
        *rep = incoming;
        if rep.description.is_none() {
            rep.description = old_description;
        }
    } else {
        rep.confidence = rep.confidence.max(incoming.confidence);
        if rep.description.is_none() {
            rep.description = incoming.description;
        }
    }

    rep.name.clone()
}

const RESOLVER_SYSTEM_PROMPT: &str = "You are an entity resolution expert analyzing entities extracted from a document. \
For each candidate pair, decide whether the two references denote the same real-world entity. \
BE CONSERVATIVE: only merge when confident; false positives are worse than false negatives. \
Respond with ONLY a JSON array of objects, one per pair, in this exact format: \
[{\"pair_index\": <0-based index>, \"should_merge\": <true|false>, \"merged_name\": \"<best canonical name or null>\", \"confidence\": <0.0-1.0>}]";

/// LLM-backed resolver for ambiguous pairs.
pub struct LlmMergeResolver<P> {
    provider: P,
    model: String,
}

impl<P: InferenceProvider> LlmMergeResolver<P> {
    pub fn new(provider: P, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }

    fn build_prompt(pairs: &[AmbiguousPair]) -> String {
        let mut prompt = String::from("Candidate entity pairs:\n");
        for (i, pair) in pairs.iter().enumerate() {
            prompt.push_str(&format!(
                "{}. A: \"{}\" [{}] {} | B: \"{}\" [{}] {}\n",
                i,
                pair.left.name,
                pair.left.entity_type,
                pair.left.description.as_deref().unwrap_or(""),
                pair.right.name,
                pair.right.entity_type,
                pair.right.description.as_deref().unwrap_or(""),
            ));
        }
        prompt.push_str("\nReturn one decision per pair as a JSON array.");
        prompt
    }

    fn parse_decisions(content: &str, pair_count: usize) -> Vec<MergeDecision> {
        let start = content.find('[');
        let end = content.rfind(']');
        let (Some(start), Some(end)) = (start, end) else {
            warn!("no JSON array in resolver response");
            return vec![];
        };
        if end < start {
            return vec![];
        }

        match serde_json::from_str::<Vec<MergeDecision>>(&content[start..=end]) {
            Ok(decisions) => decisions
                .into_iter()
                .filter(|d| d.pair_index < pair_count)
                .collect(),
            Err(err) => {
                warn!(error = %err, "failed to parse resolver decisions");
                vec![]
            }
        }
    }
}

#[async_trait]
impl<P: InferenceProvider> MergeResolver for LlmMergeResolver<P> {
    async fn resolve(&self, pairs: &[AmbiguousPair]) -> Result<Vec<MergeDecision>, ProviderError> {
        let request = InferenceRequest::new(Self::build_prompt(pairs))
            .with_model(self.model.clone())
            .with_system_prompt(RESOLVER_SYSTEM_PROMPT)
            .with_temperature(0.1)
            .with_max_tokens(1024);

        let response = self.provider.infer(request).await?;
        Ok(Self::parse_decisions(&response.content, pairs.len()))
    }
}
